use rusqlite::Connection;

pub fn initialize(conn: &Connection) {
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
    conn.execute_batch("PRAGMA foreign_keys=ON;").ok();

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL,
            files TEXT,
            color TEXT,
            shared INTEGER NOT NULL DEFAULT 0,
            parent_id INTEGER REFERENCES posts(id) ON DELETE SET NULL,
            children_count INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            sticky INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tag_post_assoc (
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            PRIMARY KEY (tag_id, post_id)
        );

        CREATE INDEX IF NOT EXISTS idx_posts_color ON posts(color);
        CREATE INDEX IF NOT EXISTS idx_posts_parent_id ON posts(parent_id);
        CREATE INDEX IF NOT EXISTS idx_posts_deleted_at ON posts(deleted_at);
        CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);
        CREATE INDEX IF NOT EXISTS idx_posts_updated_at ON posts(updated_at);
        CREATE INDEX IF NOT EXISTS idx_tag_post_assoc_post_id ON tag_post_assoc(post_id);
        ",
    )
    .expect("Failed to initialize database");

    // Migration: add children_count column to posts
    let has_children_count: bool = conn
        .prepare("SELECT children_count FROM posts LIMIT 0")
        .is_ok();
    if !has_children_count {
        conn.execute_batch("ALTER TABLE posts ADD COLUMN children_count INTEGER NOT NULL DEFAULT 0;")
            .ok();
    }
}

/// Drops every table owned by the service. Used by the `drop-tables` CLI
/// sub-command after an interactive confirmation.
pub fn drop_tables(conn: &Connection) {
    conn.execute_batch(
        "
        DROP TABLE IF EXISTS tag_post_assoc;
        DROP TABLE IF EXISTS tags;
        DROP TABLE IF EXISTS posts;
        ",
    )
    .expect("Failed to drop tables");
}
