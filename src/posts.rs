//! Post persistence: creation with hashtag-driven tag linkage, field-diff
//! updates, the soft-delete lifecycle, keyset-paginated filtering, and the
//! calendar aggregates.
//!
//! `children_count` is denormalized: it must equal the number of live posts
//! whose `parent_id` points at the row, so every create/delete/restore/
//! reparent transition adjusts it inside the same transaction.

use std::collections::HashSet;

use chrono::{FixedOffset, NaiveDate, NaiveTime, TimeZone};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::{bad_request, not_found, ServiceError};
use crate::model::{extract_hashtags, ms_now, Post};
use crate::tags;

pub struct NewPost {
    pub content: String,
    pub files: Option<String>,
    pub color: Option<String>,
    pub shared: bool,
    pub parent_id: Option<i64>,
}

/// An update field that distinguishes "absent from the payload" from an
/// explicit null.
#[derive(Debug, Clone, Default)]
pub enum Patch<T> {
    #[default]
    Absent,
    Null,
    Value(T),
}

#[derive(Default)]
pub struct PostPatch {
    pub content: Option<String>,
    pub shared: Option<bool>,
    pub files: Patch<String>,
    pub color: Patch<String>,
    pub parent_id: Patch<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

impl OrderBy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created_at" => Some(OrderBy::CreatedAt),
            "updated_at" => Some(OrderBy::UpdatedAt),
            "deleted_at" => Some(OrderBy::DeletedAt),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            OrderBy::CreatedAt => "created_at",
            OrderBy::UpdatedAt => "updated_at",
            OrderBy::DeletedAt => "deleted_at",
        }
    }
}

pub struct PostFilter {
    pub cursor: Option<i64>,
    pub deleted: bool,
    /// `Some(None)` filters for posts without a parent.
    pub parent_id: Option<Option<i64>>,
    pub color: Option<String>,
    pub tag: Option<String>,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub shared: Option<bool>,
    pub has_files: Option<bool>,
    pub order_by: OrderBy,
    pub ascending: bool,
    pub per_page: i64,
}

impl Default for PostFilter {
    fn default() -> Self {
        PostFilter {
            cursor: None,
            deleted: false,
            parent_id: None,
            color: None,
            tag: None,
            start_date: None,
            end_date: None,
            shared: None,
            has_files: None,
            order_by: OrderBy::CreatedAt,
            ascending: false,
            per_page: 20,
        }
    }
}

const SELECT_COLUMNS: &str =
    "p.id, p.content, p.files, p.color, p.shared, p.parent_id, p.children_count, \
     p.deleted_at, p.created_at, p.updated_at";

pub fn get(conn: &Connection, id: i64) -> Result<Post, ServiceError> {
    let sql = format!("SELECT {} FROM posts WHERE id = ?1", Post::COLUMNS);
    conn.query_row(&sql, [id], Post::from_row)
        .optional()?
        .ok_or_else(|| not_found("post not found"))
}

fn parent_exists(conn: &Connection, id: i64) -> Result<bool, ServiceError> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM posts WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn bump_children_count(conn: &Connection, id: i64, delta: i64) -> Result<(), ServiceError> {
    conn.execute(
        "UPDATE posts SET children_count = children_count + ?1 WHERE id = ?2",
        params![delta, id],
    )?;
    Ok(())
}

fn link_tags_from_content(conn: &Connection, post_id: i64, content: &str) -> Result<(), ServiceError> {
    for name in extract_hashtags(content) {
        let tag = tags::find_or_create(conn, &name)?;
        conn.execute(
            "INSERT OR IGNORE INTO tag_post_assoc (tag_id, post_id) VALUES (?1, ?2)",
            params![tag.id, post_id],
        )?;
    }
    Ok(())
}

/// Creates a post, attaching every hashtag referenced in the content and
/// crediting the parent with one more live child.
pub fn create(conn: &mut Connection, new: &NewPost) -> Result<Post, ServiceError> {
    let tx = conn.transaction()?;

    if let Some(parent_id) = new.parent_id {
        if !parent_exists(&tx, parent_id)? {
            return Err(not_found("parent not exist"));
        }
    }

    let now = ms_now();
    tx.execute(
        "INSERT INTO posts (content, files, color, shared, parent_id, children_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
        params![new.content, new.files, new.color, new.shared, new.parent_id, now],
    )?;
    let id = tx.last_insert_rowid();

    link_tags_from_content(&tx, id, &new.content)?;

    if let Some(parent_id) = new.parent_id {
        bump_children_count(&tx, parent_id, 1)?;
    }

    let post = get(&tx, id)?;
    tx.commit()?;
    Ok(post)
}

/// Replaces the post's tag set with the hashtags of the new content:
/// associations that survive stay untouched, the rest are diffed in and out.
fn retag_from_content(conn: &Connection, post_id: i64, content: &str) -> Result<(), ServiceError> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name FROM tags t
         JOIN tag_post_assoc tpa ON tpa.tag_id = t.id
         WHERE tpa.post_id = ?1",
    )?;
    let current: Vec<(i64, String)> = stmt
        .query_map([post_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let wanted: HashSet<String> = extract_hashtags(content).into_iter().collect();
    let existing: HashSet<&str> = current.iter().map(|(_, name)| name.as_str()).collect();

    for (tag_id, name) in &current {
        if !wanted.contains(name) {
            conn.execute(
                "DELETE FROM tag_post_assoc WHERE tag_id = ?1 AND post_id = ?2",
                params![tag_id, post_id],
            )?;
        }
    }
    for name in &wanted {
        if !existing.contains(name.as_str()) {
            let tag = tags::find_or_create(conn, name)?;
            conn.execute(
                "INSERT OR IGNORE INTO tag_post_assoc (tag_id, post_id) VALUES (?1, ?2)",
                params![tag.id, post_id],
            )?;
        }
    }
    Ok(())
}

/// Applies a field-diff update. Returns the updated post and whether the
/// content actually changed (the caller reindexes only in that case).
pub fn update(conn: &mut Connection, id: i64, patch: &PostPatch) -> Result<(Post, bool), ServiceError> {
    let tx = conn.transaction()?;

    let post = get(&tx, id)?;
    if post.deleted() {
        return Err(not_found("post not found"));
    }

    let mut content_changed = false;

    if let Some(content) = &patch.content {
        content_changed = *content != post.content;
        tx.execute("UPDATE posts SET content = ?1 WHERE id = ?2", params![content, id])?;
        retag_from_content(&tx, id, content)?;
    }

    if let Some(shared) = patch.shared {
        tx.execute("UPDATE posts SET shared = ?1 WHERE id = ?2", params![shared, id])?;
    }

    match &patch.files {
        Patch::Absent => {}
        Patch::Null => {
            tx.execute("UPDATE posts SET files = NULL WHERE id = ?1", [id])?;
        }
        Patch::Value(files) => {
            tx.execute("UPDATE posts SET files = ?1 WHERE id = ?2", params![files, id])?;
        }
    }

    match &patch.color {
        Patch::Absent => {}
        Patch::Null => {
            tx.execute("UPDATE posts SET color = NULL WHERE id = ?1", [id])?;
        }
        Patch::Value(color) => {
            tx.execute("UPDATE posts SET color = ?1 WHERE id = ?2", params![color, id])?;
        }
    }

    match patch.parent_id {
        Patch::Absent => {}
        Patch::Null => {
            if let Some(old_parent) = post.parent_id {
                bump_children_count(&tx, old_parent, -1)?;
                tx.execute("UPDATE posts SET parent_id = NULL WHERE id = ?1", [id])?;
            }
        }
        Patch::Value(new_parent) => {
            if post.parent_id != Some(new_parent) {
                if !parent_exists(&tx, new_parent)? {
                    return Err(not_found("parent not exist"));
                }
                if let Some(old_parent) = post.parent_id {
                    bump_children_count(&tx, old_parent, -1)?;
                }
                bump_children_count(&tx, new_parent, 1)?;
                tx.execute(
                    "UPDATE posts SET parent_id = ?1 WHERE id = ?2",
                    params![new_parent, id],
                )?;
            }
        }
    }

    tx.execute("UPDATE posts SET updated_at = ?1 WHERE id = ?2", params![ms_now(), id])?;

    let updated = get(&tx, id)?;
    tx.commit()?;
    Ok((updated, content_changed))
}

/// Marks a live post deleted and debits its parent. Already-deleted posts
/// are left as they are.
pub fn soft_delete(conn: &mut Connection, id: i64) -> Result<(), ServiceError> {
    let tx = conn.transaction()?;
    let post = get(&tx, id)?;
    if post.deleted() {
        return Ok(());
    }

    let now = ms_now();
    tx.execute(
        "UPDATE posts SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    if let Some(parent_id) = post.parent_id {
        bump_children_count(&tx, parent_id, -1)?;
    }
    tx.commit()?;
    Ok(())
}

/// Clears `deleted_at` and credits the parent back. Live posts are left
/// untouched.
pub fn restore(conn: &mut Connection, id: i64) -> Result<(), ServiceError> {
    let tx = conn.transaction()?;
    let post = get(&tx, id)?;
    if !post.deleted() {
        return Ok(());
    }

    tx.execute(
        "UPDATE posts SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2",
        params![ms_now(), id],
    )?;
    if let Some(parent_id) = post.parent_id {
        bump_children_count(&tx, parent_id, 1)?;
    }
    tx.commit()?;
    Ok(())
}

/// Removes the row. A live post still counts as somebody's child, so the
/// parent is debited first; children are detached by the `ON DELETE SET
/// NULL` foreign key.
pub fn hard_delete(conn: &mut Connection, id: i64) -> Result<(), ServiceError> {
    let tx = conn.transaction()?;
    let post = get(&tx, id)?;

    if !post.deleted() {
        if let Some(parent_id) = post.parent_id {
            bump_children_count(&tx, parent_id, -1)?;
        }
    }
    tx.execute("DELETE FROM posts WHERE id = ?1", [id])?;
    tx.commit()?;
    Ok(())
}

/// Hard-deletes every soft-deleted post, returning their ids so the caller
/// can drop the index entries.
pub fn clear_all(conn: &mut Connection) -> Result<Vec<i64>, ServiceError> {
    let tx = conn.transaction()?;
    let ids = {
        let mut stmt = tx.prepare("SELECT id FROM posts WHERE deleted_at IS NOT NULL")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        rows
    };
    tx.execute("DELETE FROM posts WHERE deleted_at IS NOT NULL", [])?;
    tx.commit()?;
    Ok(ids)
}

/// Hard-deletes posts whose soft-delete timestamp is older than the cutoff.
/// Used by the retention sweeper.
pub fn sweep_expired(conn: &mut Connection, cutoff_ms: i64) -> Result<Vec<i64>, ServiceError> {
    let tx = conn.transaction()?;
    let ids = {
        let mut stmt =
            tx.prepare("SELECT id FROM posts WHERE deleted_at IS NOT NULL AND deleted_at < ?1")?;
        let rows = stmt
            .query_map([cutoff_ms], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        rows
    };
    tx.execute(
        "DELETE FROM posts WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
        [cutoff_ms],
    )?;
    tx.commit()?;
    Ok(ids)
}

/// Live posts matching any of the given ids, in no particular order.
pub fn find_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<Post>, ServiceError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM posts WHERE deleted_at IS NULL AND id IN ({})",
        Post::COLUMNS, placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let posts = stmt
        .query_map(params_from_iter(ids.iter()), Post::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(posts)
}

/// Composes the optional predicates in a fixed order and pages with a keyset
/// cursor on the order field.
pub fn filter_posts(conn: &Connection, filter: &PostFilter) -> Result<Vec<Post>, ServiceError> {
    let mut sql = format!("SELECT DISTINCT {SELECT_COLUMNS} FROM posts p");
    if filter.tag.is_some() {
        sql.push_str(
            " JOIN tag_post_assoc tpa ON tpa.post_id = p.id JOIN tags t ON t.id = tpa.tag_id",
        );
    }

    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if filter.deleted {
        sql.push_str(" WHERE p.deleted_at IS NOT NULL");
    } else {
        sql.push_str(" WHERE p.deleted_at IS NULL");
    }

    match filter.parent_id {
        None => {}
        Some(None) => sql.push_str(" AND p.parent_id IS NULL"),
        Some(Some(parent_id)) => {
            params.push(Box::new(parent_id));
            sql.push_str(&format!(" AND p.parent_id = ?{}", params.len()));
        }
    }

    if let Some(color) = &filter.color {
        params.push(Box::new(color.clone()));
        sql.push_str(&format!(" AND p.color = ?{}", params.len()));
    }

    if let Some(tag) = &filter.tag {
        params.push(Box::new(tag.clone()));
        let n = params.len();
        params.push(Box::new(format!("{tag}/%")));
        sql.push_str(&format!(" AND (t.name = ?{} OR t.name LIKE ?{})", n, params.len()));
    }

    if let Some(start_date) = filter.start_date {
        params.push(Box::new(start_date));
        sql.push_str(&format!(" AND p.created_at >= ?{}", params.len()));
    }

    if let Some(end_date) = filter.end_date {
        params.push(Box::new(end_date));
        sql.push_str(&format!(" AND p.created_at <= ?{}", params.len()));
    }

    if let Some(shared) = filter.shared {
        params.push(Box::new(shared));
        sql.push_str(&format!(" AND p.shared = ?{}", params.len()));
    }

    if let Some(has_files) = filter.has_files {
        if has_files {
            sql.push_str(" AND p.files IS NOT NULL");
        } else {
            sql.push_str(" AND p.files IS NULL");
        }
    }

    let column = filter.order_by.column();
    if let Some(cursor) = filter.cursor {
        params.push(Box::new(cursor));
        let op = if filter.ascending { ">" } else { "<" };
        sql.push_str(&format!(" AND p.{column} {op} ?{}", params.len()));
    }

    let direction = if filter.ascending { "ASC" } else { "DESC" };
    sql.push_str(&format!(" ORDER BY p.{column} {direction}"));

    params.push(Box::new(filter.per_page));
    sql.push_str(&format!(" LIMIT ?{}", params.len()));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let posts = stmt
        .query_map(param_refs.as_slice(), Post::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(posts)
}

pub fn count(conn: &Connection) -> Result<i64, ServiceError> {
    Ok(conn.query_row(
        "SELECT COUNT(id) FROM posts WHERE deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Number of distinct UTC dates with at least one live post.
pub fn get_active_days(conn: &Connection) -> Result<i64, ServiceError> {
    Ok(conn.query_row(
        "SELECT COUNT(DISTINCT date(created_at / 1000, 'unixepoch'))
         FROM posts WHERE deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Buckets live posts by the local date implied by `offset_minutes` and
/// returns one count per day of the inclusive range, zero-filled.
pub fn get_daily_counts(
    conn: &Connection,
    start_date: NaiveDate,
    end_date: NaiveDate,
    offset_minutes: i32,
) -> Result<Vec<i64>, ServiceError> {
    if end_date < start_date {
        return Ok(Vec::new());
    }

    let tz = FixedOffset::east_opt(offset_minutes * 60)
        .ok_or_else(|| bad_request("timezone offset out of range"))?;
    let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
        .ok_or_else(|| ServiceError::Internal("invalid end-of-day time".to_string()))?;

    let start_ts = tz
        .from_local_datetime(&start_date.and_time(NaiveTime::MIN))
        .single()
        .ok_or_else(|| ServiceError::Internal("ambiguous start date".to_string()))?
        .timestamp_millis();
    let end_ts = tz
        .from_local_datetime(&end_date.and_time(end_of_day))
        .single()
        .ok_or_else(|| ServiceError::Internal("ambiguous end date".to_string()))?
        .timestamp_millis();

    let mut stmt = conn.prepare(
        "SELECT date(created_at / 1000 + ?1, 'unixepoch') AS day, COUNT(id)
         FROM posts
         WHERE deleted_at IS NULL AND created_at BETWEEN ?2 AND ?3
         GROUP BY day",
    )?;
    let counts: std::collections::HashMap<String, i64> = stmt
        .query_map(params![i64::from(offset_minutes) * 60, start_ts, end_ts], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?;

    Ok(start_date
        .iter_days()
        .take_while(|day| *day <= end_date)
        .map(|day| {
            counts
                .get(&day.format("%Y-%m-%d").to_string())
                .copied()
                .unwrap_or(0)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::initialize(&conn);
        conn
    }

    fn new_post(content: &str) -> NewPost {
        NewPost {
            content: content.to_string(),
            files: None,
            color: None,
            shared: false,
            parent_id: None,
        }
    }

    fn create_simple(conn: &mut Connection, content: &str) -> Post {
        create(conn, &new_post(content)).unwrap()
    }

    fn create_child(conn: &mut Connection, parent_id: i64) -> Post {
        let mut post = new_post("child");
        post.parent_id = Some(parent_id);
        create(conn, &post).unwrap()
    }

    #[test]
    fn create_links_hashtags() {
        let mut c = conn();
        let post = create_simple(
            &mut c,
            r#"<p><span class="hash-tag">#rust</span> note</p>"#,
        );
        assert_eq!(tags::names_for_post(&c, post.id).unwrap(), vec!["rust"]);
    }

    #[test]
    fn create_with_missing_parent_fails() {
        let mut c = conn();
        let mut post = new_post("orphan");
        post.parent_id = Some(999);
        assert!(matches!(create(&mut c, &post), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn children_count_follows_the_lifecycle() {
        let mut c = conn();
        let parent = create_simple(&mut c, "parent");
        let a = create_child(&mut c, parent.id);
        let b = create_child(&mut c, parent.id);
        assert_eq!(get(&c, parent.id).unwrap().children_count, 2);

        soft_delete(&mut c, a.id).unwrap();
        assert_eq!(get(&c, parent.id).unwrap().children_count, 1);

        // Deleting twice must not debit the parent twice.
        soft_delete(&mut c, a.id).unwrap();
        assert_eq!(get(&c, parent.id).unwrap().children_count, 1);

        restore(&mut c, a.id).unwrap();
        assert_eq!(get(&c, parent.id).unwrap().children_count, 2);

        hard_delete(&mut c, b.id).unwrap();
        assert_eq!(get(&c, parent.id).unwrap().children_count, 1);
    }

    #[test]
    fn reparenting_moves_the_count() {
        let mut c = conn();
        let old_parent = create_simple(&mut c, "old");
        let new_parent = create_simple(&mut c, "new");
        let child = create_child(&mut c, old_parent.id);

        let patch = PostPatch { parent_id: Patch::Value(new_parent.id), ..Default::default() };
        update(&mut c, child.id, &patch).unwrap();
        assert_eq!(get(&c, old_parent.id).unwrap().children_count, 0);
        assert_eq!(get(&c, new_parent.id).unwrap().children_count, 1);

        let patch = PostPatch { parent_id: Patch::Null, ..Default::default() };
        update(&mut c, child.id, &patch).unwrap();
        assert_eq!(get(&c, new_parent.id).unwrap().children_count, 0);
        assert!(get(&c, child.id).unwrap().parent_id.is_none());
    }

    #[test]
    fn update_replaces_the_tag_set() {
        let mut c = conn();
        let post = create_simple(
            &mut c,
            r#"<span class="hash-tag">#old</span> <span class="hash-tag">#kept</span>"#,
        );
        let patch = PostPatch {
            content: Some(
                r#"<span class="hash-tag">#kept</span> <span class="hash-tag">#new</span>"#
                    .to_string(),
            ),
            ..Default::default()
        };
        let (_, changed) = update(&mut c, post.id, &patch).unwrap();
        assert!(changed);
        assert_eq!(
            tags::names_for_post(&c, post.id).unwrap(),
            vec!["kept", "new"]
        );
    }

    #[test]
    fn unchanged_content_is_reported() {
        let mut c = conn();
        let post = create_simple(&mut c, "same text");
        let patch = PostPatch { content: Some("same text".to_string()), ..Default::default() };
        let (_, changed) = update(&mut c, post.id, &patch).unwrap();
        assert!(!changed);
    }

    #[test]
    fn null_clears_files_and_absent_keeps_them() {
        let mut c = conn();
        let mut post = new_post("with files");
        post.files = Some(r#"[{"url":"/uploads/a.png"}]"#.to_string());
        let post = create(&mut c, &post).unwrap();

        let patch = PostPatch { shared: Some(true), ..Default::default() };
        let (updated, _) = update(&mut c, post.id, &patch).unwrap();
        assert!(updated.files.is_some());
        assert!(updated.shared);

        let patch = PostPatch { files: Patch::Null, ..Default::default() };
        let (updated, _) = update(&mut c, post.id, &patch).unwrap();
        assert!(updated.files.is_none());
    }

    #[test]
    fn updating_a_deleted_post_is_not_found() {
        let mut c = conn();
        let post = create_simple(&mut c, "gone");
        soft_delete(&mut c, post.id).unwrap();
        let patch = PostPatch { shared: Some(true), ..Default::default() };
        assert!(matches!(
            update(&mut c, post.id, &patch),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn clear_all_returns_only_deleted_ids() {
        let mut c = conn();
        let keep = create_simple(&mut c, "keep");
        let drop1 = create_simple(&mut c, "drop1");
        let drop2 = create_simple(&mut c, "drop2");
        soft_delete(&mut c, drop1.id).unwrap();
        soft_delete(&mut c, drop2.id).unwrap();

        let mut ids = clear_all(&mut c).unwrap();
        ids.sort();
        assert_eq!(ids, vec![drop1.id, drop2.id]);
        assert!(get(&c, keep.id).is_ok());
        assert!(get(&c, drop1.id).is_err());
    }

    #[test]
    fn sweep_only_removes_old_deletions() {
        let mut c = conn();
        let old = create_simple(&mut c, "old");
        let fresh = create_simple(&mut c, "fresh");
        soft_delete(&mut c, old.id).unwrap();
        soft_delete(&mut c, fresh.id).unwrap();
        c.execute(
            "UPDATE posts SET deleted_at = ?1 WHERE id = ?2",
            params![ms_now() - 90 * 86_400_000, old.id],
        )
        .unwrap();

        let swept = sweep_expired(&mut c, ms_now() - 30 * 86_400_000).unwrap();
        assert_eq!(swept, vec![old.id]);
        assert!(get(&c, fresh.id).is_ok());
    }

    #[test]
    fn filter_composes_predicates() {
        let mut c = conn();
        let mut red = new_post(r#"<span class="hash-tag">#work</span> red"#);
        red.color = Some("red".to_string());
        let red = create(&mut c, &red).unwrap();

        let mut blue = new_post("blue");
        blue.color = Some("blue".to_string());
        blue.shared = true;
        create(&mut c, &blue).unwrap();

        let by_color = filter_posts(
            &c,
            &PostFilter { color: Some("red".to_string()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(by_color.len(), 1);
        assert_eq!(by_color[0].id, red.id);

        let by_shared = filter_posts(
            &c,
            &PostFilter { shared: Some(true), ..Default::default() },
        )
        .unwrap();
        assert_eq!(by_shared.len(), 1);

        let by_tag = filter_posts(
            &c,
            &PostFilter { tag: Some("work".to_string()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, red.id);
    }

    #[test]
    fn tag_filter_includes_descendants() {
        let mut c = conn();
        create_simple(&mut c, r#"<span class="hash-tag">#a/b</span>"#);
        create_simple(&mut c, r#"<span class="hash-tag">#a</span>"#);
        create_simple(&mut c, r#"<span class="hash-tag">#ab</span>"#);

        let found = filter_posts(
            &c,
            &PostFilter { tag: Some("a".to_string()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn cursor_pages_without_overlap() {
        let mut c = conn();
        for i in 0..5 {
            let post = create_simple(&mut c, &format!("post {i}"));
            // Spread created_at so the keyset cursor is unambiguous.
            c.execute(
                "UPDATE posts SET created_at = ?1 WHERE id = ?2",
                params![1_700_000_000_000i64 + i * 1000, post.id],
            )
            .unwrap();
        }

        let first = filter_posts(&c, &PostFilter { per_page: 2, ..Default::default() }).unwrap();
        assert_eq!(first.len(), 2);

        let cursor = first.last().map(|p| p.created_at);
        let second =
            filter_posts(&c, &PostFilter { cursor, per_page: 2, ..Default::default() }).unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|p| p.created_at < first[1].created_at));
    }

    #[test]
    fn deleted_filter_flips_the_population() {
        let mut c = conn();
        let live = create_simple(&mut c, "live");
        let dead = create_simple(&mut c, "dead");
        soft_delete(&mut c, dead.id).unwrap();

        let live_posts = filter_posts(&c, &PostFilter::default()).unwrap();
        assert_eq!(live_posts.len(), 1);
        assert_eq!(live_posts[0].id, live.id);

        let deleted_posts = filter_posts(
            &c,
            &PostFilter { deleted: true, order_by: OrderBy::DeletedAt, ..Default::default() },
        )
        .unwrap();
        assert_eq!(deleted_posts.len(), 1);
        assert_eq!(deleted_posts[0].id, dead.id);
    }

    #[test]
    fn daily_counts_use_the_local_offset() {
        let mut c = conn();
        let tz = FixedOffset::east_opt(480 * 60).unwrap();
        let stamps = [
            tz.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2024, 1, 1, 23, 30, 0).unwrap(),
            tz.with_ymd_and_hms(2024, 1, 3, 1, 0, 0).unwrap(),
        ];
        for stamp in stamps {
            let post = create_simple(&mut c, "dated");
            c.execute(
                "UPDATE posts SET created_at = ?1 WHERE id = ?2",
                params![stamp.timestamp_millis(), post.id],
            )
            .unwrap();
        }

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let counts = get_daily_counts(&c, start, end, 480).unwrap();
        assert_eq!(counts, vec![2, 0, 1]);
    }

    #[test]
    fn active_days_ignores_deleted_posts() {
        let mut c = conn();
        let a = create_simple(&mut c, "one");
        create_simple(&mut c, "two");
        assert_eq!(get_active_days(&c).unwrap(), 1);

        soft_delete(&mut c, a.id).unwrap();
        assert_eq!(get_active_days(&c).unwrap(), 1);
        assert_eq!(count(&c).unwrap(), 1);
    }
}
