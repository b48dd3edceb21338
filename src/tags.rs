//! Tag persistence: the hierarchical tag table, the post association, and
//! the subtree operations (rename-or-merge, soft-delete, restore).
//!
//! Tag names form a path hierarchy through `/`: every tag whose name starts
//! with `parent/` is a descendant of `parent`.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{bad_request, not_found, ServiceError};
use crate::model::{ms_now, Tag};

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Tag>, ServiceError> {
    let sql = format!("SELECT {} FROM tags WHERE name = ?1", Tag::COLUMNS);
    Ok(conn.query_row(&sql, [name], Tag::from_row).optional()?)
}

/// Looks a tag up by name, inserting it first when absent. `INSERT OR
/// IGNORE` keeps the call idempotent when two sessions race on the unique
/// name constraint.
pub fn find_or_create(conn: &Connection, name: &str) -> Result<Tag, ServiceError> {
    if let Some(tag) = find_by_name(conn, name)? {
        return Ok(tag);
    }
    let now = ms_now();
    conn.execute(
        "INSERT OR IGNORE INTO tags (name, sticky, created_at, updated_at) VALUES (?1, 0, ?2, ?2)",
        params![name, now],
    )?;
    find_by_name(conn, name)?
        .ok_or_else(|| ServiceError::Internal(format!("tag {name} vanished after insert")))
}

/// Upserts a tag by name; on conflict only `sticky` and `updated_at` change.
pub fn insert_or_update(conn: &Connection, name: &str, sticky: bool) -> Result<(), ServiceError> {
    let now = ms_now();
    conn.execute(
        "INSERT INTO tags (name, sticky, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(name) DO UPDATE SET sticky = excluded.sticky, updated_at = excluded.updated_at",
        params![name, sticky, now],
    )?;
    Ok(())
}

pub fn count(conn: &Connection) -> Result<i64, ServiceError> {
    Ok(conn.query_row("SELECT COUNT(id) FROM tags", [], |row| row.get(0))?)
}

/// Names of the tags linked to one post, sorted for stable output.
pub fn names_for_post(conn: &Connection, post_id: i64) -> Result<Vec<String>, ServiceError> {
    let mut stmt = conn.prepare(
        "SELECT t.name FROM tags t
         JOIN tag_post_assoc tpa ON tpa.tag_id = t.id
         WHERE tpa.post_id = ?1
         ORDER BY t.name",
    )?;
    let names = stmt
        .query_map([post_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Every tag with its sticky flag and the number of distinct live posts
/// linked to it or to any of its descendants, in one aggregate query.
pub fn get_all_with_post_count(conn: &Connection) -> Result<Vec<(String, bool, i64)>, ServiceError> {
    let mut stmt = conn.prepare(
        "WITH tag_posts AS (
             SELECT t.name AS tag_name, p.id AS post_id
             FROM tags t
             JOIN tag_post_assoc tpa ON t.id = tpa.tag_id
             JOIN posts p ON tpa.post_id = p.id
             WHERE p.deleted_at IS NULL
         )
         SELECT t.name, t.sticky, COUNT(DISTINCT tp.post_id)
         FROM tags t
         LEFT JOIN tag_posts tp ON tp.tag_name = t.name OR tp.tag_name LIKE (t.name || '/%')
         GROUP BY t.name
         ORDER BY t.name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn descendants(conn: &Connection, name: &str) -> Result<Vec<Tag>, ServiceError> {
    let sql = format!(
        "SELECT {} FROM tags WHERE name LIKE ?1 || '/%' ORDER BY name",
        Tag::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let tags = stmt
        .query_map([name], Tag::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

/// Rewrites `>#old<` spans to `>#new<` in the content of every post linked
/// to `tag_id`.
fn rewrite_linked_content(
    conn: &Connection,
    tag_id: i64,
    old_name: &str,
    new_name: &str,
) -> Result<(), ServiceError> {
    conn.execute(
        "UPDATE posts
         SET content = replace(content, ?1, ?2), updated_at = ?3
         WHERE id IN (SELECT post_id FROM tag_post_assoc WHERE tag_id = ?4)",
        params![format!(">#{old_name}<"), format!(">#{new_name}<"), ms_now(), tag_id],
    )?;
    Ok(())
}

fn rename_tag(conn: &Connection, tag: &Tag, new_name: &str) -> Result<(), ServiceError> {
    rewrite_linked_content(conn, tag.id, &tag.name, new_name)?;
    conn.execute(
        "UPDATE tags SET name = ?1, updated_at = ?2 WHERE id = ?3",
        params![new_name, ms_now(), tag.id],
    )?;
    Ok(())
}

/// Moves every post linked to `tag` onto `target` (deduplicating), rewrites
/// their content, and drops the now-empty source tag.
fn merge_tag(conn: &Connection, tag: &Tag, target: &Tag) -> Result<(), ServiceError> {
    rewrite_linked_content(conn, tag.id, &tag.name, &target.name)?;
    conn.execute(
        "INSERT OR IGNORE INTO tag_post_assoc (tag_id, post_id)
         SELECT ?1, post_id FROM tag_post_assoc WHERE tag_id = ?2",
        params![target.id, tag.id],
    )?;
    conn.execute("DELETE FROM tags WHERE id = ?1", [tag.id])?;
    Ok(())
}

/// Renames a tag and its whole descendant subtree; wherever the destination
/// name already exists the two tags merge instead. Runs as one transaction.
pub fn rename_or_merge(
    conn: &mut Connection,
    name: &str,
    new_name: &str,
) -> Result<(), ServiceError> {
    if name == new_name {
        return Ok(());
    }
    if new_name.starts_with(name)
        && new_name.matches('/').count() > name.matches('/').count()
    {
        return Err(bad_request(format!(
            "cannot move \"{name}\" to a subtag of itself \"{new_name}\""
        )));
    }

    let tx = conn.transaction()?;

    let source = find_or_create(&tx, name)?;

    for descendant in descendants(&tx, name)? {
        let renamed = format!("{}{}", new_name, &descendant.name[name.len()..]);
        match find_by_name(&tx, &renamed)? {
            Some(target) => merge_tag(&tx, &descendant, &target)?,
            None => rename_tag(&tx, &descendant, &renamed)?,
        }
    }

    match find_by_name(&tx, new_name)? {
        Some(target) => merge_tag(&tx, &source, &target)?,
        None => rename_tag(&tx, &source, new_name)?,
    }

    tx.commit()?;
    Ok(())
}

/// Post ids (with parent ids) in the tag's subtree that are currently in the
/// given deleted state.
fn subtree_posts_in_state(
    conn: &Connection,
    name: &str,
    deleted: bool,
) -> Result<Vec<(i64, Option<i64>)>, ServiceError> {
    let sql = format!(
        "SELECT DISTINCT p.id, p.parent_id
         FROM posts p
         JOIN tag_post_assoc tpa ON tpa.post_id = p.id
         JOIN tags t ON t.id = tpa.tag_id
         WHERE (t.name = ?1 OR t.name LIKE ?1 || '/%')
           AND p.deleted_at IS {}",
        if deleted { "NOT NULL" } else { "NULL" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([name], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Soft-deletes every live post linked to the tag or any descendant. The tag
/// rows themselves stay. Parents of the transitioned posts lose one live
/// child each.
pub fn delete(conn: &mut Connection, name: &str) -> Result<(), ServiceError> {
    if find_by_name(conn, name)?.is_none() {
        return Err(not_found("tag not found"));
    }

    let tx = conn.transaction()?;
    let now = ms_now();
    for (post_id, parent_id) in subtree_posts_in_state(&tx, name, false)? {
        tx.execute(
            "UPDATE posts SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, post_id],
        )?;
        if let Some(parent_id) = parent_id {
            tx.execute(
                "UPDATE posts SET children_count = children_count - 1 WHERE id = ?1",
                [parent_id],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Restores every soft-deleted post linked to the tag or any descendant,
/// mirroring `delete`.
pub fn restore(conn: &mut Connection, name: &str) -> Result<(), ServiceError> {
    if find_by_name(conn, name)?.is_none() {
        return Err(not_found("tag not found"));
    }

    let tx = conn.transaction()?;
    let now = ms_now();
    for (post_id, parent_id) in subtree_posts_in_state(&tx, name, true)? {
        tx.execute(
            "UPDATE posts SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![now, post_id],
        )?;
        if let Some(parent_id) = parent_id {
            tx.execute(
                "UPDATE posts SET children_count = children_count + 1 WHERE id = ?1",
                [parent_id],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::posts::{self, NewPost};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::initialize(&conn);
        conn
    }

    fn post_with_tags(conn: &mut Connection, names: &[&str]) -> i64 {
        let content = names
            .iter()
            .map(|n| format!(r#"<span class="hash-tag">#{n}</span>"#))
            .collect::<Vec<_>>()
            .join(" ");
        posts::create(
            conn,
            &NewPost {
                content,
                files: None,
                color: None,
                shared: false,
                parent_id: None,
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let c = conn();
        let a = find_or_create(&c, "work").unwrap();
        let b = find_or_create(&c, "work").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(count(&c).unwrap(), 1);
    }

    #[test]
    fn stick_upsert_keeps_created_at() {
        let c = conn();
        insert_or_update(&c, "pinned", true).unwrap();
        let before = find_by_name(&c, "pinned").unwrap().unwrap();
        insert_or_update(&c, "pinned", false).unwrap();
        let after = find_by_name(&c, "pinned").unwrap().unwrap();
        assert_eq!(before.id, after.id);
        assert_eq!(before.created_at, after.created_at);
        assert!(!after.sticky);
    }

    #[test]
    fn rejects_moving_a_tag_into_its_own_subtree() {
        let mut c = conn();
        find_or_create(&c, "a").unwrap();
        let err = rename_or_merge(&mut c, "a", "a/b");
        assert!(matches!(err, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn rename_to_itself_is_a_noop() {
        let mut c = conn();
        find_or_create(&c, "a").unwrap();
        rename_or_merge(&mut c, "a", "a").unwrap();
        assert!(find_by_name(&c, "a").unwrap().is_some());
    }

    #[test]
    fn sibling_rename_with_shared_prefix_is_allowed() {
        let mut c = conn();
        find_or_create(&c, "a").unwrap();
        rename_or_merge(&mut c, "a", "ab").unwrap();
        assert!(find_by_name(&c, "a").unwrap().is_none());
        assert!(find_by_name(&c, "ab").unwrap().is_some());
    }

    #[test]
    fn rename_or_merge_walks_the_subtree() {
        let mut c = conn();
        for name in ["a", "a/b", "a/c", "x", "x/b"] {
            find_or_create(&c, name).unwrap();
        }
        let p1 = post_with_tags(&mut c, &["a/b"]);
        let p2 = post_with_tags(&mut c, &["a/c"]);

        rename_or_merge(&mut c, "a", "x").unwrap();

        // a/b merged into the existing x/b, a/c renamed to x/c.
        for name in ["a", "a/b", "a/c"] {
            assert!(find_by_name(&c, name).unwrap().is_none(), "{name} lingered");
        }
        for name in ["x", "x/b", "x/c"] {
            assert!(find_by_name(&c, name).unwrap().is_some(), "{name} missing");
        }

        assert_eq!(names_for_post(&c, p1).unwrap(), vec!["x/b"]);
        assert_eq!(names_for_post(&c, p2).unwrap(), vec!["x/c"]);

        let p1_content = posts::get(&c, p1).unwrap().content;
        assert!(p1_content.contains(">#x/b<"));
        assert!(!p1_content.contains(">#a/b<"));
    }

    #[test]
    fn merge_deduplicates_shared_posts() {
        let mut c = conn();
        let p = post_with_tags(&mut c, &["old", "new"]);
        rename_or_merge(&mut c, "old", "new").unwrap();
        assert_eq!(names_for_post(&c, p).unwrap(), vec!["new"]);
        assert!(find_by_name(&c, "old").unwrap().is_none());
    }

    #[test]
    fn rename_of_an_absent_tag_creates_the_target() {
        let mut c = conn();
        rename_or_merge(&mut c, "ghost", "real").unwrap();
        assert!(find_by_name(&c, "real").unwrap().is_some());
        assert!(find_by_name(&c, "ghost").unwrap().is_none());
    }

    #[test]
    fn post_counts_aggregate_descendants() {
        let mut c = conn();
        post_with_tags(&mut c, &["lang/rust"]);
        post_with_tags(&mut c, &["lang/rust"]);
        post_with_tags(&mut c, &["lang"]);

        let counts = get_all_with_post_count(&c).unwrap();
        let lang = counts.iter().find(|(name, ..)| name == "lang").unwrap();
        let rust = counts.iter().find(|(name, ..)| name == "lang/rust").unwrap();
        assert_eq!(lang.2, 3);
        assert_eq!(rust.2, 2);
    }

    #[test]
    fn post_counts_skip_deleted_posts() {
        let mut c = conn();
        let p = post_with_tags(&mut c, &["todo"]);
        posts::soft_delete(&mut c, p).unwrap();

        let counts = get_all_with_post_count(&c).unwrap();
        let todo = counts.iter().find(|(name, ..)| name == "todo").unwrap();
        assert_eq!(todo.2, 0);
    }

    #[test]
    fn delete_and_restore_sweep_the_subtree() {
        let mut c = conn();
        let p1 = post_with_tags(&mut c, &["proj"]);
        let p2 = post_with_tags(&mut c, &["proj/sub"]);
        let other = post_with_tags(&mut c, &["unrelated"]);

        delete(&mut c, "proj").unwrap();
        assert!(posts::get(&c, p1).unwrap().deleted());
        assert!(posts::get(&c, p2).unwrap().deleted());
        assert!(!posts::get(&c, other).unwrap().deleted());

        restore(&mut c, "proj").unwrap();
        assert!(!posts::get(&c, p1).unwrap().deleted());
        assert!(!posts::get(&c, p2).unwrap().deleted());
    }

    #[test]
    fn delete_of_missing_tag_is_not_found() {
        let mut c = conn();
        assert!(matches!(
            delete(&mut c, "nope"),
            Err(ServiceError::NotFound(_))
        ));
    }
}
