use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{bad_request, ServiceError};

pub const COLORS: &[&str] = &["red", "green", "blue"];

pub fn ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn hash_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"<span class="hash-tag">#(.+?)</span>"#).unwrap())
}

/// Distinct hashtag names referenced in post HTML, in first-seen order.
pub fn extract_hashtags(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for caps in hash_tag_pattern().captures_iter(content) {
        let name = caps[1].to_string();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

/// Checks the tag-name rules: at most 32 chars, no whitespace, no `#`,
/// no leading/trailing `/`, no `//`, non-empty.
pub fn validate_tag_name(name: &str) -> Result<(), ServiceError> {
    if name.is_empty() {
        return Err(bad_request("tag name cannot be empty"));
    }
    if name.chars().count() > 32 {
        return Err(bad_request("tag name cannot exceed 32 characters"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(bad_request("tag name cannot contain spaces"));
    }
    if name.contains('#') {
        return Err(bad_request("tag name cannot contain '#'"));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(bad_request("tag name cannot start or end with '/'"));
    }
    if name.contains("//") {
        return Err(bad_request("tag name cannot contain consecutive '/'"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Post {
    pub id: i64,
    pub content: String,
    pub files: Option<String>,
    pub color: Option<String>,
    pub shared: bool,
    pub parent_id: Option<i64>,
    pub children_count: i64,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    /// Column list matching `from_row`, for embedding into SELECTs.
    pub const COLUMNS: &'static str =
        "id, content, files, color, shared, parent_id, children_count, deleted_at, created_at, updated_at";

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Post {
            id: row.get(0)?,
            content: row.get(1)?,
            files: row.get(2)?,
            color: row.get(3)?,
            shared: row.get::<_, i64>(4)? != 0,
            parent_id: row.get(5)?,
            children_count: row.get(6)?,
            deleted_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    pub fn deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub sticky: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Tag {
    pub const COLUMNS: &'static str = "id, name, sticky, created_at, updated_at";

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Tag {
            id: row.get(0)?,
            name: row.get(1)?,
            sticky: row.get::<_, i64>(2)? != 0,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_hashtags_in_order_without_duplicates() {
        let content = r#"<p><span class="hash-tag">#work</span> and
            <span class="hash-tag">#work/notes</span> then
            <span class="hash-tag">#work</span> again</p>"#;
        assert_eq!(extract_hashtags(content), vec!["work", "work/notes"]);
    }

    #[test]
    fn ignores_plain_hash_text() {
        assert!(extract_hashtags("<p>#not-a-tag</p>").is_empty());
    }

    #[test]
    fn tag_name_rules() {
        assert!(validate_tag_name("work/notes").is_ok());
        assert!(validate_tag_name("中文标签").is_ok());
        assert!(validate_tag_name("").is_err());
        assert!(validate_tag_name("has space").is_err());
        assert!(validate_tag_name("no#hash").is_err());
        assert!(validate_tag_name("/leading").is_err());
        assert!(validate_tag_name("trailing/").is_err());
        assert!(validate_tag_name("a//b").is_err());
        assert!(validate_tag_name(&"x".repeat(33)).is_err());
    }
}
