use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::NaiveDate;
use regex::Regex;
use rocket::http::{ContentType, Status};
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};

use crate::auth::{self, ApiToken};
use crate::config::Config;
use crate::error::{self, ApiError, ServiceError};
use crate::highlight::highlight_html;
use crate::kv::check_rate_limit;
use crate::model::{validate_tag_name, Post, COLORS};
use crate::posts::{self, NewPost, OrderBy, Patch, PostFilter, PostPatch};
use crate::runner::{BackgroundRunner, IndexTask};
use crate::search::FullTextIndex;
use crate::{tags, DbPool, KvStore};

// ─── DTOs ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

#[derive(Serialize)]
pub struct PostDto {
    pub id: i64,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub children_count: i64,
    pub shared: bool,
    pub files: Vec<FileInfo>,
    pub color: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<PostDto>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Serialize)]
pub struct PostPagination {
    pub posts: Vec<PostDto>,
    pub cursor: i64,
    pub size: usize,
}

#[derive(Serialize)]
pub struct CreationDto {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Serialize)]
pub struct TagDto {
    pub name: String,
    pub sticky: bool,
    pub post_count: i64,
}

#[derive(Serialize)]
pub struct StatsDto {
    pub post_count: i64,
    pub tag_count: i64,
    pub day_count: i64,
}

// ─── Request bodies ───

#[derive(Deserialize)]
pub struct LoginReq {
    pub password: String,
}

#[derive(Deserialize)]
pub struct CreatePostReq {
    pub content: String,
    pub files: Option<Vec<FileInfo>>,
    pub color: Option<String>,
    pub shared: Option<bool>,
    pub parent_id: Option<i64>,
}

/// Absent fields stay `None`; an explicit JSON `null` becomes `Some(None)`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
pub struct UpdatePostReq {
    pub id: i64,
    #[serde(default, deserialize_with = "double_option")]
    pub content: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub shared: Option<Option<bool>>,
    #[serde(default, deserialize_with = "double_option")]
    pub files: Option<Option<Vec<FileInfo>>>,
    #[serde(default, deserialize_with = "double_option")]
    pub color: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub parent_id: Option<Option<i64>>,
}

#[derive(Deserialize)]
pub struct DeletePostReq {
    pub id: i64,
    #[serde(default)]
    pub hard: bool,
}

#[derive(Deserialize)]
pub struct IdReq {
    pub id: i64,
}

#[derive(Deserialize)]
pub struct NameReq {
    pub name: String,
}

#[derive(Deserialize)]
pub struct StickTagReq {
    pub name: String,
    pub sticky: bool,
}

#[derive(Deserialize)]
pub struct RenameTagReq {
    pub name: String,
    pub new_name: String,
}

// ─── Helpers ───

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap())
}

fn parse_date(value: &str) -> Result<NaiveDate, ServiceError> {
    if !date_pattern().is_match(value) {
        return Err(error::bad_request("invalid date format, must be YYYY-MM-DD"));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| error::bad_request(format!("invalid date: {value}")))
}

fn validate_color(color: &str) -> Result<(), ServiceError> {
    if COLORS.contains(&color) {
        return Ok(());
    }
    Err(error::bad_request(format!("invalid color: {color}")))
}

fn serialize_files(files: &[FileInfo]) -> Result<String, ServiceError> {
    serde_json::to_string(files)
        .map_err(|err| ServiceError::Internal(format!("file list serialization failed: {err}")))
}

fn post_dto(conn: &rusqlite::Connection, post: &Post) -> Result<PostDto, ServiceError> {
    let files = post
        .files
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    let parent = match post.parent_id {
        Some(parent_id) => match posts::get(conn, parent_id) {
            Ok(parent) if !parent.deleted() => Some(Box::new(post_dto(conn, &parent)?)),
            _ => None,
        },
        None => None,
    };

    Ok(PostDto {
        id: post.id,
        content: post.content.clone(),
        created_at: post.created_at,
        updated_at: post.updated_at,
        deleted_at: post.deleted_at,
        children_count: post.children_count,
        shared: post.shared,
        files,
        color: post.color.clone(),
        tags: tags::names_for_post(conn, post.id)?,
        parent,
        score: None,
    })
}

fn order_field(post: &Post, order_by: OrderBy) -> Option<i64> {
    match order_by {
        OrderBy::CreatedAt => Some(post.created_at),
        OrderBy::UpdatedAt => Some(post.updated_at),
        OrderBy::DeletedAt => post.deleted_at,
    }
}

// ─── Routes ───

#[get("/")]
pub fn index(_token: ApiToken) -> Json<serde_json::Value> {
    Json(serde_json::json!({"msg": "hello world"}))
}

#[post("/login", format = "json", data = "<req>")]
pub fn login(
    req: Json<LoginReq>,
    config: &State<Config>,
    store: &State<KvStore>,
) -> Result<Status, ServiceError> {
    check_rate_limit(store.inner().as_ref(), &config.key_prefix, "login", 10, 60)?;
    if !auth::verify_secret(config, &req.password) {
        return Err(error::bad_request("wrong password"));
    }
    Ok(Status::NoContent)
}

#[get("/auth")]
pub fn check_auth(_token: ApiToken) -> Status {
    Status::NoContent
}

#[get("/search?<query>&<partial>&<limit>")]
pub fn search_posts(
    _token: ApiToken,
    query: Option<String>,
    partial: Option<bool>,
    limit: Option<usize>,
    db: &State<DbPool>,
    search_index: &State<Arc<FullTextIndex>>,
) -> Result<Json<PostPagination>, ServiceError> {
    let query = query.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(error::bad_request("query is required"));
    }

    let (tokens, results) =
        search_index.search(&query, partial.unwrap_or(true), limit.unwrap_or(0))?;
    if results.is_empty() {
        return Ok(Json(PostPagination { posts: Vec::new(), cursor: -1, size: 0 }));
    }

    let scores: HashMap<i64, f64> = results.into_iter().collect();
    let ids: Vec<i64> = scores.keys().copied().collect();

    let conn = db.lock().unwrap();
    let mut dtos = Vec::new();
    for post in posts::find_by_ids(&conn, &ids)? {
        let mut dto = post_dto(&conn, &post)?;
        dto.content = highlight_html(&tokens, &dto.content);
        dto.score = scores.get(&post.id).copied();
        dtos.push(dto);
    }
    dtos.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
    });

    Ok(Json(PostPagination { size: dtos.len(), posts: dtos, cursor: -1 }))
}

#[get("/get-posts?<cursor>&<deleted>&<parent_id>&<color>&<tag>&<start_date>&<end_date>&<shared>&<has_files>&<order_by>&<ascending>")]
#[allow(clippy::too_many_arguments)]
pub fn get_posts(
    _token: ApiToken,
    cursor: Option<i64>,
    deleted: Option<bool>,
    parent_id: Option<i64>,
    color: Option<String>,
    tag: Option<String>,
    start_date: Option<i64>,
    end_date: Option<i64>,
    shared: Option<bool>,
    has_files: Option<bool>,
    order_by: Option<String>,
    ascending: Option<bool>,
    db: &State<DbPool>,
    config: &State<Config>,
) -> Result<Json<PostPagination>, ServiceError> {
    if let Some(color) = &color {
        validate_color(color)?;
    }
    let order_by = match order_by {
        Some(value) => OrderBy::parse(&value)
            .ok_or_else(|| error::bad_request(format!("invalid order_by: {value}")))?,
        None => OrderBy::CreatedAt,
    };

    let filter = PostFilter {
        cursor,
        deleted: deleted.unwrap_or(false),
        parent_id: parent_id.map(Some),
        color,
        tag,
        start_date,
        end_date,
        shared,
        has_files,
        order_by,
        ascending: ascending.unwrap_or(false),
        per_page: config.posts_per_page,
    };

    let conn = db.lock().unwrap();
    let found = posts::filter_posts(&conn, &filter)?;
    let next_cursor = found
        .last()
        .and_then(|post| order_field(post, order_by))
        .unwrap_or(-1);

    let mut dtos = Vec::with_capacity(found.len());
    for post in &found {
        dtos.push(post_dto(&conn, post)?);
    }
    Ok(Json(PostPagination { size: dtos.len(), posts: dtos, cursor: next_cursor }))
}

#[get("/get-post?<id>")]
pub fn get_post(
    _token: ApiToken,
    id: Option<i64>,
    db: &State<DbPool>,
) -> Result<Json<PostDto>, ServiceError> {
    let id = id.ok_or_else(|| error::bad_request("id is required"))?;
    let conn = db.lock().unwrap();
    let post = posts::get(&conn, id)?;
    if post.deleted() {
        return Err(error::not_found("post not found"));
    }
    Ok(Json(post_dto(&conn, &post)?))
}

#[post("/create-post", format = "json", data = "<req>")]
pub fn create_post(
    _token: ApiToken,
    req: Json<CreatePostReq>,
    db: &State<DbPool>,
    background: &State<BackgroundRunner>,
) -> Result<Json<CreationDto>, ServiceError> {
    if req.content.is_empty() {
        return Err(error::bad_request("content is required"));
    }
    if let Some(color) = &req.color {
        validate_color(color)?;
    }
    let files = match req.files.as_deref() {
        Some(list) if !list.is_empty() => Some(serialize_files(list)?),
        _ => None,
    };

    let new = NewPost {
        content: req.content.clone(),
        files,
        color: req.color.clone(),
        shared: req.shared.unwrap_or(false),
        parent_id: req.parent_id,
    };
    let post = {
        let mut conn = db.lock().unwrap();
        posts::create(&mut conn, &new)?
    };

    background.submit(IndexTask::Index { id: post.id, text: post.content.clone() });

    Ok(Json(CreationDto {
        id: post.id,
        created_at: post.created_at,
        updated_at: post.updated_at,
    }))
}

#[post("/update-post", format = "json", data = "<req>")]
pub fn update_post(
    _token: ApiToken,
    req: Json<UpdatePostReq>,
    db: &State<DbPool>,
    background: &State<BackgroundRunner>,
) -> Result<Status, ServiceError> {
    let patch = PostPatch {
        content: match &req.content {
            None => None,
            Some(None) => return Err(error::bad_request("content cannot be null")),
            Some(Some(content)) if content.is_empty() => {
                return Err(error::bad_request("content cannot be empty"))
            }
            Some(Some(content)) => Some(content.clone()),
        },
        shared: match req.shared {
            None => None,
            Some(None) => return Err(error::bad_request("shared cannot be null")),
            Some(Some(shared)) => Some(shared),
        },
        files: match &req.files {
            None => Patch::Absent,
            Some(None) => Patch::Null,
            Some(Some(list)) if list.is_empty() => Patch::Null,
            Some(Some(list)) => Patch::Value(serialize_files(list)?),
        },
        color: match &req.color {
            None => Patch::Absent,
            Some(None) => Patch::Null,
            Some(Some(color)) => {
                validate_color(color)?;
                Patch::Value(color.clone())
            }
        },
        parent_id: match req.parent_id {
            None => Patch::Absent,
            Some(None) => Patch::Null,
            Some(Some(parent_id)) => Patch::Value(parent_id),
        },
    };

    let (post, content_changed) = {
        let mut conn = db.lock().unwrap();
        posts::update(&mut conn, req.id, &patch)?
    };

    if content_changed {
        background.submit(IndexTask::Reindex { id: post.id, text: post.content.clone() });
    }
    Ok(Status::NoContent)
}

#[post("/delete-post", format = "json", data = "<req>")]
pub fn delete_post(
    _token: ApiToken,
    req: Json<DeletePostReq>,
    db: &State<DbPool>,
    background: &State<BackgroundRunner>,
) -> Result<Status, ServiceError> {
    {
        let mut conn = db.lock().unwrap();
        if req.hard {
            posts::hard_delete(&mut conn, req.id)?;
        } else {
            posts::soft_delete(&mut conn, req.id)?;
        }
    }
    if req.hard {
        background.submit(IndexTask::Deindex { id: req.id });
    }
    Ok(Status::NoContent)
}

#[post("/restore-post", format = "json", data = "<req>")]
pub fn restore_post(
    _token: ApiToken,
    req: Json<IdReq>,
    db: &State<DbPool>,
) -> Result<Status, ServiceError> {
    let mut conn = db.lock().unwrap();
    posts::restore(&mut conn, req.id)?;
    Ok(Status::NoContent)
}

#[post("/clear-posts")]
pub fn clear_posts(
    _token: ApiToken,
    db: &State<DbPool>,
    background: &State<BackgroundRunner>,
) -> Result<Status, ServiceError> {
    let ids = {
        let mut conn = db.lock().unwrap();
        posts::clear_all(&mut conn)?
    };
    for id in ids {
        background.submit(IndexTask::Deindex { id });
    }
    Ok(Status::NoContent)
}

#[get("/get-tags")]
pub fn get_tags(_token: ApiToken, db: &State<DbPool>) -> Result<Json<Vec<TagDto>>, ServiceError> {
    let conn = db.lock().unwrap();
    let tags = tags::get_all_with_post_count(&conn)?
        .into_iter()
        .map(|(name, sticky, post_count)| TagDto { name, sticky, post_count })
        .collect();
    Ok(Json(tags))
}

#[post("/stick-tag", format = "json", data = "<req>")]
pub fn stick_tag(
    _token: ApiToken,
    req: Json<StickTagReq>,
    db: &State<DbPool>,
) -> Result<Status, ServiceError> {
    validate_tag_name(&req.name)?;
    let conn = db.lock().unwrap();
    tags::insert_or_update(&conn, &req.name, req.sticky)?;
    Ok(Status::NoContent)
}

#[post("/rename-tag", format = "json", data = "<req>")]
pub fn rename_tag(
    _token: ApiToken,
    req: Json<RenameTagReq>,
    db: &State<DbPool>,
    config: &State<Config>,
    store: &State<KvStore>,
) -> Result<Status, ServiceError> {
    check_rate_limit(store.inner().as_ref(), &config.key_prefix, "rename_tag", 5, 60)?;
    validate_tag_name(&req.new_name)?;
    let mut conn = db.lock().unwrap();
    tags::rename_or_merge(&mut conn, &req.name, &req.new_name)?;
    Ok(Status::NoContent)
}

#[post("/delete-tag", format = "json", data = "<req>")]
pub fn delete_tag(
    _token: ApiToken,
    req: Json<NameReq>,
    db: &State<DbPool>,
    config: &State<Config>,
    store: &State<KvStore>,
) -> Result<Status, ServiceError> {
    check_rate_limit(store.inner().as_ref(), &config.key_prefix, "delete_tag", 1, 10)?;
    let mut conn = db.lock().unwrap();
    tags::delete(&mut conn, &req.name)?;
    Ok(Status::NoContent)
}

#[get("/get-daily-post-counts?<start_date>&<end_date>&<offset>")]
pub fn get_daily_post_counts(
    _token: ApiToken,
    start_date: Option<String>,
    end_date: Option<String>,
    offset: Option<i32>,
    db: &State<DbPool>,
) -> Result<Json<Vec<i64>>, ServiceError> {
    let start_date = start_date.ok_or_else(|| error::bad_request("start_date is required"))?;
    let end_date = end_date.ok_or_else(|| error::bad_request("end_date is required"))?;
    let offset = offset.unwrap_or(480);
    if offset.abs() > 1440 {
        return Err(error::bad_request(format!(
            "timezone offset must be between -1440 and 1440 minutes: {offset}"
        )));
    }

    let start = parse_date(&start_date)?;
    let end = parse_date(&end_date)?;

    let conn = db.lock().unwrap();
    Ok(Json(posts::get_daily_counts(&conn, start, end, offset)?))
}

#[get("/get-overall-counts")]
pub fn get_overall_counts(
    _token: ApiToken,
    db: &State<DbPool>,
) -> Result<Json<StatsDto>, ServiceError> {
    let conn = db.lock().unwrap();
    Ok(Json(StatsDto {
        post_count: posts::count(&conn)?,
        tag_count: tags::count(&conn)?,
        day_count: posts::get_active_days(&conn)?,
    }))
}

#[get("/_dangerously_rebuild_all_indexes")]
pub fn rebuild_indexes(
    _token: ApiToken,
    db: &State<DbPool>,
    config: &State<Config>,
    store: &State<KvStore>,
    search_index: &State<Arc<FullTextIndex>>,
) -> Result<(ContentType, String), ServiceError> {
    check_rate_limit(
        store.inner().as_ref(),
        &config.key_prefix,
        "rebuild_indexes",
        3,
        3600,
    )?;

    let rows: Vec<(i64, String)> = {
        let conn = db.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, content FROM posts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    search_index.clear_all_indexes()?;
    for (id, content) in &rows {
        search_index.index(*id, content)?;
    }

    Ok((ContentType::Plain, format!("Indexing...\nDone ({} posts)", rows.len())))
}

// ─── Catchers ───

#[catch(400)]
pub fn bad_request() -> Json<ApiError> {
    Json(ApiError::new(Status::BadRequest, None))
}

#[catch(401)]
pub fn unauthorized() -> Json<ApiError> {
    Json(ApiError::new(Status::Unauthorized, None))
}

#[catch(404)]
pub fn not_found() -> Json<ApiError> {
    Json(ApiError::new(Status::NotFound, None))
}

#[catch(422)]
pub fn unprocessable() -> Json<ApiError> {
    Json(ApiError::new(
        Status::UnprocessableEntity,
        Some("request body failed validation".to_string()),
    ))
}

#[catch(429)]
pub fn too_many_requests() -> Json<ApiError> {
    Json(ApiError::new(Status::TooManyRequests, None))
}

#[catch(500)]
pub fn internal_error() -> Json<ApiError> {
    Json(ApiError::new(Status::InternalServerError, None))
}
