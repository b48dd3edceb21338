#[macro_use]
extern crate rocket;

pub mod analyzer;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod highlight;
pub mod kv;
pub mod model;
pub mod posts;
pub mod routes;
pub mod runner;
pub mod search;
pub mod tags;

use std::sync::{Arc, Mutex};

pub type DbPool = Arc<Mutex<rusqlite::Connection>>;
pub type KvStore = Arc<dyn kv::IndexStore>;

pub fn create_rocket(
    config: config::Config,
    db: DbPool,
    store: KvStore,
) -> rocket::Rocket<rocket::Build> {
    let index = Arc::new(search::FullTextIndex::new(store.clone(), &config.key_prefix));
    let background = runner::BackgroundRunner::start(index.clone());
    runner::start_retention_sweeper(db.clone(), background.clone(), config.retention_days);

    rocket::build()
        .manage(config)
        .manage(db)
        .manage(store)
        .manage(index)
        .manage(background)
        .mount("/api", routes![
            routes::index,
            routes::login,
            routes::check_auth,
            routes::search_posts,
            routes::get_posts,
            routes::get_post,
            routes::create_post,
            routes::update_post,
            routes::delete_post,
            routes::restore_post,
            routes::clear_posts,
            routes::get_tags,
            routes::stick_tag,
            routes::rename_tag,
            routes::delete_tag,
            routes::get_daily_post_counts,
            routes::get_overall_counts,
            routes::rebuild_indexes,
        ])
        .register("/", catchers![
            routes::bad_request,
            routes::unauthorized,
            routes::not_found,
            routes::unprocessable,
            routes::too_many_requests,
            routes::internal_error,
        ])
}
