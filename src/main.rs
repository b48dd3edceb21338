use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use memo::{config, create_rocket, db, kv, KvStore};

fn open_database(path: &str) -> rusqlite::Connection {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    rusqlite::Connection::open(path).expect("Failed to open database")
}

fn confirm(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    io::stdout().flush().ok();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    config::load_env_files();
    let cfg = config::Config::from_env();

    // Sub-commands share the service configuration; the default action serves.
    let command = std::env::args().nth(1);
    match command.as_deref() {
        Some("create-tables") => {
            let conn = open_database(&cfg.database);
            db::initialize(&conn);
            println!("tables created at {}", cfg.database);
            return Ok(());
        }
        Some("drop-tables") => {
            if confirm("Are you sure to drop all tables?") {
                let conn = open_database(&cfg.database);
                db::drop_tables(&conn);
                println!("tables dropped");
            }
            return Ok(());
        }
        Some(other) => {
            eprintln!("unknown command: {other} (expected create-tables or drop-tables)");
            return Ok(());
        }
        None => {}
    }

    if cfg.secret.is_empty() {
        eprintln!("MEMO_SECRET must be set");
        return Ok(());
    }

    let conn = open_database(&cfg.database);
    db::initialize(&conn);

    let store: KvStore = match &cfg.redis_url {
        Some(url) => {
            Arc::new(kv::RedisIndexStore::connect(url).expect("Failed to connect to redis"))
        }
        None => {
            log::warn!("MEMO_REDIS_URL not set, using the in-memory index store");
            Arc::new(kv::MemoryIndexStore::new())
        }
    };

    let cors = rocket_cors::CorsOptions::default()
        .allowed_origins(if cfg.cors_origins == "*" {
            rocket_cors::AllowedOrigins::all()
        } else {
            rocket_cors::AllowedOrigins::some_exact(
                &cfg.cors_origins.split(',').map(str::trim).collect::<Vec<_>>(),
            )
        })
        .to_cors()
        .expect("CORS config");

    create_rocket(cfg, Arc::new(Mutex::new(conn)), store)
        .attach(cors)
        .launch()
        .await?;
    Ok(())
}
