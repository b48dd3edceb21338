use std::env;
use std::path::Path;

/// Runtime configuration, read from the environment after the `.env`
/// precedence chain has been loaded.
#[derive(Debug, Clone)]
pub struct Config {
    pub secret: String,
    pub database: String,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub posts_per_page: i64,
    pub retention_days: i64,
    pub cors_origins: String,
    pub log_level: String,
}

/// Loads env files in increasing priority: `.env`, then `.env.{env}`,
/// then `.env.local`. `MEMO_ENV` selects the middle file.
pub fn load_env_files() {
    let env = env::var("MEMO_ENV")
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase();

    if Path::new(".env").exists() {
        let _ = dotenvy::from_filename(".env");
    }

    let env_file = match env.as_str() {
        "dev" | "development" => Some(".env.dev"),
        "prod" | "production" => Some(".env.prod"),
        "test" => Some(".env.test"),
        _ => None,
    };
    if let Some(file) = env_file {
        if Path::new(file).exists() {
            let _ = dotenvy::from_filename_override(file);
        }
    }

    if Path::new(".env.local").exists() {
        let _ = dotenvy::from_filename_override(".env.local");
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            secret: var_or("MEMO_SECRET", ""),
            database: var_or("MEMO_DATABASE", "data/memo.db"),
            redis_url: env::var("MEMO_REDIS_URL").ok().filter(|v| !v.is_empty()),
            key_prefix: var_or("MEMO_KEY_PREFIX", "memo:"),
            posts_per_page: parse_or("MEMO_POSTS_PER_PAGE", 30),
            retention_days: parse_or("MEMO_RETENTION_DAYS", 30),
            cors_origins: var_or("MEMO_CORS_ORIGINS", "*"),
            log_level: var_or("MEMO_LOG_LEVEL", "info"),
        }
    }
}
