use std::{env, time::Duration};

pub const DEFAULT_EXTRACTION_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub extraction_model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage: StorageBackendKind,
    pub database_url: String,
    pub db_max_connections: u32,
    pub llm: LlmConfig,
    pub scan_batch_size: usize,
    pub app_env: String,
}

impl Config {
    /// Reads configuration from the process environment. Call
    /// `dotenvy::dotenv()` first to pick up a local `.env`.
    pub fn from_env() -> Self {
        let port = env_parse("PORT").unwrap_or(4000);
        let storage = match env::var("STORAGE_BACKEND")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "mem" => StorageBackendKind::Memory,
            _ => StorageBackendKind::Postgres,
        };
        let llm = LlmConfig {
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            extraction_model: env::var("OPENAI_EXTRACTION_MODEL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_EXTRACTION_MODEL.to_string()),
            timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS").unwrap_or(60)),
        };

        Self {
            port,
            storage,
            database_url: resolve_database_url(),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(10),
            llm,
            scan_batch_size: env_parse::<usize>("SCAN_BATCH_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_SCAN_BATCH_SIZE),
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        self.app_env.trim().eq_ignore_ascii_case("production")
    }
}

/// In-memory storage with stock defaults; no environment lookups.
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            storage: StorageBackendKind::Memory,
            database_url: String::new(),
            db_max_connections: 10,
            llm: LlmConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                extraction_model: DEFAULT_EXTRACTION_MODEL.to_string(),
                timeout: Duration::from_secs(60),
            },
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            app_env: "development".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "chat_context".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
