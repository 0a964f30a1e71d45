use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("llm request failed: {0}")]
    LlmTransport(#[from] reqwest::Error),

    #[error("llm returned {status}: {body}")]
    LlmStatus { status: u16, body: String },

    #[error("llm response had empty content")]
    LlmEmpty,

    #[error("{0} not configured")]
    MissingConfig(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type ContextResult<T> = Result<T, ContextError>;
