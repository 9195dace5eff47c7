use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("failed to load index from {path:?}: {reason}")]
    IndexLoad { path: PathBuf, reason: String },

    #[error("query cannot be empty")]
    EmptyQuery,

    #[error("rate limited by the model API: {0}")]
    RateLimited(String),

    #[error("model API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no API key found in ${0} or secrets file")]
    MissingApiKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AssistantError {
    pub fn index_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        AssistantError::IndexLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AssistantError::RateLimited(_))
    }

    pub fn is_index_load(&self) -> bool {
        matches!(self, AssistantError::IndexLoad { .. })
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;
