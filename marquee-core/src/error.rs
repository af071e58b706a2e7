use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Range not satisfiable: {0}")]
    InvalidRange(String),

    #[error("Cache entry failed integrity check: {0}")]
    Integrity(String),

    #[error("Invalid cache generation name: {0:?}")]
    InvalidGeneration(String),

    #[error("Cache generation was rolled over: {0}")]
    Retired(String),

    #[error("Origin request failed: {0}")]
    Origin(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// True when the failure came from talking to the origin and a later
    /// attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Origin(_) | CacheError::Io(_))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Origin(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
