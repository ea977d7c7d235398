//! Store error.

use thiserror::Error;

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("Invalid value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
