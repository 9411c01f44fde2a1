// ABOUTME: Error types for the caselab storage layer
// ABOUTME: Wraps sqlx and serde_json failures and names the not-found cases

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
