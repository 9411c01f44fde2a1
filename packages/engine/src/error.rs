// ABOUTME: Error taxonomy for the caselab execution engine
// ABOUTME: Admission rejections are errors; runtime outcomes of a running script are record statuses

use thiserror::Error;

use caselab_storage::{ExecutionStatus, SessionStatus};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but is not accepting executions right now
    #[error("Session {id} is {status:?}, not active")]
    SessionNotActive { id: String, status: SessionStatus },

    /// Session is expired or terminated; nothing can revive it
    #[error("Session {id} is {status:?}")]
    SessionTerminal { id: String, status: SessionStatus },

    #[error("Concurrency limit reached: {limit} execution(s) already in flight")]
    ConcurrencyLimitExceeded { limit: u32 },

    /// Sandbox cap reached with nothing warm; the caller retries, not us
    #[error("Pool exhausted: no sandbox available")]
    PoolExhausted,

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// Pre-flight gate rejection; no record or sandbox was consumed
    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {id} is {status:?} and cannot be cancelled")]
    NotCancellable { id: String, status: ExecutionStatus },

    #[error("Storage error: {0}")]
    Storage(#[from] caselab_storage::StorageError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
