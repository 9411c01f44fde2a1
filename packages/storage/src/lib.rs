// ABOUTME: SQLite persistence for caselab
// ABOUTME: Session and execution records with terminal-status guards enforced in SQL

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StorageError};
pub use store::CaselabStorage;
pub use types::{
    CaseRef, ExecutionRecord, ExecutionStatus, Session, SessionQuota, SessionStatus,
};
