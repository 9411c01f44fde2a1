// ABOUTME: Session lifecycle management for caselab
// ABOUTME: The top of the workspace dependency graph; everything inbound goes through SessionManager

pub mod config;
pub mod manager;

pub use config::SessionConfig;
pub use manager::SessionManager;

pub use caselab_engine::{AttachResult, EngineError, ExecutionEvent, Result};
pub use caselab_storage::{
    CaseRef, ExecutionRecord, ExecutionStatus, Session, SessionQuota, SessionStatus,
};
