// ABOUTME: Execution engine for caselab
// ABOUTME: Script catalog, pre-flight validation, streaming channels, and the dispatcher

pub mod catalog;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod validate;

pub use catalog::{CatalogError, ScriptCatalog, StaticCatalog};
pub use channel::{AttachResult, ChannelPublisher, ChannelRegistry, ExecutionEvent};
pub use config::EngineConfig;
pub use dispatcher::{AdmittedExecution, Dispatcher};
pub use error::{EngineError, Result};
pub use validate::{validate_script, SyntaxIssue};
