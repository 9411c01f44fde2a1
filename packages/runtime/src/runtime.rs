// ABOUTME: SandboxRuntime trait and error types for container runtime backends
// ABOUTME: Defines the abstract create/inject/exec/kill/remove surface the pool and engine use

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{ExecHandle, SandboxSpec, WorkFile};

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The container runtime cannot be reached at all
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, RuntimeError>;

/// Abstract interface over the host's container/process isolation primitive.
///
/// The pool owns sandbox lifetimes; the dispatcher only ever execs inside a
/// sandbox it borrowed from the pool. Resource caps (memory, CPU) are
/// enforced here at creation time, not by callers.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Check runtime availability
    async fn ping(&self) -> Result<()>;

    /// Create and start an idle sandbox, returning its container ID.
    ///
    /// The sandbox has no network access and a writable work directory.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String>;

    /// Upload files into the sandbox work directory
    async fn inject_files(&self, container_id: &str, files: &[WorkFile]) -> Result<()>;

    /// Clear the writable work directory between reuses.
    ///
    /// Does not reinstall the base image; a failed reset means the sandbox
    /// cannot be proven clean and must be treated as tainted by the caller.
    async fn reset_workdir(&self, container_id: &str) -> Result<()>;

    /// Run a command in the sandbox, streaming output as it arrives.
    ///
    /// Output chunks are forwarded without buffering the whole stream; the
    /// exit code resolves only after the output channel closes.
    async fn exec_streaming(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: HashMap<String, String>,
    ) -> Result<ExecHandle>;

    /// Hard-kill everything running in the sandbox.
    ///
    /// This is the authoritative deadline/cancellation enforcement point: it
    /// terminates at the container level, so a runaway script cannot outlive
    /// its budget by stalling caller-side bookkeeping.
    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Force-remove the sandbox container and its volumes
    async fn remove_sandbox(&self, container_id: &str) -> Result<()>;
}
