// ABOUTME: Core type definitions for the sandbox runtime adapter
// ABOUTME: Defines sandbox specs, injected files, and streaming exec output shapes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Specification for creating a sandbox container.
///
/// Sandboxes are created idle (they hold a `sleep infinity` process) so the
/// pool can keep them warm; scripts run inside via exec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Container image to use (e.g., "python:3.12-slim")
    pub image: String,
    /// Writable work directory inside the sandbox
    pub work_dir: String,
    /// Environment variables set on the container
    pub env_vars: HashMap<String, String>,
    /// Memory ceiling in megabytes
    pub memory_mb: u64,
    /// CPU share (fractional cores, e.g. 0.5)
    pub cpu_cores: f64,
    /// Extra labels stamped on the container for identification
    pub labels: HashMap<String, String>,
    /// Whether the sandbox gets network access (off for untrusted scripts)
    pub network_enabled: bool,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            work_dir: "/workspace".to_string(),
            env_vars: HashMap::new(),
            memory_mb: 512,
            cpu_cores: 1.0,
            labels: HashMap::new(),
            network_enabled: false,
        }
    }
}

/// A file injected into a sandbox work directory before execution
#[derive(Debug, Clone)]
pub struct WorkFile {
    /// Path relative to the sandbox work directory
    pub path: String,
    /// File contents
    pub contents: Vec<u8>,
}

impl WorkFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One chunk of output captured from a running exec
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Final outcome of an exec, delivered after the output stream closes
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    /// Wall-clock time from exec start to process exit
    pub duration: std::time::Duration,
}

/// Handle to a streaming exec.
///
/// Implementations must close `output` (drop the sender) before resolving
/// `outcome`, so a consumer can drain the stream to completion and then await
/// the exit code without racing.
pub struct ExecHandle {
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    pub outcome: oneshot::Receiver<ExecOutcome>,
}
