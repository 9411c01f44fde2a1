// ABOUTME: Sandbox runtime adapter for caselab
// ABOUTME: Defines the SandboxRuntime trait and the Docker implementation used by the pool

pub mod docker;
pub mod runtime;
pub mod types;

pub use docker::DockerRuntime;
pub use runtime::{RuntimeError, SandboxRuntime};
pub use types::{ExecHandle, ExecOutcome, OutputChunk, SandboxSpec, StreamKind, WorkFile};

pub type Result<T> = std::result::Result<T, RuntimeError>;
