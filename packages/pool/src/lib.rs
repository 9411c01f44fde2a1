// ABOUTME: Warm sandbox pool for caselab
// ABOUTME: Amortizes container creation latency by keeping pre-created sandboxes ready for reuse

pub mod config;
pub mod handle;
pub mod pool;

pub use config::PoolConfig;
pub use handle::{HandleState, SandboxHandle};
pub use pool::{ContainerPool, PoolError, PoolStats, Reservation};

pub type Result<T> = std::result::Result<T, PoolError>;
