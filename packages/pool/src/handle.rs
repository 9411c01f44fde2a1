// ABOUTME: Sandbox handle types owned by the container pool
// ABOUTME: Tracks slot identity, runtime container ID, and reuse bookkeeping per sandbox

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pooled sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    /// Idle and ready to be handed out
    Warm,
    /// Borrowed by an execution
    InUse,
    /// Exposed to a failed/killed/cancelled execution; never reused
    Tainted,
    /// Container removed
    Destroyed,
}

/// A sandbox owned by the pool.
///
/// Handed to the dispatcher as a borrowed unit for the duration of one
/// execution and returned through `ContainerPool::release`.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Pool-assigned logical slot number
    pub slot: u64,
    /// Runtime-assigned container ID
    pub container_id: String,
    pub state: HandleState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_used_at: chrono::DateTime<chrono::Utc>,
    /// Number of executions this sandbox has hosted
    pub reuse_count: u32,
}

impl SandboxHandle {
    pub fn new(slot: u64, container_id: String) -> Self {
        let now = chrono::Utc::now();
        Self {
            slot,
            container_id,
            state: HandleState::Warm,
            created_at: now,
            last_used_at: now,
            reuse_count: 0,
        }
    }
}
