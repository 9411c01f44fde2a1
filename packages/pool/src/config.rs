// ABOUTME: Configuration for the container pool
// ABOUTME: Warm target, hard cap, reuse ceiling, and creation/replenish timing knobs

use caselab_runtime::SandboxSpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pool sizing and recycling configuration.
///
/// Constructed explicitly and injected into the pool; there is no global
/// pool state. `warm_target` and `max_sandboxes` can be overridden via the
/// `CASELAB_POOL_WARM_TARGET` and `CASELAB_POOL_MAX_SANDBOXES` environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of idle sandboxes to keep pre-created
    pub warm_target: usize,
    /// Hard cap on total sandboxes (warm + in use + being created)
    pub max_sandboxes: usize,
    /// A sandbox is destroyed after this many executions even if never tainted
    pub reuse_ceiling: u32,
    /// Bound on synchronous sandbox creation during acquire
    #[serde(with = "duration_secs")]
    pub creation_timeout: Duration,
    /// Replenisher tick; at most one sandbox is created per tick
    #[serde(with = "duration_secs")]
    pub replenish_interval: Duration,
    /// Container spec used for every pooled sandbox
    pub spec: SandboxSpec,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_target: 4,
            max_sandboxes: 16,
            reuse_ceiling: 32,
            creation_timeout: Duration::from_secs(30),
            replenish_interval: Duration::from_secs(2),
            spec: SandboxSpec::default(),
        }
    }
}

impl PoolConfig {
    /// Apply environment overrides on top of the given config
    pub fn from_env(mut self) -> Self {
        if let Some(target) = env_usize("CASELAB_POOL_WARM_TARGET") {
            self.warm_target = target;
        }
        if let Some(cap) = env_usize("CASELAB_POOL_MAX_SANDBOXES") {
            self.max_sandboxes = cap;
        }
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0 && v <= 1024)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
