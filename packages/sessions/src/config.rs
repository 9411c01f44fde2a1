// ABOUTME: Session lifecycle configuration
// ABOUTME: Session TTL with an environment override

use serde::{Deserialize, Serialize};

/// Default session lifetime in seconds.
/// Can be overridden via the CASELAB_SESSION_TTL_SECS environment variable.
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lifetime granted to new sessions
    pub default_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let default_ttl_secs = std::env::var("CASELAB_SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| (60..=86400).contains(&v))
            .unwrap_or(DEFAULT_SESSION_TTL_SECS);

        Self { default_ttl_secs }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_ttl_secs as i64)
    }
}
