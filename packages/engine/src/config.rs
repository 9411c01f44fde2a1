// ABOUTME: Engine configuration with defaults and environment overrides
// ABOUTME: Timeout bounds, interpreter command, and streaming channel capacity

use serde::{Deserialize, Serialize};

/// Default capacity for the per-execution broadcast channel.
/// Can be overridden via the CASELAB_EVENT_CHANNEL_SIZE environment variable.
const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied when a request does not specify one
    pub default_timeout_secs: u64,
    /// Hard ceiling; requested timeouts are clamped to this
    pub max_timeout_secs: u64,
    /// Capacity of each execution's event broadcast channel
    pub event_channel_capacity: usize,
    /// Command prefix the script filename is appended to
    pub interpreter: Vec<String>,
    /// Filename the main script is injected as
    pub script_filename: String,
    /// Filename the execution parameters are injected as
    pub params_filename: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let event_channel_capacity = std::env::var("CASELAB_EVENT_CHANNEL_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| (10..=10000).contains(&v))
            .unwrap_or(DEFAULT_EVENT_CHANNEL_SIZE);

        Self {
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            event_channel_capacity,
            interpreter: vec!["python3".to_string()],
            script_filename: "main.py".to_string(),
            params_filename: "params.json".to_string(),
        }
    }
}

impl EngineConfig {
    /// The command that runs the injected script
    pub fn script_command(&self) -> Vec<String> {
        let mut cmd = self.interpreter.clone();
        cmd.push(self.script_filename.clone());
        cmd
    }
}
