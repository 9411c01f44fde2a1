// ABOUTME: Per-execution streaming channels for live output delivery
// ABOUTME: Bounded broadcast fan-out; slow consumers lose oldest events, the producer never blocks

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use caselab_runtime::StreamKind;
use caselab_storage::{ExecutionRecord, ExecutionStatus};

/// An event on an execution's stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A chunk of stdout or stderr, in producer order
    OutputChunk { stream: StreamKind, text: String },
    /// The execution moved to a new status
    StatusChange { status: ExecutionStatus },
    /// Final event on every channel: the complete terminal record
    Terminal { execution: ExecutionRecord },
}

/// What a consumer gets when attaching to an execution
pub enum AttachResult {
    /// Execution in flight: events from this point onward
    Live(broadcast::Receiver<ExecutionEvent>),
    /// Execution already finished: the terminal record, immediately
    Finished(Box<ExecutionRecord>),
    /// Registry has never seen this execution
    Unknown,
}

enum ChannelSlot {
    Live(broadcast::Sender<ExecutionEvent>),
    Finished(Box<ExecutionRecord>),
}

/// Producer handle for one execution's channel
pub struct ChannelPublisher {
    execution_id: String,
    tx: broadcast::Sender<ExecutionEvent>,
}

impl ChannelPublisher {
    /// Best-effort send; delivery to consumers is never load-bearing
    pub fn publish(&self, event: ExecutionEvent) {
        if let Err(e) = self.tx.send(event) {
            // Send only fails with zero receivers, which is the normal
            // state when nobody is watching the stream.
            if self.tx.receiver_count() > 0 {
                warn!(execution_id = %self.execution_id, "Failed to broadcast event: {}", e);
            }
        }
    }
}

/// Registry of streaming channels keyed by execution ID.
///
/// Terminal results are retained for late attachers until the owner evicts
/// them; retention policy belongs to the caller, not the registry.
pub struct ChannelRegistry {
    capacity: usize,
    channels: Mutex<HashMap<String, ChannelSlot>>,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open the producer side of an execution's channel
    pub fn open(&self, execution_id: &str) -> ChannelPublisher {
        let (tx, _) = broadcast::channel(self.capacity);
        self.lock()
            .insert(execution_id.to_string(), ChannelSlot::Live(tx.clone()));
        ChannelPublisher {
            execution_id: execution_id.to_string(),
            tx,
        }
    }

    pub fn attach(&self, execution_id: &str) -> AttachResult {
        match self.lock().get(execution_id) {
            Some(ChannelSlot::Live(tx)) => AttachResult::Live(tx.subscribe()),
            Some(ChannelSlot::Finished(record)) => AttachResult::Finished(record.clone()),
            None => AttachResult::Unknown,
        }
    }

    /// Record the terminal result and close the channel.
    ///
    /// Consumes the publisher: replacing the live slot drops the registry's
    /// sender and the publisher's own sender drops on return, so the
    /// `Terminal` event is the last thing attached consumers receive before
    /// the channel reports closed.
    pub fn finish(&self, publisher: ChannelPublisher, record: ExecutionRecord) {
        let ChannelPublisher { execution_id, tx } = publisher;
        let record = Box::new(record);
        let previous = self
            .lock()
            .insert(execution_id.clone(), ChannelSlot::Finished(record.clone()));
        if previous.is_none() {
            debug!(execution_id, "Finished channel that was never opened");
        }
        let _ = tx.send(ExecutionEvent::Terminal { execution: *record });
    }

    /// Drop a retained terminal result
    pub fn evict(&self, execution_id: &str) {
        self.lock().remove(execution_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelSlot>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
