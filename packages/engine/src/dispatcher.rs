// ABOUTME: Execution dispatcher - takes admitted executions into pooled sandboxes
// ABOUTME: Reserves a slot synchronously, spawns a worker, and enforces deadlines and cancellation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use caselab_pool::{ContainerPool, PoolError, Reservation, SandboxHandle};
use caselab_runtime::{ExecHandle, SandboxRuntime, WorkFile};
use caselab_storage::{CaselabStorage, ExecutionRecord, ExecutionStatus};

use crate::catalog::ScriptCatalog;
use crate::channel::{AttachResult, ChannelPublisher, ChannelRegistry, ExecutionEvent};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// An execution that already passed admission (session state, quota,
/// pre-flight validation). Carries everything the worker needs.
pub struct AdmittedExecution {
    pub record: ExecutionRecord,
    /// Resolved script source to inject and run
    pub source: String,
    /// Effective deadline, already clamped by session quota and engine max
    pub timeout: Duration,
}

/// Dispatches admitted executions into sandboxes.
///
/// `dispatch` returns as soon as the execution is durably admitted; all
/// sandbox work happens in a spawned worker that reports through storage
/// and the streaming channel.
pub struct Dispatcher {
    pool: Arc<ContainerPool>,
    runtime: Arc<dyn SandboxRuntime>,
    storage: CaselabStorage,
    catalog: Arc<dyn ScriptCatalog>,
    config: EngineConfig,
    channels: Arc<ChannelRegistry>,
    /// Cancellation tokens for in-flight executions
    inflight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ContainerPool>,
        runtime: Arc<dyn SandboxRuntime>,
        storage: CaselabStorage,
        catalog: Arc<dyn ScriptCatalog>,
        config: EngineConfig,
    ) -> Self {
        let channels = Arc::new(ChannelRegistry::new(config.event_channel_capacity));
        Self {
            pool,
            runtime,
            storage,
            catalog,
            config,
            channels,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ScriptCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ContainerPool> {
        &self.pool
    }

    /// Admit an execution into the pool and spawn its worker.
    ///
    /// The pool slot is reserved before the record is persisted, so an
    /// exhausted pool rejects the request without leaving a record behind.
    /// Returns the execution ID once the worker is running.
    pub async fn dispatch(&self, admitted: AdmittedExecution) -> Result<String> {
        let reservation = self.pool.reserve().map_err(|e| match e {
            PoolError::Exhausted => EngineError::PoolExhausted,
            other => EngineError::InfrastructureUnavailable(other.to_string()),
        })?;

        let execution_id = admitted.record.id.clone();
        self.storage.create_execution(&admitted.record).await?;

        let publisher = self.channels.open(&execution_id);
        let token = CancellationToken::new();
        lock_inflight(&self.inflight).insert(execution_id.clone(), token.clone());

        info!(
            execution_id = %execution_id,
            session_id = %admitted.record.session_id,
            timeout_secs = admitted.timeout.as_secs(),
            "Dispatching execution"
        );

        let worker = Worker {
            pool: Arc::clone(&self.pool),
            runtime: Arc::clone(&self.runtime),
            storage: self.storage.clone(),
            channels: Arc::clone(&self.channels),
            inflight: Arc::clone(&self.inflight),
            config: self.config.clone(),
        };
        tokio::spawn(async move {
            worker.run(admitted, reservation, publisher, token).await;
        });

        Ok(execution_id)
    }

    /// Point-in-time status snapshot from storage
    pub async fn status(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.storage
            .get_execution(execution_id)
            .await
            .map_err(map_execution_lookup)
    }

    /// Signal cancellation of a pending or running execution.
    ///
    /// Returns once the signal is issued; the worker performs the kill,
    /// release, and finalization asynchronously.
    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let record = self
            .storage
            .get_execution(execution_id)
            .await
            .map_err(map_execution_lookup)?;

        if record.status.is_terminal() {
            return Err(EngineError::NotCancellable {
                id: execution_id.to_string(),
                status: record.status,
            });
        }

        let token = lock_inflight(&self.inflight).get(execution_id).cloned();
        match token {
            Some(token) => {
                info!(execution_id, "Cancellation requested");
                token.cancel();
                Ok(())
            }
            // Record says non-terminal but no worker owns it; a crash left
            // it dangling and there is nothing to signal.
            None => Err(EngineError::NotCancellable {
                id: execution_id.to_string(),
                status: record.status,
            }),
        }
    }

    /// Attach to an execution's event stream
    pub async fn attach(&self, execution_id: &str) -> Result<AttachResult> {
        match self.channels.attach(execution_id) {
            AttachResult::Unknown => {
                // Evicted or pre-restart execution: storage is the fallback
                let record = self
                    .storage
                    .get_execution(execution_id)
                    .await
                    .map_err(map_execution_lookup)?;
                if record.status.is_terminal() {
                    Ok(AttachResult::Finished(Box::new(record)))
                } else {
                    Ok(AttachResult::Unknown)
                }
            }
            attached => Ok(attached),
        }
    }

    /// Drop the retained terminal events for an execution
    pub fn evict_channel(&self, execution_id: &str) {
        self.channels.evict(execution_id);
    }
}

fn map_execution_lookup(e: caselab_storage::StorageError) -> EngineError {
    match e {
        caselab_storage::StorageError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
        other => EngineError::Storage(other),
    }
}

fn lock_inflight(
    inflight: &Arc<Mutex<HashMap<String, CancellationToken>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    inflight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a running exec ended
enum ExecEnd {
    /// Process exited on its own
    Exited { exit_code: i64, duration: Duration },
    /// Deadline elapsed before the process ended
    DeadlineElapsed,
    /// Cancellation token fired
    Cancelled,
    /// The runtime dropped the outcome channel without a result
    OutcomeLost,
}

struct Worker {
    pool: Arc<ContainerPool>,
    runtime: Arc<dyn SandboxRuntime>,
    storage: CaselabStorage,
    channels: Arc<ChannelRegistry>,
    inflight: Arc<Mutex<HashMap<String, CancellationToken>>>,
    config: EngineConfig,
}

impl Worker {
    async fn run(
        &self,
        admitted: AdmittedExecution,
        reservation: Reservation,
        publisher: ChannelPublisher,
        token: CancellationToken,
    ) {
        let execution_id = admitted.record.id.clone();

        let handle = match reservation.activate().await {
            Ok(handle) => handle,
            Err(e) => {
                // An unreachable runtime is an infrastructure failure; it is
                // reported as one, never dressed up as a script result.
                error!(execution_id = %execution_id, "Sandbox activation failed: {}", e);
                self.fail_infrastructure(&execution_id, &e.to_string(), publisher)
                    .await;
                return;
            }
        };

        match self.prepare(&admitted, &handle, &publisher).await {
            Ok(exec) => {
                self.drive_to_completion(&admitted, &handle, exec, publisher, &token)
                    .await;
            }
            Err(message) => {
                error!(execution_id = %execution_id, "Execution setup failed: {}", message);
                self.pool.release(handle, true).await;
                self.fail_infrastructure(&execution_id, &message, publisher)
                    .await;
            }
        }
    }

    /// Inject files, mark the record running, and start the exec.
    /// Returns `Err` only for infrastructure failures before the exec
    /// started.
    async fn prepare(
        &self,
        admitted: &AdmittedExecution,
        handle: &SandboxHandle,
        publisher: &ChannelPublisher,
    ) -> std::result::Result<ExecHandle, String> {
        let execution_id = &admitted.record.id;

        let params = serde_json::to_vec(&admitted.record.parameters)
            .map_err(|e| format!("parameter serialization: {}", e))?;
        let files = vec![
            WorkFile::new(self.config.script_filename.clone(), admitted.source.as_bytes()),
            WorkFile::new(self.config.params_filename.clone(), params),
        ];
        self.runtime
            .inject_files(&handle.container_id, &files)
            .await
            .map_err(|e| format!("file injection: {}", e))?;

        if let Err(e) = self.storage.mark_running(execution_id, chrono::Utc::now()).await {
            return Err(format!("storage: {}", e));
        }
        publisher.publish(ExecutionEvent::StatusChange {
            status: ExecutionStatus::Running,
        });

        self.runtime
            .exec_streaming(&handle.container_id, self.config.script_command(), HashMap::new())
            .await
            .map_err(|e| format!("exec start: {}", e))
    }

    /// Pump output until the process exits, the deadline fires, or the
    /// execution is cancelled; then release the sandbox and finalize.
    async fn drive_to_completion(
        &self,
        admitted: &AdmittedExecution,
        handle: &SandboxHandle,
        exec: ExecHandle,
        publisher: ChannelPublisher,
        token: &CancellationToken,
    ) {
        let execution_id = &admitted.record.id;
        let started = std::time::Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();

        let ExecHandle {
            mut output,
            outcome: mut outcome_rx,
        } = exec;

        let deadline = tokio::time::sleep(admitted.timeout);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                maybe_chunk = output.recv() => {
                    match maybe_chunk {
                        Some(chunk) => {
                            forward_chunk(&chunk, &mut stdout, &mut stderr, &publisher);
                        }
                        None => {
                            // Output closed: the exit code resolves promptly,
                            // with a grace window against a hung runtime.
                            let waited = tokio::time::timeout(
                                Duration::from_secs(10),
                                &mut outcome_rx,
                            )
                            .await;
                            break match waited {
                                Ok(Ok(outcome)) => ExecEnd::Exited {
                                    exit_code: outcome.exit_code,
                                    duration: outcome.duration,
                                },
                                _ => ExecEnd::OutcomeLost,
                            };
                        }
                    }
                }
                _ = &mut deadline => break ExecEnd::DeadlineElapsed,
                _ = token.cancelled() => break ExecEnd::Cancelled,
            }
        };

        let (status, exit_code, duration_ms, error_message) = match end {
            ExecEnd::Exited { exit_code, duration } => {
                let status = if exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                (status, Some(exit_code), Some(duration.as_millis() as i64), None)
            }
            ExecEnd::DeadlineElapsed => {
                warn!(
                    execution_id = %execution_id,
                    timeout_secs = admitted.timeout.as_secs(),
                    "Execution deadline elapsed, killing sandbox"
                );
                self.kill_and_drain(handle, &mut output, &mut stdout, &mut stderr, &publisher)
                    .await;
                (
                    ExecutionStatus::Timeout,
                    None,
                    Some(started.elapsed().as_millis() as i64),
                    None,
                )
            }
            ExecEnd::Cancelled => {
                debug!(execution_id = %execution_id, "Execution cancelled, killing sandbox");
                self.kill_and_drain(handle, &mut output, &mut stdout, &mut stderr, &publisher)
                    .await;
                (
                    ExecutionStatus::Cancelled,
                    None,
                    Some(started.elapsed().as_millis() as i64),
                    None,
                )
            }
            ExecEnd::OutcomeLost => (
                ExecutionStatus::Failed,
                None,
                Some(started.elapsed().as_millis() as i64),
                Some("infrastructure: exec outcome lost".to_string()),
            ),
        };

        // Anything but a clean completion taints the sandbox.
        let taint = status != ExecutionStatus::Completed;
        self.pool.release(handle.clone(), taint).await;

        self.finalize(
            execution_id,
            status,
            &stdout,
            &stderr,
            exit_code,
            duration_ms,
            error_message.as_deref(),
            publisher,
        )
        .await;
    }

    /// Hard-kill the sandbox, then pull whatever output already arrived
    async fn kill_and_drain(
        &self,
        handle: &SandboxHandle,
        output: &mut tokio::sync::mpsc::UnboundedReceiver<caselab_runtime::OutputChunk>,
        stdout: &mut String,
        stderr: &mut String,
        publisher: &ChannelPublisher,
    ) {
        if let Err(e) = self.runtime.kill(&handle.container_id).await {
            warn!(container = %handle.container_id, "Kill failed: {}", e);
        }
        while let Ok(chunk) = output.try_recv() {
            forward_chunk(&chunk, stdout, stderr, publisher);
        }
    }

    async fn fail_infrastructure(
        &self,
        execution_id: &str,
        message: &str,
        publisher: ChannelPublisher,
    ) {
        self.finalize(
            execution_id,
            ExecutionStatus::Failed,
            "",
            "",
            None,
            None,
            Some(&format!("infrastructure: {}", message)),
            publisher,
        )
        .await;
    }

    /// Persist the terminal result, close the streaming channel, and drop
    /// the in-flight bookkeeping.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i64>,
        duration_ms: Option<i64>,
        error_message: Option<&str>,
        publisher: ChannelPublisher,
    ) {
        match self
            .storage
            .finalize_execution(
                execution_id,
                status,
                stdout,
                stderr,
                exit_code,
                duration_ms,
                error_message,
            )
            .await
        {
            Ok(true) => {
                info!(execution_id, status = status.as_str(), "Execution finalized");
            }
            Ok(false) => {
                // Already terminal; the stored record wins.
            }
            Err(e) => {
                error!(execution_id, "Failed to finalize execution: {}", e);
            }
        }

        match self.storage.get_execution(execution_id).await {
            Ok(record) => self.channels.finish(publisher, record),
            Err(e) => {
                error!(execution_id, "Failed to load terminal record: {}", e);
                // Dropping the publisher closes the channel for attached
                // consumers even without a terminal event.
                self.channels.evict(execution_id);
                drop(publisher);
            }
        }
        lock_inflight(&self.inflight).remove(execution_id);
    }
}

fn forward_chunk(
    chunk: &caselab_runtime::OutputChunk,
    stdout: &mut String,
    stderr: &mut String,
    publisher: &ChannelPublisher,
) {
    let text = String::from_utf8_lossy(&chunk.data).into_owned();
    match chunk.stream {
        caselab_runtime::StreamKind::Stdout => stdout.push_str(&text),
        caselab_runtime::StreamKind::Stderr => stderr.push_str(&text),
    }
    publisher.publish(ExecutionEvent::OutputChunk {
        stream: chunk.stream,
        text,
    });
}
