// ABOUTME: Session lifecycle manager - creation, pausing, expiry, termination, and admission
// ABOUTME: A per-session lock serializes admission against concurrent lifecycle transitions

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use caselab_engine::{
    validate_script, AdmittedExecution, AttachResult, CatalogError, Dispatcher, EngineError,
    Result,
};
use caselab_pool::PoolStats;
use caselab_storage::{
    CaselabStorage, ExecutionRecord, Session, SessionQuota, SessionStatus, StorageError,
};

use crate::config::SessionConfig;

/// The script_ref whose source is versioned on the session itself
const MAIN_SCRIPT: &str = "main";

/// Manages student sessions and admits executions into the engine.
///
/// This is the interface the outer API layer consumes; nothing below it
/// is reachable from outside the workspace.
pub struct SessionManager {
    storage: CaselabStorage,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    /// Per-session admission locks; entries are dropped on terminate
    admission: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(storage: CaselabStorage, dispatcher: Arc<Dispatcher>, config: SessionConfig) -> Self {
        Self {
            storage,
            dispatcher,
            config,
            admission: Mutex::new(HashMap::new()),
        }
    }

    // ==================== Session Lifecycle ====================

    /// Create a session for a case, seeding the original working-copy slot
    /// from the catalog's main script.
    pub async fn create_session(
        &self,
        user_id: &str,
        case_ref: caselab_storage::CaseRef,
        quota: Option<SessionQuota>,
    ) -> Result<Session> {
        let original_source = self
            .dispatcher
            .catalog()
            .resolve(&case_ref, MAIN_SCRIPT)
            .await
            .map_err(map_catalog_error)?;

        let session = Session::new(
            user_id,
            case_ref,
            quota.unwrap_or_default(),
            original_source,
            self.config.ttl(),
        );
        self.storage.create_session(&session).await?;

        info!(
            session_id = %session.id,
            user_id,
            case = %session.case_ref,
            "Session created"
        );
        Ok(session)
    }

    /// Load a session, applying lazy expiry first.
    ///
    /// There is no background sweeper; any access past `expires_at` moves
    /// an active or paused session to expired before it is returned.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let mut session = self.load(session_id).await?;

        if !session.status.is_terminal() && Utc::now() >= session.expires_at {
            if self
                .storage
                .update_session_status(session_id, SessionStatus::Expired)
                .await?
            {
                debug!(session_id, "Session lazily expired");
                session.status = SessionStatus::Expired;
                // Expired is terminal; the admission lock entry would
                // otherwise outlive the session. Holders keep their Arc.
                self.lock_admission().remove(session_id);
            } else {
                // A concurrent transition won; re-read the truth
                session = self.load(session_id).await?;
            }
        }

        Ok(session)
    }

    pub async fn pause(&self, session_id: &str) -> Result<Session> {
        let lock = self.admission_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.get_session(session_id).await?;
        match session.status {
            SessionStatus::Paused => Ok(session),
            SessionStatus::Active => {
                self.transition(session_id, SessionStatus::Paused).await
            }
            status => Err(EngineError::SessionTerminal {
                id: session_id.to_string(),
                status,
            }),
        }
    }

    pub async fn resume(&self, session_id: &str) -> Result<Session> {
        let lock = self.admission_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.get_session(session_id).await?;
        match session.status {
            SessionStatus::Active => Ok(session),
            SessionStatus::Paused => {
                self.transition(session_id, SessionStatus::Active).await
            }
            status => Err(EngineError::SessionTerminal {
                id: session_id.to_string(),
                status,
            }),
        }
    }

    /// Push the session deadline forward by `additional`.
    pub async fn extend(&self, session_id: &str, additional: Duration) -> Result<Session> {
        let lock = self.admission_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(EngineError::SessionTerminal {
                id: session_id.to_string(),
                status: session.status,
            });
        }

        let new_expiry = session.expires_at
            + chrono::Duration::from_std(additional)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.storage.extend_session(session_id, new_expiry).await?;

        info!(session_id, expires_at = %new_expiry, "Session extended");
        self.load(session_id).await
    }

    /// Terminate a session and cancel its in-flight executions.
    ///
    /// Idempotent: terminating a session that is already terminal still
    /// sweeps stragglers and returns Ok.
    pub async fn terminate(&self, session_id: &str) -> Result<()> {
        let lock = self.admission_lock(session_id);
        let _guard = lock.lock().await;

        // Existence check happens before anything else
        self.load(session_id).await?;

        let changed = self
            .storage
            .update_session_status(session_id, SessionStatus::Terminated)
            .await?;
        if changed {
            info!(session_id, "Session terminated");
        }

        let active = self.storage.list_active_execution_ids(session_id).await?;
        for execution_id in active {
            match self.dispatcher.cancel(&execution_id).await {
                Ok(()) => {}
                // Already finished between listing and cancelling
                Err(EngineError::NotCancellable { .. }) => {}
                Err(e) => {
                    warn!(
                        session_id,
                        execution_id = %execution_id,
                        "Failed to cancel execution during terminate: {}", e
                    );
                }
            }
        }

        self.lock_admission().remove(session_id);
        Ok(())
    }

    /// Save the student's edit into the session's modified slot
    pub async fn update_working_copy(&self, session_id: &str, source: &str) -> Result<Session> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(EngineError::SessionTerminal {
                id: session_id.to_string(),
                status: session.status,
            });
        }

        self.storage.update_working_copy(session_id, source).await?;
        self.load(session_id).await
    }

    // ==================== Execution Admission ====================

    /// Admit and dispatch an execution for a session.
    ///
    /// Runs entirely under the session's admission lock, so a concurrent
    /// pause/terminate or second start observes either the state before
    /// this call or after it, never the middle. Rejections happen before
    /// any record or sandbox is consumed.
    pub async fn start_execution(
        &self,
        session_id: &str,
        script_ref: &str,
        parameters: HashMap<String, serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let lock = self.admission_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.get_session(session_id).await?;
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Paused => {
                return Err(EngineError::SessionNotActive {
                    id: session_id.to_string(),
                    status: session.status,
                });
            }
            status => {
                return Err(EngineError::SessionTerminal {
                    id: session_id.to_string(),
                    status,
                });
            }
        }

        // For the main script the session's modified slot wins over the
        // catalog; auxiliary scripts always come from the catalog.
        let source = if script_ref == MAIN_SCRIPT {
            session.effective_source().to_string()
        } else {
            self.dispatcher
                .catalog()
                .resolve(&session.case_ref, script_ref)
                .await
                .map_err(map_catalog_error)?
        };

        validate_script(&source).map_err(|issue| EngineError::SyntaxError(issue.to_string()))?;

        let in_flight = self.storage.count_active_executions(session_id).await?;
        if in_flight >= session.quota.max_concurrent_executions as i64 {
            return Err(EngineError::ConcurrencyLimitExceeded {
                limit: session.quota.max_concurrent_executions,
            });
        }

        let engine_config = self.dispatcher.config();
        let requested = timeout
            .unwrap_or_else(|| Duration::from_secs(engine_config.default_timeout_secs));
        let effective = requested
            .min(Duration::from_secs(session.quota.max_execution_secs))
            .min(Duration::from_secs(engine_config.max_timeout_secs));

        let record = ExecutionRecord::new(session_id, script_ref, parameters);
        self.dispatcher
            .dispatch(AdmittedExecution {
                record,
                source,
                timeout: effective,
            })
            .await
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.dispatcher.status(execution_id).await
    }

    pub async fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        self.dispatcher.cancel(execution_id).await
    }

    pub async fn attach_stream(&self, execution_id: &str) -> Result<AttachResult> {
        self.dispatcher.attach(execution_id).await
    }

    pub async fn list_executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.load(session_id).await?;
        Ok(self.storage.list_executions(session_id).await?)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.dispatcher.pool().stats()
    }

    // ==================== Internals ====================

    async fn load(&self, session_id: &str) -> Result<Session> {
        self.storage
            .get_session(session_id)
            .await
            .map_err(|e| match e {
                StorageError::SessionNotFound(id) => EngineError::SessionNotFound(id),
                other => EngineError::Storage(other),
            })
    }

    async fn transition(&self, session_id: &str, status: SessionStatus) -> Result<Session> {
        if !self.storage.update_session_status(session_id, status).await? {
            let current = self.load(session_id).await?;
            return Err(EngineError::SessionTerminal {
                id: session_id.to_string(),
                status: current.status,
            });
        }
        debug!(session_id, status = status.as_str(), "Session transitioned");
        self.load(session_id).await
    }

    fn admission_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lock_admission()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn lock_admission(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn map_catalog_error(e: CatalogError) -> EngineError {
    match e {
        CatalogError::NotFound { script_ref, case } => {
            EngineError::ScriptNotFound(format!("{}/{}", case, script_ref))
        }
        CatalogError::Backend(message) => EngineError::InfrastructureUnavailable(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use caselab_engine::{EngineConfig, StaticCatalog};
    use caselab_pool::{ContainerPool, PoolConfig};
    use caselab_runtime::{ExecHandle, RuntimeError, SandboxRuntime, SandboxSpec, WorkFile};
    use caselab_storage::CaseRef;

    /// Runtime stub for tests that never reach an exec
    struct IdleRuntime;

    #[async_trait]
    impl SandboxRuntime for IdleRuntime {
        async fn ping(&self) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn create_sandbox(
            &self,
            _spec: &SandboxSpec,
        ) -> std::result::Result<String, RuntimeError> {
            Ok("ctr-0".to_string())
        }

        async fn inject_files(
            &self,
            _container_id: &str,
            _files: &[WorkFile],
        ) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn reset_workdir(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn exec_streaming(
            &self,
            _container_id: &str,
            _command: Vec<String>,
            _env_vars: HashMap<String, String>,
        ) -> std::result::Result<ExecHandle, RuntimeError> {
            Err(RuntimeError::Exec("idle runtime".to_string()))
        }

        async fn kill(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove_sandbox(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
    }

    async fn manager_with_ttl(ttl_secs: u64) -> SessionManager {
        let db = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let storage = CaselabStorage::new(Arc::new(db));
        storage.migrate().await.unwrap();

        let pool_config = PoolConfig {
            warm_target: 0,
            max_sandboxes: 1,
            replenish_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let pool = Arc::new(ContainerPool::new(pool_config, Arc::new(IdleRuntime)));
        pool.start().await.unwrap();

        let catalog = Arc::new(StaticCatalog::new().with_script(
            &CaseRef::new("hydraulics", "tanks", "water-tank"),
            MAIN_SCRIPT,
            "print('ok')",
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            pool,
            Arc::new(IdleRuntime),
            storage.clone(),
            catalog,
            EngineConfig::default(),
        ));
        SessionManager::new(
            storage,
            dispatcher,
            SessionConfig {
                default_ttl_secs: ttl_secs,
            },
        )
    }

    #[tokio::test]
    async fn test_lazy_expiry_drops_admission_lock_entry() {
        let manager = manager_with_ttl(0).await;
        let session = manager
            .create_session(
                "student-1",
                CaseRef::new("hydraulics", "tanks", "water-tank"),
                None,
            )
            .await
            .unwrap();

        // Pause takes out the admission lock, then observes the expiry
        let err = manager.pause(&session.id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SessionTerminal {
                status: SessionStatus::Expired,
                ..
            }
        ));

        // The expiry pruned the per-session entry along with the session
        assert!(manager.lock_admission().is_empty());
    }
}
