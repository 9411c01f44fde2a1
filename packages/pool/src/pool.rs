// ABOUTME: The container pool - warm sandbox bookkeeping, acquire/release, and replenishment
// ABOUTME: All shared state mutation goes through one mutex; sandbox I/O happens outside it

use caselab_runtime::{SandboxRuntime, SandboxSpec};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::handle::{HandleState, SandboxHandle};

#[derive(Error, Debug)]
pub enum PoolError {
    /// Pool is at its hard cap with no warm sandbox available.
    /// Callers decide whether to retry with backoff or fail the request.
    #[error("Pool exhausted: no sandbox available")]
    Exhausted,

    /// The container runtime failed or is unreachable; not retried internally
    #[error("Infrastructure unavailable: {0}")]
    Infrastructure(String),

    #[error("Pool is shutting down")]
    ShuttingDown,
}

type Result<T> = std::result::Result<T, PoolError>;

/// Pool counters exposed for observability
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub warm_count: usize,
    pub in_use_count: usize,
    pub total_created: u64,
    pub total_tainted: u64,
}

struct PoolInner {
    warm: VecDeque<SandboxHandle>,
    in_use: usize,
    /// Admission slots claimed by reservations not yet redeemed
    reserved: usize,
    total_created: u64,
    total_tainted: u64,
    next_slot: u64,
    shutting_down: bool,
}

/// Warm pool of pre-created sandboxes.
///
/// Construction has no side effects; call `start()` after the runtime is
/// confirmed reachable to warm the pool and launch the replenisher, and
/// `shutdown()` to drain and destroy everything.
pub struct ContainerPool {
    config: PoolConfig,
    runtime: Arc<dyn SandboxRuntime>,
    inner: Arc<Mutex<PoolInner>>,
    replenish: Arc<Notify>,
    replenisher: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerPool {
    pub fn new(config: PoolConfig, runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            config,
            runtime,
            inner: Arc::new(Mutex::new(PoolInner {
                warm: VecDeque::new(),
                in_use: 0,
                reserved: 0,
                total_created: 0,
                total_tainted: 0,
                next_slot: 0,
                shutting_down: false,
            })),
            replenish: Arc::new(Notify::new()),
            replenisher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Warm the pool to its target size and launch the background
    /// replenisher. Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        self.runtime
            .ping()
            .await
            .map_err(|e| PoolError::Infrastructure(e.to_string()))?;

        for _ in 0..self.config.warm_target {
            let handle = create_sandbox(
                &*self.runtime,
                &self.config.spec,
                self.config.creation_timeout,
                &self.inner,
            )
            .await?;
            lock(&self.inner).warm.push_back(handle);
        }

        info!(
            warm = self.config.warm_target,
            cap = self.config.max_sandboxes,
            "Container pool started"
        );

        let task = spawn_replenisher(
            self.config.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.inner),
            Arc::clone(&self.replenish),
        );
        *lock_handle(&self.replenisher) = Some(task);

        Ok(())
    }

    /// Claim an admission slot without doing any sandbox I/O.
    ///
    /// Fails with `Exhausted` when the hard cap leaves no room; the claimed
    /// slot is released if the reservation is dropped unredeemed.
    pub fn reserve(&self) -> Result<Reservation> {
        let mut inner = lock(&self.inner);
        if inner.shutting_down {
            return Err(PoolError::ShuttingDown);
        }
        if inner.in_use + inner.reserved >= self.config.max_sandboxes {
            return Err(PoolError::Exhausted);
        }
        inner.reserved += 1;

        Ok(Reservation {
            config: self.config.clone(),
            runtime: Arc::clone(&self.runtime),
            inner: Arc::clone(&self.inner),
            redeemed: false,
        })
    }

    /// Reserve and immediately activate; the common path for direct callers
    pub async fn acquire(&self) -> Result<SandboxHandle> {
        self.reserve()?.activate().await
    }

    /// Return a borrowed sandbox to the pool.
    ///
    /// A tainted handle (or one at its reuse ceiling) is destroyed and the
    /// replenisher is nudged to restore the warm target; otherwise the work
    /// directory is reset and the sandbox goes back to warm. The returned
    /// handle reflects its post-release state.
    pub async fn release(&self, mut handle: SandboxHandle, taint: bool) -> SandboxHandle {
        let at_ceiling = handle.reuse_count + 1 >= self.config.reuse_ceiling;

        if !taint && !at_ceiling {
            match self.runtime.reset_workdir(&handle.container_id).await {
                Ok(()) => {
                    handle.state = HandleState::Warm;
                    handle.reuse_count += 1;
                    handle.last_used_at = chrono::Utc::now();
                    let shutting_down = {
                        let mut inner = lock(&self.inner);
                        if inner.shutting_down {
                            true
                        } else {
                            inner.in_use = inner.in_use.saturating_sub(1);
                            inner.warm.push_back(handle.clone());
                            false
                        }
                    };
                    if !shutting_down {
                        return handle;
                    }
                    // Shutting down: destroy instead of rewarming
                }
                Err(e) => {
                    // A sandbox whose cleanliness cannot be proven is never
                    // handed to another execution.
                    warn!(
                        container = %handle.container_id,
                        "Workdir reset failed, destroying sandbox: {}", e
                    );
                    return self.destroy(handle, true).await;
                }
            }
            handle.state = HandleState::InUse;
            return self.destroy(handle, false).await;
        }

        if at_ceiling && !taint {
            debug!(
                container = %handle.container_id,
                reuse_count = handle.reuse_count,
                "Sandbox reached reuse ceiling, retiring"
            );
        }
        self.destroy(handle, taint).await
    }

    async fn destroy(&self, mut handle: SandboxHandle, taint: bool) -> SandboxHandle {
        {
            let mut inner = lock(&self.inner);
            inner.in_use = inner.in_use.saturating_sub(1);
            if taint {
                inner.total_tainted += 1;
            }
        }
        if taint {
            handle.state = HandleState::Tainted;
        }

        if let Err(e) = self.runtime.remove_sandbox(&handle.container_id).await {
            warn!(container = %handle.container_id, "Failed to remove sandbox: {}", e);
        }
        handle.state = HandleState::Destroyed;
        self.replenish.notify_one();
        handle
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            warm_count: inner.warm.len(),
            in_use_count: inner.in_use,
            total_created: inner.total_created,
            total_tainted: inner.total_tainted,
        }
    }

    /// Drain the warm list and destroy every idle sandbox.
    ///
    /// Borrowed sandboxes still in use are logged; their executions own the
    /// release path.
    pub async fn shutdown(&self) {
        if let Some(task) = lock_handle(&self.replenisher).take() {
            task.abort();
        }

        let (drained, in_use) = {
            let mut inner = lock(&self.inner);
            inner.shutting_down = true;
            let drained: Vec<SandboxHandle> = inner.warm.drain(..).collect();
            (drained, inner.in_use)
        };

        if in_use > 0 {
            warn!(in_use, "Pool shutdown with sandboxes still borrowed");
        }

        for handle in drained {
            if let Err(e) = self.runtime.remove_sandbox(&handle.container_id).await {
                warn!(container = %handle.container_id, "Failed to remove sandbox: {}", e);
            }
        }

        info!("Container pool shut down");
    }
}

/// An admission slot claimed from the pool, redeemed via `activate`.
pub struct Reservation {
    config: PoolConfig,
    runtime: Arc<dyn SandboxRuntime>,
    inner: Arc<Mutex<PoolInner>>,
    redeemed: bool,
}

impl Reservation {
    /// Redeem the reservation: pop a warm sandbox if one is available,
    /// otherwise create a fresh one (accepting the latency hit, bounded by
    /// the creation timeout). Creation failures are not retried.
    pub async fn activate(mut self) -> Result<SandboxHandle> {
        {
            let mut inner = lock(&self.inner);
            if let Some(mut handle) = inner.warm.pop_front() {
                inner.reserved -= 1;
                inner.in_use += 1;
                self.redeemed = true;
                handle.state = HandleState::InUse;
                handle.last_used_at = chrono::Utc::now();
                return Ok(handle);
            }
        }

        let mut handle = create_sandbox(
            &*self.runtime,
            &self.config.spec,
            self.config.creation_timeout,
            &self.inner,
        )
        .await?;

        {
            let mut inner = lock(&self.inner);
            inner.reserved -= 1;
            inner.in_use += 1;
        }
        self.redeemed = true;
        handle.state = HandleState::InUse;
        Ok(handle)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.redeemed {
            let mut inner = lock(&self.inner);
            inner.reserved = inner.reserved.saturating_sub(1);
        }
    }
}

async fn create_sandbox(
    runtime: &dyn SandboxRuntime,
    spec: &SandboxSpec,
    creation_timeout: Duration,
    inner: &Arc<Mutex<PoolInner>>,
) -> Result<SandboxHandle> {
    let created = tokio::time::timeout(creation_timeout, runtime.create_sandbox(spec)).await;

    let container_id = match created {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => return Err(PoolError::Infrastructure(e.to_string())),
        Err(_) => {
            return Err(PoolError::Infrastructure(format!(
                "sandbox creation timed out after {:?}",
                creation_timeout
            )))
        }
    };

    let slot = {
        let mut inner = lock(inner);
        inner.total_created += 1;
        inner.next_slot += 1;
        inner.next_slot
    };

    debug!(slot, container = %container_id, "Created sandbox");
    Ok(SandboxHandle::new(slot, container_id))
}

fn spawn_replenisher(
    config: PoolConfig,
    runtime: Arc<dyn SandboxRuntime>,
    inner: Arc<Mutex<PoolInner>>,
    notify: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.replenish_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let needs_one = |inner: &Arc<Mutex<PoolInner>>| {
            let inner = lock(inner);
            !inner.shutting_down
                && inner.warm.len() < config.warm_target
                && inner.warm.len() + inner.in_use + inner.reserved < config.max_sandboxes
        };

        loop {
            if !needs_one(&inner) {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = interval.tick() => {}
                }
                continue;
            }

            // At most one creation per tick: a burst of taints never causes
            // a thundering herd of simultaneous creations.
            interval.tick().await;
            if !needs_one(&inner) {
                continue;
            }

            match create_sandbox(&*runtime, &config.spec, config.creation_timeout, &inner).await {
                Ok(handle) => {
                    // Bookkeeping only while the lock is held; sandbox I/O
                    // happens after the guard is dropped.
                    let orphaned = {
                        let mut guard = lock(&inner);
                        if guard.shutting_down {
                            true
                        } else {
                            guard.warm.push_back(handle.clone());
                            false
                        }
                    };
                    if orphaned {
                        // The shutdown drain already ran; remove this one
                        // directly.
                        let _ = runtime.remove_sandbox(&handle.container_id).await;
                        break;
                    }
                }
                Err(e) => {
                    error!("Replenisher failed to create sandbox: {}", e);
                }
            }
        }
    })
}

fn lock<'a>(inner: &'a Arc<Mutex<PoolInner>>) -> MutexGuard<'a, PoolInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_handle(handle: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use caselab_runtime::{ExecHandle, RuntimeError, WorkFile};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Runtime stub that only counts lifecycle calls
    struct CountingRuntime {
        created: AtomicU64,
        removed: AtomicU64,
        resets: AtomicU64,
        fail_reset: bool,
    }

    impl CountingRuntime {
        fn new() -> Self {
            Self {
                created: AtomicU64::new(0),
                removed: AtomicU64::new(0),
                resets: AtomicU64::new(0),
                fail_reset: false,
            }
        }
    }

    #[async_trait]
    impl SandboxRuntime for CountingRuntime {
        async fn ping(&self) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn create_sandbox(
            &self,
            _spec: &SandboxSpec,
        ) -> std::result::Result<String, RuntimeError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("ctr-{}", n))
        }

        async fn inject_files(
            &self,
            _container_id: &str,
            _files: &[WorkFile],
        ) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn reset_workdir(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset {
                return Err(RuntimeError::Exec("reset failed".to_string()));
            }
            Ok(())
        }

        async fn exec_streaming(
            &self,
            _container_id: &str,
            _command: Vec<String>,
            _env_vars: HashMap<String, String>,
        ) -> std::result::Result<ExecHandle, RuntimeError> {
            Err(RuntimeError::Exec("not used in pool tests".to_string()))
        }

        async fn kill(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove_sandbox(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config(warm: usize, max: usize) -> PoolConfig {
        PoolConfig {
            warm_target: warm,
            max_sandboxes: max,
            replenish_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_prefers_warm_sandbox() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(2, 4), runtime.clone());
        pool.start().await.unwrap();

        let created_after_warmup = runtime.created.load(Ordering::SeqCst);
        let handle = pool.acquire().await.unwrap();

        assert_eq!(handle.state, HandleState::InUse);
        assert_eq!(runtime.created.load(Ordering::SeqCst), created_after_warmup);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_creates_when_warm_empty() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(0, 2), runtime.clone());
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.state, HandleState::InUse);
        assert!(runtime.created.load(Ordering::SeqCst) >= 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_when_at_cap() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(0, 1), runtime);
        pool.start().await.unwrap();

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_reservation_releases_slot() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(0, 1), runtime);
        pool.start().await.unwrap();

        let reservation = pool.reserve().unwrap();
        assert!(matches!(pool.reserve(), Err(PoolError::Exhausted)));
        drop(reservation);
        assert!(pool.reserve().is_ok());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_clean_release_returns_to_warm() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(1, 4), runtime.clone());
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        let released = pool.release(handle, false).await;

        assert_eq!(released.state, HandleState::Warm);
        assert_eq!(released.reuse_count, 1);
        assert_eq!(runtime.resets.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().warm_count, 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_tainted_release_destroys_sandbox() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(0, 4), runtime.clone());
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        let container_id = handle.container_id.clone();
        let released = pool.release(handle, true).await;

        assert_eq!(released.state, HandleState::Destroyed);
        assert_eq!(released.container_id, container_id);
        assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.total_tainted, 1);
        assert_eq!(stats.in_use_count, 0);
        // A tainted container never reappears in the warm list
        assert_eq!(stats.warm_count, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_reset_taints() {
        let mut runtime = CountingRuntime::new();
        runtime.fail_reset = true;
        let runtime = Arc::new(runtime);
        let pool = ContainerPool::new(test_config(0, 4), runtime.clone());
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        let released = pool.release(handle, false).await;

        assert_eq!(released.state, HandleState::Destroyed);
        assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().warm_count, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_reuse_ceiling_retires_sandbox() {
        let runtime = Arc::new(CountingRuntime::new());
        let config = PoolConfig {
            reuse_ceiling: 2,
            ..test_config(0, 4)
        };
        let pool = ContainerPool::new(config, runtime.clone());
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        let handle = pool.release(handle, false).await;
        assert_eq!(handle.state, HandleState::Warm);

        let handle = pool.acquire().await.unwrap();
        let released = pool.release(handle, false).await;

        // Second release hits the ceiling: destroyed but not tainted
        assert_eq!(released.state, HandleState::Destroyed);
        assert_eq!(pool.stats().total_tainted, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_replenisher_restores_warm_target() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(2, 8), runtime.clone());
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        pool.release(handle, true).await;

        // Replenisher is rate-limited to one creation per tick
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.stats().warm_count, 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_replenisher_paces_creations_from_the_first() {
        let runtime = Arc::new(CountingRuntime::new());
        let config = PoolConfig {
            replenish_interval: Duration::from_millis(200),
            ..test_config(2, 8)
        };
        let pool = ContainerPool::new(config, runtime.clone());
        pool.start().await.unwrap();

        // Taint both warm sandboxes at once
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a, true).await;
        pool.release(b, true).await;

        // The burst is spread across ticks: the second replacement
        // cannot land before a full interval has passed
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pool.stats().warm_count <= 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(pool.stats().warm_count, 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_destroys_warm_sandboxes() {
        let runtime = Arc::new(CountingRuntime::new());
        let pool = ContainerPool::new(test_config(3, 8), runtime.clone());
        pool.start().await.unwrap();

        pool.shutdown().await;
        assert_eq!(runtime.removed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().warm_count, 0);
    }
}
