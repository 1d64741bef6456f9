//! Polling worker — the loop that claims due actions and executes them.
//!
//! Any number of workers, in-process or across machines, may poll the same
//! store; `ActionStore::claim_due` is the only coordination between them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use cadence_core::config::SchedulerConfig;

use crate::action::ScheduledAction;
use crate::store::ActionStore;

/// Ceiling for the exponential backoff applied when polling itself fails.
const MAX_POLL_BACKOFF_SECS: f64 = 300.0;

/// Callback performing the real side effect of one claimed action. Must be
/// idempotent or duplicate-tolerant: at-most-once is attempted, not
/// guaranteed, across a crash-and-stale-recovery cycle.
pub type ExecuteCallback =
    Arc<dyn Fn(ScheduledAction) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Shared execution counters.
#[derive(Default)]
pub struct WorkerStats {
    poll_count: AtomicU64,
    executed_count: AtomicU64,
    failed_count: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            poll_count: self.poll_count.load(Ordering::Relaxed),
            executed_count: self.executed_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub poll_count: u64,
    pub executed_count: u64,
    pub failed_count: u64,
}

/// Background loop: sleep the poll interval, claim due actions, execute
/// each through the callback, record outcomes.
pub struct PollingWorker {
    store: Arc<ActionStore>,
    config: SchedulerConfig,
    execute: ExecuteCallback,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    stats: Arc<WorkerStats>,
    handle: Option<JoinHandle<()>>,
}

impl PollingWorker {
    /// Create a worker with an async execution callback.
    pub fn new<F, Fut>(store: Arc<ActionStore>, config: SchedulerConfig, execute: F) -> Self
    where
        F: Fn(ScheduledAction) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: ExecuteCallback = Arc::new(move |action| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(execute(action))
        });
        Self::with_callback(store, config, callback)
    }

    /// Create a worker from an already-boxed callback.
    pub fn with_callback(
        store: Arc<ActionStore>,
        config: SchedulerConfig,
        execute: ExecuteCallback,
    ) -> Self {
        Self {
            store,
            config,
            execute,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            stats: Arc::new(WorkerStats::default()),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start the poll loop. No-op if already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            claim_batch_size = self.config.claim_batch_size,
            "polling worker started"
        );
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let execute = Arc::clone(&self.execute);
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);
        let stats = Arc::clone(&self.stats);
        self.handle = Some(tokio::spawn(async move {
            run_loop(store, config, execute, running, shutdown, stats).await;
        }));
    }

    /// Signal the loop to exit after its current iteration and wait for it.
    /// In-flight callback invocations are allowed to finish. Actions left
    /// claimed by an interrupted batch are recovered by the stale-claim
    /// sweep on the next start.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
        tracing::info!("polling worker stopped");
    }
}

async fn run_loop(
    store: Arc<ActionStore>,
    config: SchedulerConfig,
    execute: ExecuteCallback,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    stats: Arc<WorkerStats>,
) {
    let nominal = Duration::from_secs_f64(config.poll_interval_seconds);
    let lookahead =
        chrono::Duration::milliseconds((config.claim_lookahead_seconds * 1000.0) as i64);
    let mut delay = nominal;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => break,
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        stats.poll_count.fetch_add(1, Ordering::Relaxed);
        let claimed = match store.claim_due(config.claim_batch_size, lookahead) {
            Ok(claimed) => {
                delay = nominal;
                claimed
            }
            Err(e) => {
                // Transient store failure: back off, never surface to the
                // execution callback.
                let backoff = (delay * 2).min(Duration::from_secs_f64(MAX_POLL_BACKOFF_SECS));
                tracing::warn!(error = %e, backoff_secs = backoff.as_secs_f64(), "poll failed");
                delay = backoff.max(nominal);
                continue;
            }
        };

        for action in claimed {
            let id = action.id;
            let owner = action.owner_key.clone();
            let kind = action.kind.as_str();
            match (execute)(action).await {
                Ok(()) => match store.mark_executed(id) {
                    Ok(true) => {
                        stats.executed_count.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(%id, owner = %owner, kind, "action executed");
                    }
                    // Another process already resolved it — race-lost, not
                    // an error.
                    Ok(false) => {
                        tracing::debug!(%id, "action resolved elsewhere, skipping mark");
                    }
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "failed to record execution");
                    }
                },
                Err(e) => {
                    // Isolated per-action failure: the rest of the batch
                    // continues; the action stays claimed until a future
                    // stale-claim sweep reclaims it.
                    stats.failed_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%id, owner = %owner, error = %e, "action execution failed");
                }
            }
        }
    }
}
