//! Scheduler facade — lifecycle wrapper composing the store and the worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use cadence_core::config::SchedulerConfig;
use cadence_core::error::{CadenceError, Result};

use crate::action::{ActionStatus, ScheduledAction};
use crate::store::ActionStore;
use crate::worker::{ExecuteCallback, PollingWorker, StatsSnapshot};

/// Operational snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub running: bool,
    pub poll_count: u64,
    pub executed_count: u64,
    pub failed_count: u64,
    /// Row counts in the store, keyed by status.
    pub actions: BTreeMap<String, usize>,
    pub config: SchedulerConfig,
}

/// Composes `ActionStore` + `PollingWorker`: start/stop, submit, cancel,
/// health. Discovery of due work is polling-driven, so `submit` is
/// validation and logging, not a push path.
pub struct Scheduler {
    store: Arc<ActionStore>,
    worker: PollingWorker,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler with an async execution callback.
    pub fn new<F, Fut>(store: Arc<ActionStore>, config: SchedulerConfig, execute: F) -> Self
    where
        F: Fn(ScheduledAction) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let worker = PollingWorker::new(Arc::clone(&store), config.clone(), execute);
        Self { store, worker, config }
    }

    /// Create a scheduler from an already-boxed callback.
    pub fn with_callback(
        store: Arc<ActionStore>,
        config: SchedulerConfig,
        execute: ExecuteCallback,
    ) -> Self {
        let worker = PollingWorker::with_callback(Arc::clone(&store), config.clone(), execute);
        Self { store, worker, config }
    }

    /// Recover actions left claimed by a previous run, then start polling.
    pub fn start(&mut self) -> Result<()> {
        let threshold =
            chrono::Duration::seconds(self.config.stale_claim_threshold_seconds as i64);
        let recovered = self.store.reset_stale_claims(threshold)?;
        if recovered > 0 {
            tracing::info!(count = recovered, "recovered stale claims from previous run");
        }
        self.worker.start();
        Ok(())
    }

    /// Validate an action the caller created via `ActionStore::create`.
    /// It must exist and still be pending — discovery happens by polling.
    pub fn submit(&self, action: &ScheduledAction) -> Result<()> {
        let stored = self.store.get(action.id)?.ok_or_else(|| {
            CadenceError::Validation(format!(
                "action {} is not in the store; create it via ActionStore::create",
                action.id
            ))
        })?;
        if stored.status != ActionStatus::Pending {
            return Err(CadenceError::Validation(format!(
                "action {} is {}, not pending",
                action.id, stored.status
            )));
        }
        tracing::info!(id = %action.id, owner = %action.owner_key,
            kind = action.kind.as_str(), due_at = %action.due_at, "action submitted");
        Ok(())
    }

    /// Cancel a pending action. Returns `false` when it is no longer
    /// pending — in-flight work cannot be retracted.
    pub fn cancel(&self, id: Uuid, reason: &str) -> Result<bool> {
        let cancelled = self.store.cancel(id, reason)?;
        if cancelled {
            tracing::info!(%id, reason, "action cancelled");
        } else {
            tracing::debug!(%id, "cancel rejected, action no longer pending");
        }
        Ok(cancelled)
    }

    /// Operational snapshot for monitoring.
    pub fn health(&self) -> Result<Health> {
        let StatsSnapshot { poll_count, executed_count, failed_count } = self.worker.stats();
        let actions = self
            .store
            .count_by_status()?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        Ok(Health {
            running: self.worker.is_running(),
            poll_count,
            executed_count,
            failed_count,
            actions,
            config: self.config.clone(),
        })
    }

    /// Stop the worker and await in-flight work.
    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }

    /// Access the underlying store (action creation is the caller's job).
    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }
}
