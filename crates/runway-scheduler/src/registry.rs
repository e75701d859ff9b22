//! Runner registry: known runners, their capability labels and liveness.
//!
//! `busy` is owned by the lease path. A runner only becomes busy together
//! with a successful claim, and only returns to online through
//! [`RunnerRegistry::release`] once it holds no unfinished work.

use chrono::{DateTime, Duration, Utc};
use runway_core::{Result, Runner, RunnerHeartbeat, RunnerId, RunnerStatus};
use runway_db::SchedulerStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RunnerRegistry {
    store: Arc<dyn SchedulerStore>,
}

impl RunnerRegistry {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    /// Record a heartbeat. A runner cannot report itself busy; that is
    /// recorded as online.
    pub async fn heartbeat(&self, heartbeat: &RunnerHeartbeat) -> Result<Runner> {
        let mut heartbeat = heartbeat.clone();
        if heartbeat.status == RunnerStatus::Busy {
            heartbeat.status = RunnerStatus::Online;
        }
        let runner = self.store.record_heartbeat(&heartbeat).await?;
        debug!(runner_id = %runner.id, status = %runner.status, "Runner heartbeat");
        Ok(runner)
    }

    pub async fn get(&self, id: RunnerId) -> Result<Runner> {
        Ok(self.store.get_runner(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Runner>> {
        Ok(self.store.list_runners().await?)
    }

    /// Runners that can take a lease right now.
    pub async fn idle(&self) -> Result<Vec<Runner>> {
        let runners = self.store.list_runners().await?;
        Ok(runners
            .into_iter()
            .filter(|r| r.status == RunnerStatus::Online)
            .collect())
    }

    /// Whether any runner that is not offline advertises every label in
    /// `required`.
    pub async fn has_candidate(&self, required: &BTreeSet<String>) -> Result<bool> {
        let runners = self.store.list_runners().await?;
        Ok(runners
            .iter()
            .any(|r| r.status != RunnerStatus::Offline && r.satisfies(required)))
    }

    /// `busy -> online`. False when the runner was not busy, or still holds
    /// a lease or a revoked job that has not finished.
    pub async fn release(&self, id: RunnerId) -> Result<bool> {
        let released = self.store.release_runner(id).await?;
        if released.is_some() {
            debug!(runner_id = %id, "Runner released");
        }
        Ok(released.is_some())
    }

    /// Mark an unresponsive runner offline, whatever it was doing.
    pub async fn mark_offline(&self, id: RunnerId) -> Result<()> {
        for from in [RunnerStatus::Busy, RunnerStatus::Online] {
            if self
                .store
                .set_runner_status(id, from, RunnerStatus::Offline)
                .await?
                .is_some()
            {
                info!(runner_id = %id, was = %from, "Runner marked offline");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Mark online runners silent for longer than `timeout` offline. Busy
    /// runners are left to their lease expiry.
    pub async fn mark_stale_offline(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<RunnerId>> {
        let mut marked = Vec::new();
        for runner in self.store.list_runners().await? {
            if runner.status != RunnerStatus::Online || runner.last_heartbeat + timeout > now {
                continue;
            }
            let updated = self
                .store
                .set_runner_status(runner.id, RunnerStatus::Online, RunnerStatus::Offline)
                .await?;
            if updated.is_some() {
                info!(
                    runner_id = %runner.id,
                    last_heartbeat = %runner.last_heartbeat,
                    "Runner heartbeat timed out"
                );
                marked.push(runner.id);
            }
        }
        Ok(marked)
    }
}
