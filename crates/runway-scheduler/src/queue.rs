//! Dispatch queue backed by the durable store.
//!
//! Dispatch order is `(priority desc, created_at asc)`. Entries whose job has
//! unmet dependencies, labels no runner offers, a pending backoff or a
//! quarantine are invisible to [`DispatchQueue::peek_ready`].

use chrono::{DateTime, Utc};
use runway_core::{EntryId, Error, Job, JobId, QueueEntry, QueueStatus, Result, RunnerId};
use runway_db::SchedulerStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn SchedulerStore>,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    /// Insert a `pending` entry for `job`. Fails with
    /// [`Error::DuplicateEntry`] if the job already has a live entry.
    pub async fn enqueue(
        &self,
        job: &Job,
        priority: i32,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let mut entry = QueueEntry::pending(job, data, now);
        entry.priority = priority;
        let entry = self.store.enqueue(&entry).await?;
        info!(entry_id = %entry.id, job_id = %job.id, priority, "Enqueued job");
        Ok(entry)
    }

    /// The next entry a runner advertising `labels` may lease. Does not
    /// mutate anything.
    pub async fn peek_ready(
        &self,
        labels: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>> {
        Ok(self.store.peek_ready(labels, now).await?)
    }

    /// `processing -> completed` for the lease holder.
    pub async fn mark_completed(&self, id: EntryId, runner_id: RunnerId) -> Result<QueueEntry> {
        self.finish(id, runner_id, QueueStatus::Completed).await
    }

    /// `processing -> failed` for the lease holder.
    pub async fn mark_failed(&self, id: EntryId, runner_id: RunnerId) -> Result<QueueEntry> {
        self.finish(id, runner_id, QueueStatus::Failed).await
    }

    async fn finish(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        outcome: QueueStatus,
    ) -> Result<QueueEntry> {
        self.store
            .finish_entry(id, runner_id, outcome)
            .await?
            .ok_or_else(|| {
                Error::NotLeaseHolder(format!("runner {} does not hold entry {}", runner_id, id))
            })
    }

    /// `from -> outcome` regardless of holder. `None` when the entry was no
    /// longer in `from`.
    pub async fn retire(
        &self,
        id: EntryId,
        from: QueueStatus,
        outcome: QueueStatus,
    ) -> Result<Option<QueueEntry>> {
        Ok(self.store.retire_entry(id, from, outcome).await?)
    }

    pub async fn get(&self, id: EntryId) -> Result<QueueEntry> {
        Ok(self.store.get_entry(id).await?)
    }

    /// The job's most recent entry.
    pub async fn entry_for_job(&self, job_id: JobId) -> Result<Option<QueueEntry>> {
        Ok(self.store.entry_for_job(job_id).await?)
    }

    /// Every `pending` and `processing` entry in dispatch order.
    pub async fn snapshot(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.store.live_entries().await?)
    }

    pub async fn quarantine(&self, id: EntryId, reason: &str) -> Result<()> {
        Ok(self.store.quarantine_entry(id, reason).await?)
    }
}
