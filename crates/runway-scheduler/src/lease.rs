//! Lease manager: exclusive, time-bounded claims on queue entries.
//!
//! Exclusivity lives in the store. A lease is won by the conditional
//! `pending -> processing` write, which takes the runner `online -> busy` in
//! the same step. Renew and release only match while the caller is still the
//! recorded holder.

use chrono::{DateTime, Duration, Utc};
use runway_core::{EntryId, Error, QueueEntry, QueueStatus, Result, RunnerId};
use runway_db::{Claim, SchedulerStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::queue::DispatchQueue;

/// Leases handled per sweep.
const SWEEP_LIMIT: i64 = 256;

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn SchedulerStore>,
    queue: DispatchQueue,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn SchedulerStore>, queue: DispatchQueue, ttl: Duration) -> Self {
        Self { store, queue, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `pending -> processing` for `runner_id` until `now + ttl`, marking the
    /// runner busy. Fails with [`Error::AlreadyLeased`] if another caller won
    /// the entry first and [`Error::RunnerUnavailable`] if the runner is not
    /// online.
    pub async fn lease(
        &self,
        entry_id: EntryId,
        runner_id: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let expires_at = now + self.ttl;
        match self.store.claim_entry(entry_id, runner_id, expires_at).await? {
            Claim::Leased(entry) => {
                info!(
                    entry_id = %entry_id,
                    job_id = %entry.job_id,
                    runner_id = %runner_id,
                    expires_at = %expires_at,
                    "Leased entry"
                );
                Ok(entry)
            }
            Claim::EntryTaken => {
                debug!(entry_id = %entry_id, runner_id = %runner_id, "Lost lease race");
                Err(Error::AlreadyLeased(format!("entry {}", entry_id)))
            }
            Claim::RunnerUnavailable => {
                debug!(entry_id = %entry_id, runner_id = %runner_id, "Runner not online");
                Err(Error::RunnerUnavailable(format!("runner {}", runner_id)))
            }
        }
    }

    /// Extend the lease to `now + ttl`. Fails with [`Error::LeaseLost`] once
    /// the caller is no longer the holder.
    pub async fn renew(
        &self,
        entry_id: EntryId,
        runner_id: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        self.store
            .renew_entry(entry_id, runner_id, now + self.ttl)
            .await?
            .ok_or_else(|| {
                warn!(entry_id = %entry_id, runner_id = %runner_id, "Renew by non-holder");
                Error::LeaseLost(format!("runner {} no longer holds entry {}", runner_id, entry_id))
            })
    }

    /// Finalize a held entry as `completed` or `failed`.
    pub async fn release(
        &self,
        entry_id: EntryId,
        runner_id: RunnerId,
        outcome: QueueStatus,
    ) -> Result<QueueEntry> {
        let entry = match outcome {
            QueueStatus::Completed => self.queue.mark_completed(entry_id, runner_id).await?,
            QueueStatus::Failed => self.queue.mark_failed(entry_id, runner_id).await?,
            other => {
                return Err(Error::InvalidInput(format!(
                    "cannot release a lease as {}",
                    other
                )));
            }
        };
        info!(entry_id = %entry_id, runner_id = %runner_id, outcome = %outcome, "Released lease");
        Ok(entry)
    }

    /// Entries whose lease expired at or before `now` without renewal.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let expired = self.store.expired_entries(now, SWEEP_LIMIT).await?;
        for entry in &expired {
            warn!(
                entry_id = %entry.id,
                job_id = %entry.job_id,
                runner_id = ?entry.lease_holder,
                expired_at = ?entry.lease_expires_at,
                "Lease expired"
            );
        }
        Ok(expired)
    }

    /// Put a held entry back to `pending`, hidden until `available_at`, and
    /// record `attempt` as the job's retry count in the same write. With
    /// `expired_by`, only an entry whose lease expired by then is requeued, so
    /// a lease renewed since the sweep survives. `None` when the entry
    /// changed underneath us.
    pub async fn requeue(
        &self,
        entry: &QueueEntry,
        expired_by: Option<DateTime<Utc>>,
        available_at: DateTime<Utc>,
        attempt: i32,
    ) -> Result<Option<QueueEntry>> {
        let Some(holder) = entry.lease_holder else {
            return Ok(None);
        };
        Ok(self
            .store
            .requeue_entry(entry.id, holder, expired_by, available_at, attempt)
            .await?)
    }

    /// Take a lease away from its holder (`processing -> failed`).
    pub async fn revoke(&self, entry_id: EntryId) -> Result<Option<QueueEntry>> {
        let revoked = self
            .queue
            .retire(entry_id, QueueStatus::Processing, QueueStatus::Failed)
            .await?;
        if let Some(entry) = &revoked {
            info!(entry_id = %entry_id, runner_id = ?entry.lease_holder, "Revoked lease");
        }
        Ok(revoked)
    }
}
