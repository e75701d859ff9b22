//! The scheduler's storage contract.
//!
//! Run, job and step writes carry the row the caller read: the status it
//! observed is checked against the transition table and its `version` must
//! still be current, otherwise the write fails with [`DbError::Stale`]. Queue
//! writes are conditional updates that return the affected entry, or `None`
//! when the condition did not hold (someone else won the race).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runway_core::status::{EntityKind, check_transition};
use runway_core::{
    EntryId, Job, JobId, QueueEntry, QueueStatus, RepositoryId, RunId, Runner, RunnerHeartbeat,
    RunnerId, RunnerStatus, Status, Step, StepId, Workflow, WorkflowId, WorkflowRun,
};
use std::collections::BTreeSet;

use crate::DbResult;

/// Outcome of [`SchedulerStore::claim_entry`].
#[derive(Debug, Clone)]
pub enum Claim {
    /// The entry is now `processing` and the runner `busy`.
    Leased(QueueEntry),
    /// The entry was no longer claimable.
    EntryTaken,
    /// The runner was not `online`.
    RunnerUnavailable,
}

/// Validate a status write against the shared transition table.
pub fn guard_transition(entity: EntityKind, expected: Status, next: Status) -> DbResult<()> {
    check_transition(entity, expected, next)?;
    Ok(())
}

#[async_trait]
pub trait SchedulerStore: Send + Sync {
    // Workflows

    /// Insert a workflow, or return the existing one for the same
    /// repository and path.
    async fn upsert_workflow(&self, workflow: &Workflow) -> DbResult<Workflow>;
    async fn get_workflow(&self, id: WorkflowId) -> DbResult<Workflow>;
    async fn set_workflow_enabled(&self, id: WorkflowId, enabled: bool) -> DbResult<Workflow>;
    async fn delete_workflow(&self, id: WorkflowId) -> DbResult<()>;

    // Runs

    /// Atomically insert a run with its jobs, steps and queue entries.
    /// The store assigns the per-repository run number.
    async fn create_run(
        &self,
        run: &WorkflowRun,
        jobs: &[Job],
        steps: &[Step],
        entries: &[QueueEntry],
    ) -> DbResult<WorkflowRun>;
    async fn get_run(&self, id: RunId) -> DbResult<WorkflowRun>;
    async fn list_runs(
        &self,
        repository_id: RepositoryId,
        limit: i64,
    ) -> DbResult<Vec<WorkflowRun>>;
    /// Write `run` if the stored row still has status `expected` and the
    /// same version; the stored version is bumped.
    async fn update_run(&self, run: &WorkflowRun, expected: Status) -> DbResult<WorkflowRun>;

    // Jobs

    async fn get_job(&self, id: JobId) -> DbResult<Job>;
    async fn list_jobs(&self, run_id: RunId) -> DbResult<Vec<Job>>;
    async fn update_job(&self, job: &Job, expected: Status) -> DbResult<Job>;
    /// The job created by an explicit re-run of `job_id`, if any.
    async fn find_rerun_of(&self, job_id: JobId) -> DbResult<Option<Job>>;
    /// Non-terminal jobs whose cancellation was requested at or before
    /// `requested_before`.
    async fn cancelling_jobs(&self, requested_before: DateTime<Utc>) -> DbResult<Vec<Job>>;
    /// Non-terminal jobs not yet marked cancelling whose run was cancelled.
    async fn jobs_of_cancelled_runs(&self, limit: i64) -> DbResult<Vec<Job>>;

    // Steps

    async fn get_step(&self, id: StepId) -> DbResult<Step>;
    /// Steps of one job attempt, ordered by number.
    async fn list_steps(&self, job_id: JobId, attempt: i32) -> DbResult<Vec<Step>>;
    async fn insert_steps(&self, steps: &[Step]) -> DbResult<()>;
    async fn update_step(&self, step: &Step, expected: Status) -> DbResult<Step>;

    // Dispatch queue

    /// Insert a `pending` entry. Fails with [`DbError::Duplicate`] when the
    /// job already has a non-terminal entry.
    async fn enqueue(&self, entry: &QueueEntry) -> DbResult<QueueEntry>;
    async fn get_entry(&self, id: EntryId) -> DbResult<QueueEntry>;
    /// The most recent entry for a job.
    async fn entry_for_job(&self, job_id: JobId) -> DbResult<Option<QueueEntry>>;
    /// Highest-priority visible `pending` entry whose job's labels are a
    /// subset of `labels`, whose dependencies all succeeded and whose run has
    /// not been cancelled.
    async fn peek_ready(
        &self,
        labels: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<QueueEntry>>;
    /// `pending -> processing` for `runner_id` until `expires_at`, and the
    /// runner `online -> busy`, as one write. Neither happens unless both
    /// conditions hold.
    async fn claim_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Claim>;
    /// Extend a lease still held by `runner_id`.
    async fn renew_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Option<QueueEntry>>;
    /// `processing -> outcome` when `runner_id` holds the lease.
    async fn finish_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        outcome: QueueStatus,
    ) -> DbResult<Option<QueueEntry>>;
    /// `processing -> pending` for a lease held by `runner_id`, hidden from
    /// dispatch until `available_at`. With `expired_by`, only a lease that
    /// expired at or before that instant is requeued. In the same write the
    /// job's `retry_count` is raised to `attempt` and its runner cleared.
    async fn requeue_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expired_by: Option<DateTime<Utc>>,
        available_at: DateTime<Utc>,
        attempt: i32,
    ) -> DbResult<Option<QueueEntry>>;
    /// `from -> outcome` regardless of holder. The lease expiry is cleared
    /// but `lease_holder` is kept, so a revoked holder can still be
    /// recognised when it reports back. Used by cancellation, skipping and
    /// exhausted retries.
    async fn retire_entry(
        &self,
        id: EntryId,
        from: QueueStatus,
        outcome: QueueStatus,
    ) -> DbResult<Option<QueueEntry>>;
    /// Processing entries whose lease expired at or before `now`.
    async fn expired_entries(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<QueueEntry>>;
    /// All `pending` and `processing` entries, quarantined ones included.
    async fn live_entries(&self) -> DbResult<Vec<QueueEntry>>;
    async fn quarantine_entry(&self, id: EntryId, reason: &str) -> DbResult<()>;

    // Runners

    /// Insert or refresh a runner from a heartbeat. A `busy` runner stays
    /// busy; its lease decides when it is released.
    async fn record_heartbeat(&self, heartbeat: &RunnerHeartbeat) -> DbResult<Runner>;
    async fn get_runner(&self, id: RunnerId) -> DbResult<Runner>;
    async fn list_runners(&self) -> DbResult<Vec<Runner>>;
    /// `expected -> next`; `None` when the runner was not in `expected`.
    async fn set_runner_status(
        &self,
        id: RunnerId,
        expected: RunnerStatus,
        next: RunnerStatus,
    ) -> DbResult<Option<Runner>>;
    /// `busy -> online` unless the runner still holds a `processing` entry,
    /// or a revoked entry whose job has not finished. `None` when the runner
    /// was left as it was.
    async fn release_runner(&self, id: RunnerId) -> DbResult<Option<Runner>>;
}
