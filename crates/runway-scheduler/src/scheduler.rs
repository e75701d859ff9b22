//! The scheduler: the operations runners and operators call, and the tick
//! that reaps expired leases, enforces invariants and dispatches work.
//!
//! Nothing here holds in-process locks. Every decision is re-validated by a
//! conditional write in the store, so several schedulers can share one
//! database.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use runway_config::SchedulerConfig;
use runway_core::dispatch::{Assignment, RunnerDispatcher};
use runway_core::tree::RunRequest;
use runway_core::{
    Conclusion, EntryId, Error, FailureReason, Job, JobId, QueueEntry, QueueStatus, RepositoryId,
    Result, RunId, Runner, RunnerHeartbeat, RunnerId, RunnerStatus, Status, Step, StepId,
    Workflow, WorkflowId, WorkflowRun,
};
use runway_db::{DbError, SchedulerStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::chrono_duration;
use crate::lease::LeaseManager;
use crate::queue::DispatchQueue;
use crate::registry::RunnerRegistry;
use crate::rollup::{Revocation, RollupEngine, fresh_steps, terminal_status};

/// Peek/lease rounds before a runner gives up on one dispatch pass.
const MAX_LEASE_ATTEMPTS: usize = 3;

/// Jobs of cancelled runs picked up per tick.
const CANCEL_SWEEP_LIMIT: i64 = 256;

/// The tick waits this many poll intervals after a failed tick.
const ERROR_BACKOFF_FACTOR: u32 = 5;

/// What one scheduler tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub runners_offline: usize,
    pub runners_reset: usize,
    pub quarantined: usize,
    pub leases_expired: usize,
    pub requeued: usize,
    pub retries_exhausted: usize,
    pub cancellations_resumed: usize,
    pub cancellations_reaped: usize,
    pub unmatched: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// A run with its jobs, their latest queue entries and current steps.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run: WorkflowRun,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: Job,
    pub entry: Option<QueueEntry>,
    pub steps: Vec<Step>,
}

/// What became of a lease that was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LostLease {
    Requeued,
    Exhausted,
    Cancelled,
    /// Someone else handled the entry first.
    Raced,
}

pub struct Scheduler {
    store: Arc<dyn SchedulerStore>,
    registry: RunnerRegistry,
    queue: DispatchQueue,
    leases: LeaseManager,
    rollups: RollupEngine,
    dispatcher: Arc<dyn RunnerDispatcher>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        dispatcher: Arc<dyn RunnerDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        let registry = RunnerRegistry::new(store.clone());
        let queue = DispatchQueue::new(store.clone());
        let leases = LeaseManager::new(
            store.clone(),
            queue.clone(),
            chrono_duration(config.lease_ttl),
        );
        let rollups = RollupEngine::new(store.clone(), queue.clone());
        Self {
            store,
            registry,
            queue,
            leases,
            rollups,
            dispatcher,
            config,
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn rollups(&self) -> &RollupEngine {
        &self.rollups
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // Workflows

    pub async fn register_workflow(
        &self,
        repository_id: RepositoryId,
        path: &str,
    ) -> Result<Workflow> {
        if path.trim().is_empty() {
            return Err(Error::InvalidInput("workflow path is empty".to_string()));
        }
        let workflow = Workflow {
            id: WorkflowId::new(),
            repository_id,
            path: path.to_string(),
            enabled: true,
            created_at: Utc::now(),
        };
        let workflow = self.store.upsert_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, path = %workflow.path, "Registered workflow");
        Ok(workflow)
    }

    pub async fn set_workflow_enabled(&self, id: WorkflowId, enabled: bool) -> Result<Workflow> {
        let workflow = self.store.set_workflow_enabled(id, enabled).await?;
        info!(workflow_id = %id, enabled, "Updated workflow");
        Ok(workflow)
    }

    /// Delete a workflow and everything recorded for it.
    pub async fn delete_workflow(&self, id: WorkflowId) -> Result<()> {
        self.store.delete_workflow(id).await?;
        info!(workflow_id = %id, "Deleted workflow");
        Ok(())
    }

    // Runs

    /// Persist a resolved job tree as a new run. Every job gets a `pending`
    /// queue entry; dependencies gate dispatch, not enqueueing.
    pub async fn submit_run(&self, request: &RunRequest) -> Result<WorkflowRun> {
        request.validate()?;
        let workflow = self.store.get_workflow(request.workflow_id).await?;
        if !workflow.enabled {
            return Err(Error::InvalidInput(format!(
                "workflow {} is disabled",
                workflow.id
            )));
        }
        if workflow.repository_id != request.repository_id {
            return Err(Error::InvalidInput(format!(
                "workflow {} does not belong to repository {}",
                workflow.id, request.repository_id
            )));
        }

        let now = Utc::now();
        let run = WorkflowRun {
            id: RunId::new(),
            workflow_id: workflow.id,
            repository_id: workflow.repository_id,
            number: 0,
            event: request.event.clone(),
            head_sha: request.head_sha.clone(),
            head_branch: request.head_branch.clone(),
            actor: request.actor.clone(),
            status: Status::Queued,
            conclusion: None,
            fail_fast: request.fail_fast,
            rerun_of: None,
            cancel_requested_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        };

        let ids: HashMap<&str, JobId> = request
            .jobs
            .iter()
            .map(|j| (j.name.as_str(), JobId::new()))
            .collect();
        let lookup = |name: &str| {
            ids.get(name)
                .copied()
                .ok_or_else(|| Error::InvalidInput(format!("unknown job '{}'", name)))
        };

        let mut jobs = Vec::with_capacity(request.jobs.len());
        let mut steps = Vec::new();
        let mut entries = Vec::with_capacity(request.jobs.len());
        for spec in &request.jobs {
            let job = Job {
                id: lookup(spec.name.as_str())?,
                run_id: run.id,
                name: spec.name.clone(),
                status: Status::Queued,
                conclusion: None,
                failure_reason: None,
                runner_id: None,
                required_labels: spec.labels.clone(),
                needs: spec
                    .needs
                    .iter()
                    .map(|dep| lookup(dep.as_str()))
                    .collect::<Result<_>>()?,
                priority: spec.priority,
                continue_on_error: spec.continue_on_error,
                retry_count: 0,
                max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
                rerun_of: None,
                cancel_requested_at: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                version: 0,
            };
            steps.extend(fresh_steps(
                job.id,
                0,
                spec.steps
                    .iter()
                    .map(|s| (s.name.as_str(), s.continue_on_error)),
            ));
            entries.push(QueueEntry::pending(&job, spec.payload.clone(), now));
            jobs.push(job);
        }

        let run = self.store.create_run(&run, &jobs, &steps, &entries).await?;
        info!(
            run_id = %run.id,
            number = run.number,
            workflow_id = %run.workflow_id,
            jobs = jobs.len(),
            "Submitted run"
        );
        Ok(run)
    }

    /// Put a job on the dispatch queue. Enqueueing a job that already has a
    /// live entry returns that entry.
    pub async fn enqueue(&self, job_id: JobId, priority: i32) -> Result<QueueEntry> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::Conflict(format!("job {} already finished", job_id)));
        }
        if let Some(entry) = self.live_entry(job_id).await? {
            return Ok(entry);
        }
        match self
            .queue
            .enqueue(&job, priority, serde_json::Value::Null, Utc::now())
            .await
        {
            Ok(entry) => Ok(entry),
            Err(Error::DuplicateEntry(_)) => self
                .live_entry(job_id)
                .await?
                .ok_or_else(|| Error::StaleState(format!("entry for job {} vanished", job_id))),
            Err(e) => Err(e),
        }
    }

    async fn live_entry(&self, job_id: JobId) -> Result<Option<QueueEntry>> {
        Ok(self
            .queue
            .entry_for_job(job_id)
            .await?
            .filter(|e| !e.status.is_terminal()))
    }

    /// Cancel a run and tell the runners holding its leases to stop.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<WorkflowRun> {
        let (run, revocations) = self.rollups.cancel_run(run_id, Utc::now()).await?;
        self.send_revocations(revocations).await;
        Ok(run)
    }

    /// Re-run a job that did not succeed, together with every job that
    /// transitively needs it, as a new run. Asking again for the same job
    /// returns the run created the first time.
    pub async fn retry_job(&self, job_id: JobId) -> Result<WorkflowRun> {
        let source = self.store.get_job(job_id).await?;
        if !source.status.is_terminal() {
            return Err(Error::Conflict(format!("job {} has not finished", job_id)));
        }
        if source.succeeded() {
            return Err(Error::Conflict(format!("job {} succeeded", job_id)));
        }
        if let Some(copy) = self.store.find_rerun_of(job_id).await? {
            return Ok(self.store.get_run(copy.run_id).await?);
        }

        let source_run = self.store.get_run(source.run_id).await?;
        let workflow = self.store.get_workflow(source_run.workflow_id).await?;
        if !workflow.enabled {
            return Err(Error::InvalidInput(format!(
                "workflow {} is disabled",
                workflow.id
            )));
        }

        let all = self.store.list_jobs(source_run.id).await?;
        let mut selected: BTreeSet<JobId> = BTreeSet::from([job_id]);
        loop {
            let before = selected.len();
            for job in &all {
                if job.needs.iter().any(|dep| selected.contains(dep)) {
                    selected.insert(job.id);
                }
            }
            if selected.len() == before {
                break;
            }
        }

        let now = Utc::now();
        let run = WorkflowRun {
            id: RunId::new(),
            number: 0,
            status: Status::Queued,
            conclusion: None,
            rerun_of: Some(source_run.id),
            cancel_requested_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
            ..source_run.clone()
        };

        let id_map: HashMap<JobId, JobId> =
            selected.iter().map(|id| (*id, JobId::new())).collect();
        let mut jobs = Vec::with_capacity(id_map.len());
        let mut steps = Vec::new();
        let mut entries = Vec::with_capacity(id_map.len());
        for old in all.iter().filter(|j| selected.contains(&j.id)) {
            let Some(&id) = id_map.get(&old.id) else {
                continue;
            };
            let job = Job {
                id,
                run_id: run.id,
                name: old.name.clone(),
                status: Status::Queued,
                conclusion: None,
                failure_reason: None,
                runner_id: None,
                required_labels: old.required_labels.clone(),
                needs: old
                    .needs
                    .iter()
                    .filter_map(|dep| id_map.get(dep).copied())
                    .collect(),
                priority: old.priority,
                continue_on_error: old.continue_on_error,
                retry_count: 0,
                max_retries: old.max_retries,
                rerun_of: Some(old.id),
                cancel_requested_at: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                version: 0,
            };
            let template = self.store.list_steps(old.id, old.attempt()).await?;
            steps.extend(fresh_steps(
                id,
                0,
                template
                    .iter()
                    .map(|s| (s.name.as_str(), s.continue_on_error)),
            ));
            let data = self
                .queue
                .entry_for_job(old.id)
                .await?
                .map(|e| e.data)
                .unwrap_or(serde_json::Value::Null);
            entries.push(QueueEntry::pending(&job, data, now));
            jobs.push(job);
        }

        match self.store.create_run(&run, &jobs, &steps, &entries).await {
            Ok(run) => {
                info!(
                    run_id = %run.id,
                    rerun_of = %source_run.id,
                    job_id = %job_id,
                    jobs = jobs.len(),
                    "Re-running job"
                );
                Ok(run)
            }
            Err(DbError::Duplicate(_)) => {
                let copy = self.store.find_rerun_of(job_id).await?.ok_or_else(|| {
                    Error::Conflict(format!("job {} is already being re-run", job_id))
                })?;
                Ok(self.store.get_run(copy.run_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn run_view(&self, run_id: RunId) -> Result<RunView> {
        let run = self.store.get_run(run_id).await?;
        let mut jobs = Vec::new();
        for job in self.store.list_jobs(run_id).await? {
            let entry = self.queue.entry_for_job(job.id).await?;
            let steps = self.store.list_steps(job.id, job.attempt()).await?;
            jobs.push(JobView { job, entry, steps });
        }
        Ok(RunView { run, jobs })
    }

    pub async fn list_runs(
        &self,
        repository_id: RepositoryId,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>> {
        Ok(self.store.list_runs(repository_id, limit).await?)
    }

    /// Live queue entries in dispatch order.
    pub async fn queue_snapshot(&self) -> Result<Vec<QueueEntry>> {
        self.queue.snapshot().await
    }

    // Runner-facing operations

    pub async fn heartbeat(&self, heartbeat: &RunnerHeartbeat) -> Result<Runner> {
        self.registry.heartbeat(heartbeat).await
    }

    /// Lease the best ready entry to `runner_id`. `None` when the runner is
    /// not online or nothing it can run is ready.
    pub async fn lease_next(
        &self,
        runner_id: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let runner = self.registry.get(runner_id).await?;
        if runner.status != RunnerStatus::Online {
            return Ok(None);
        }

        for _ in 0..MAX_LEASE_ATTEMPTS {
            let Some(entry) = self.queue.peek_ready(&runner.labels, now).await? else {
                return Ok(None);
            };
            let leased = match self.leases.lease(entry.id, runner_id, now).await {
                Ok(leased) => leased,
                Err(Error::RunnerUnavailable(_)) => return Ok(None),
                Err(e) if e.is_contention() => continue,
                Err(e) => return Err(e),
            };
            if let Some(assignment) = self.bind(runner_id, leased, now).await? {
                return Ok(Some(assignment));
            }
        }
        Ok(None)
    }

    /// Record the lease holder on the job and build the assignment. A job
    /// finished or cancelled while we were claiming it, or whose run was
    /// cancelled, gets its lease back.
    async fn bind(
        &self,
        runner_id: RunnerId,
        entry: QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let job = self
            .rollups
            .modify_job(entry.job_id, move |j| {
                if j.status.is_terminal() || j.cancel_requested_at.is_some() {
                    return None;
                }
                let mut next = j.clone();
                next.runner_id = Some(runner_id);
                Some(next)
            })
            .await?;
        let cancelled = job.cancel_requested_at.is_some()
            || (!job.status.is_terminal()
                && self.store.get_run(job.run_id).await?.cancel_requested_at.is_some());
        if job.status.is_terminal() || cancelled {
            warn!(entry_id = %entry.id, job_id = %job.id, "Leased a finished or cancelled job; revoking");
            self.leases.revoke(entry.id).await?;
            if !job.status.is_terminal() {
                // Never dispatched, so there is no runner to wait for.
                let job = self.rollups.finalize_cancelled(job.id, now).await?;
                self.job_terminal(&job, now).await?;
            }
            self.registry.release(runner_id).await?;
            return Ok(None);
        }

        let steps = self.rollups.open_attempt(job.id, job.attempt(), now).await?;
        let lease_expires_at = entry
            .lease_expires_at
            .unwrap_or(now + self.leases.ttl());
        Ok(Some(Assignment {
            entry,
            job,
            steps,
            lease_expires_at,
        }))
    }

    pub async fn renew(&self, entry_id: EntryId, runner_id: RunnerId) -> Result<QueueEntry> {
        self.leases.renew(entry_id, runner_id, Utc::now()).await
    }

    /// Check that `runner_id` may report on `job`. A runner whose lease was
    /// revoked by a cancellation may still report until the job is final.
    async fn authorize(&self, runner_id: RunnerId, job: &Job) -> Result<QueueEntry> {
        let not_holder =
            || Error::NotLeaseHolder(format!("runner {} does not hold job {}", runner_id, job.id));
        let entry = self
            .queue
            .entry_for_job(job.id)
            .await?
            .ok_or_else(not_holder)?;
        if let Some(reason) = &entry.quarantine_reason {
            return Err(Error::InvariantViolation(format!(
                "entry {} is quarantined: {}",
                entry.id, reason
            )));
        }
        if entry.is_held_by(runner_id) {
            return Ok(entry);
        }
        if job.cancel_requested_at.is_some() && entry.lease_holder == Some(runner_id) {
            return Ok(entry);
        }
        Err(not_holder())
    }

    pub async fn start_step(
        &self,
        runner_id: RunnerId,
        step_id: StepId,
        log_ref: Option<String>,
    ) -> Result<Step> {
        let now = Utc::now();
        let step = self.store.get_step(step_id).await?;
        let job = self.store.get_job(step.job_id).await?;
        self.authorize(runner_id, &job).await?;
        if job.cancel_requested_at.is_some() {
            return Err(Error::LeaseLost(format!("job {} is being cancelled", job.id)));
        }
        check_attempt(&step, &job)?;

        let step = self
            .rollups
            .modify_step(step_id, move |s| {
                if s.status != Status::Queued {
                    return None;
                }
                let mut next = s.clone();
                next.status = Status::InProgress;
                next.started_at = Some(now);
                next.log_ref = log_ref.clone();
                Some(next)
            })
            .await?;
        if step.status.is_terminal() {
            return Err(Error::IllegalTransition(format!(
                "step {} already finished",
                step_id
            )));
        }

        self.rollups.roll_up_job(job.id, now).await?;
        self.rollups.roll_up_run(job.run_id, now).await?;
        debug!(step_id = %step_id, job_id = %job.id, "Step started");
        Ok(step)
    }

    /// Record a step's conclusion. Reporting the same conclusion twice is a
    /// no-op.
    pub async fn complete_step(
        &self,
        runner_id: RunnerId,
        step_id: StepId,
        conclusion: Conclusion,
    ) -> Result<Step> {
        let now = Utc::now();
        let step = self.store.get_step(step_id).await?;
        let job = self.store.get_job(step.job_id).await?;
        let entry = self.authorize(runner_id, &job).await?;
        check_attempt(&step, &job)?;

        let status = terminal_status(conclusion);
        let step = self
            .rollups
            .modify_step(step_id, move |s| {
                if s.status.is_terminal() {
                    return None;
                }
                let mut next = s.clone();
                next.status = status;
                next.conclusion = Some(conclusion);
                next.started_at.get_or_insert(now);
                next.completed_at = Some(now);
                Some(next)
            })
            .await?;
        if step.conclusion != Some(conclusion) {
            return Err(Error::IllegalTransition(format!(
                "step {} already concluded {}",
                step_id,
                step.conclusion.map_or("nothing", |c| c.as_str())
            )));
        }
        debug!(step_id = %step_id, job_id = %job.id, conclusion = %conclusion, "Step completed");

        if job.cancel_requested_at.is_some() {
            let job = self.rollups.finalize_cancelled(job.id, now).await?;
            self.finish_job(runner_id, &entry, &job, now).await?;
            return Ok(step);
        }

        let job = self.rollups.roll_up_job(job.id, now).await?;
        if job.status.is_terminal() {
            self.finish_job(runner_id, &entry, &job, now).await?;
        } else {
            self.rollups.roll_up_run(job.run_id, now).await?;
        }
        Ok(step)
    }

    /// Conclude a whole job as its runner reports it. Unstarted steps are
    /// skipped and running steps take the reported conclusion.
    pub async fn complete_job(
        &self,
        runner_id: RunnerId,
        job_id: JobId,
        conclusion: Conclusion,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            if job.conclusion == Some(conclusion) {
                return Ok(job);
            }
            return Err(Error::IllegalTransition(format!(
                "job {} already concluded {}",
                job_id,
                job.conclusion.map_or("nothing", |c| c.as_str())
            )));
        }
        let entry = self.authorize(runner_id, &job).await?;

        let job = if job.cancel_requested_at.is_some() {
            self.rollups.finalize_cancelled(job_id, now).await?
        } else {
            self.rollups.conclude_job(job_id, conclusion, now).await?
        };
        self.finish_job(runner_id, &entry, &job, now).await?;
        Ok(job)
    }

    /// Release the lease and runner of a finished job and propagate.
    async fn finish_job(
        &self,
        runner_id: RunnerId,
        entry: &QueueEntry,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = if job.succeeded() {
            QueueStatus::Completed
        } else {
            QueueStatus::Failed
        };
        match self.leases.release(entry.id, runner_id, outcome).await {
            Ok(_) => {}
            Err(Error::NotLeaseHolder(_)) => {
                debug!(entry_id = %entry.id, "Lease already revoked");
            }
            Err(e) => return Err(e),
        }
        self.registry.release(runner_id).await?;
        self.job_terminal(job, now).await
    }

    /// Propagate a terminal job and deliver any revocations that causes.
    async fn job_terminal(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let revocations = self.rollups.job_finished(job, now).await?;
        self.send_revocations(revocations).await;
        Ok(())
    }

    async fn send_revocations(&self, revocations: Vec<Revocation>) {
        let sends = revocations.into_iter().map(|r| async move {
            let sent = timeout(
                self.config.dispatch_timeout,
                self.dispatcher.revoke(r.runner_id, r.entry_id),
            )
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(runner_id = %r.runner_id, entry_id = %r.entry_id, error = %e, "Failed to deliver revocation");
                }
                Err(_) => {
                    warn!(runner_id = %r.runner_id, entry_id = %r.entry_id, "Revocation timed out");
                }
            }
        });
        join_all(sends).await;
    }

    // The loop

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// One pass: liveness, invariants, expired leases, unfinished run
    /// cancellations, cancellation grace, unmatched work, then dispatch.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        report.runners_offline = self
            .registry
            .mark_stale_offline(now, chrono_duration(self.config.runner_heartbeat_timeout))
            .await?
            .len();

        self.check_invariants(now, &mut report).await?;

        for entry in self.leases.sweep(now).await? {
            report.leases_expired += 1;
            match self.handle_lost_lease(&entry, Some(now), now).await {
                Ok(LostLease::Requeued) => report.requeued += 1,
                Ok(LostLease::Exhausted) => report.retries_exhausted += 1,
                Ok(LostLease::Cancelled | LostLease::Raced) => {}
                Err(e) => warn!(entry_id = %entry.id, error = %e, "Failed to handle expired lease"),
            }
        }

        report.cancellations_resumed = self.resume_run_cancellations(now).await?;
        report.cancellations_reaped = self.reap_cancellations(now).await?;
        report.unmatched = self.fail_unmatched(now).await?;

        for runner in self
            .registry
            .idle()
            .await?
            .into_iter()
            .take(self.config.dispatch_batch)
        {
            match self.lease_next(runner.id, now).await {
                Ok(Some(assignment)) => {
                    if self.deliver(&runner, assignment, now).await? {
                        report.dispatched += 1;
                    } else {
                        report.dispatch_failures += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(runner_id = %runner.id, error = %e, "Failed to lease work"),
            }
        }

        Ok(report)
    }

    /// Hand an assignment to the dispatcher. A failed or slow delivery is
    /// treated like a lost lease.
    async fn deliver(
        &self,
        runner: &Runner,
        assignment: Assignment,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let delivered = timeout(
            self.config.dispatch_timeout,
            self.dispatcher.dispatch(runner, &assignment),
        )
        .await;
        let failure = match delivered {
            Ok(Ok(())) => {
                info!(
                    runner_id = %runner.id,
                    job_id = %assignment.job.id,
                    dispatcher = self.dispatcher.name(),
                    "Dispatched job"
                );
                return Ok(true);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {:?}", self.config.dispatch_timeout),
        };
        warn!(
            runner_id = %runner.id,
            job_id = %assignment.job.id,
            dispatcher = self.dispatcher.name(),
            error = %failure,
            "Dispatch failed"
        );
        self.handle_lost_lease(&assignment.entry, None, now).await?;
        Ok(false)
    }

    /// Deal with a lease whose holder went away: requeue the job with
    /// backoff while it has retries left, otherwise fail it. The holder is
    /// marked offline either way.
    async fn handle_lost_lease(
        &self,
        entry: &QueueEntry,
        expired_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<LostLease> {
        let Some(runner_id) = entry.lease_holder else {
            return Ok(LostLease::Raced);
        };
        let job = self.store.get_job(entry.job_id).await?;

        if job.status.is_terminal() || job.cancel_requested_at.is_some() {
            if self.leases.revoke(entry.id).await?.is_none() {
                return Ok(LostLease::Raced);
            }
            self.registry.mark_offline(runner_id).await?;
            if !job.status.is_terminal() {
                let job = self.rollups.finalize_cancelled(job.id, now).await?;
                self.job_terminal(&job, now).await?;
            }
            return Ok(LostLease::Cancelled);
        }

        let attempt = job.retry_count + 1;
        if attempt > job.max_retries {
            if self.leases.revoke(entry.id).await?.is_none() {
                return Ok(LostLease::Raced);
            }
            self.registry.mark_offline(runner_id).await?;
            warn!(job_id = %job.id, attempts = attempt, "Retries exhausted");
            let job = self
                .rollups
                .fail_job(job.id, FailureReason::RetriesExhausted, now)
                .await?;
            self.job_terminal(&job, now).await?;
            return Ok(LostLease::Exhausted);
        }

        let available_at = now + chrono_duration(self.config.retry_backoff) * attempt;
        if self
            .leases
            .requeue(entry, expired_by, available_at, attempt)
            .await?
            .is_none()
        {
            return Ok(LostLease::Raced);
        }
        self.registry.mark_offline(runner_id).await?;
        self.rollups.open_attempt(job.id, attempt, now).await?;
        info!(
            job_id = %job.id,
            attempt,
            available_at = %available_at,
            "Requeued job after lost lease"
        );
        Ok(LostLease::Requeued)
    }

    /// Cancel the jobs of cancelled runs that were left running or queued,
    /// as happens when a cancel stops between the run and its jobs.
    async fn resume_run_cancellations(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut resumed = 0;
        for job in self.store.jobs_of_cancelled_runs(CANCEL_SWEEP_LIMIT).await? {
            let revocation = self.rollups.cancel_job(job.id, now).await?;
            info!(run_id = %job.run_id, job_id = %job.id, "Resumed run cancellation");
            self.send_revocations(revocation.into_iter().collect()).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Finish cancellations whose runner never reported back in time.
    async fn reap_cancellations(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono_duration(self.config.cancel_grace);
        let mut reaped = 0;
        for job in self.store.cancelling_jobs(cutoff).await? {
            let finished = self.rollups.finalize_cancelled(job.id, now).await?;
            if let Some(runner_id) = job.runner_id {
                self.registry.release(runner_id).await?;
            }
            info!(job_id = %job.id, "Cancellation grace period elapsed");
            self.job_terminal(&finished, now).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Fail pending jobs that have waited too long for labels no known
    /// runner offers.
    async fn fail_unmatched(&self, now: DateTime<Utc>) -> Result<usize> {
        let wait = chrono_duration(self.config.no_runner_timeout);
        let mut failed = 0;
        for entry in self.queue.snapshot().await? {
            if entry.status != QueueStatus::Pending
                || entry.is_quarantined()
                || entry.created_at + wait > now
            {
                continue;
            }
            let job = self.store.get_job(entry.job_id).await?;
            if self.registry.has_candidate(&job.required_labels).await? {
                continue;
            }
            let retired = self
                .queue
                .retire(entry.id, QueueStatus::Pending, QueueStatus::Failed)
                .await?;
            if retired.is_none() {
                continue;
            }
            warn!(job_id = %job.id, labels = ?job.required_labels, "No runner offers the required labels");
            let job = self
                .rollups
                .fail_job(job.id, FailureReason::NoMatchingRunner, now)
                .await?;
            self.job_terminal(&job, now).await?;
            failed += 1;
        }
        Ok(failed)
    }

    /// Quarantine entries that break lease exclusivity and return busy
    /// runners holding nothing to online. The store only releases a runner
    /// with no lease and no unfinished revoked job, in the same step as the
    /// check, so a claim landing meanwhile keeps its runner busy.
    async fn check_invariants(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let live = self.queue.snapshot().await?;

        let mut by_job: HashMap<JobId, Vec<&QueueEntry>> = HashMap::new();
        let mut by_holder: HashMap<RunnerId, Vec<&QueueEntry>> = HashMap::new();
        for entry in live.iter().filter(|e| e.status == QueueStatus::Processing) {
            by_job.entry(entry.job_id).or_default().push(entry);
            if let Some(holder) = entry.lease_holder.filter(|_| entry.has_live_lease(now)) {
                by_holder.entry(holder).or_default().push(entry);
            }
        }

        let violations = by_job
            .iter()
            .filter(|(_, entries)| entries.len() > 1)
            .map(|(job_id, entries)| (format!("job {} has several processing entries", job_id), entries))
            .chain(
                by_holder
                    .iter()
                    .filter(|(_, entries)| entries.len() > 1)
                    .map(|(runner_id, entries)| {
                        (format!("runner {} holds several live leases", runner_id), entries)
                    }),
            );
        for (reason, entries) in violations {
            let fresh: Vec<EntryId> = entries
                .iter()
                .filter(|e| !e.is_quarantined())
                .map(|e| e.id)
                .collect();
            if fresh.is_empty() {
                continue;
            }
            error!(entries = ?fresh, "Invariant violation: {}", reason);
            for id in fresh {
                self.queue.quarantine(id, &reason).await?;
                report.quarantined += 1;
            }
        }

        for runner in self.registry.list().await? {
            if runner.status != RunnerStatus::Busy {
                continue;
            }
            if self.registry.release(runner.id).await? {
                warn!(runner_id = %runner.id, "Busy runner held no lease; returned to online");
                report.runners_reset += 1;
            }
        }
        Ok(())
    }

    /// Tick every poll interval until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval = ?self.config.poll_interval,
            dispatcher = self.dispatcher.name(),
            "Starting scheduler"
        );
        tokio::pin!(shutdown);

        loop {
            let delay = match self.tick().await {
                Ok(report) => {
                    if report.is_idle() {
                        debug!("Scheduler tick idle");
                    } else {
                        info!(?report, "Scheduler tick");
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    warn!(error = %e, "Scheduler tick failed");
                    self.config.poll_interval * ERROR_BACKOFF_FACTOR
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(delay) => {}
            }
        }
        info!(worker_id = %self.config.worker_id, "Scheduler stopped");
    }
}

fn check_attempt(step: &Step, job: &Job) -> Result<()> {
    if step.attempt != job.attempt() {
        return Err(Error::Conflict(format!(
            "step {} belongs to attempt {} but job {} is on attempt {}",
            step.id,
            step.attempt,
            job.id,
            job.attempt()
        )));
    }
    Ok(())
}
