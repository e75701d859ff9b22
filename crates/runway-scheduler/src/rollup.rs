//! Rollup engine.
//!
//! Derives job state from the current attempt's steps and run state from
//! jobs, and pushes terminal outcomes back down: dependents of a job that did
//! not succeed are skipped, fail-fast and run cancellation cancel the
//! remaining jobs. Every write carries the status it was computed from and
//! is recomputed from fresh state when the store reports it stale.

use chrono::{DateTime, Utc};
use runway_core::status::{Rollup, rollup};
use runway_core::{
    Conclusion, EntryId, Error, FailureReason, Job, JobId, QueueStatus, Result, RunId, RunnerId,
    Status, Step, StepId, WorkflowRun,
};
use runway_db::{DbError, DbResult, SchedulerStore};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::queue::DispatchQueue;

/// Read-modify-write attempts before a stale write is surfaced.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Run a read-modify-write until it stops losing to concurrent writers.
pub(crate) async fn retry_stale<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut last = String::new();
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        match op().await {
            Err(DbError::Stale(msg)) => {
                debug!(what, attempt, reason = %msg, "Stale write, retrying");
                last = msg;
            }
            other => return other.map_err(Into::into),
        }
    }
    Err(Error::StaleState(format!("{}: {}", what, last)))
}

/// A lease taken away from a runner that should be told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub runner_id: RunnerId,
    pub entry_id: EntryId,
}

/// How the unfinished steps of an attempt are closed.
#[derive(Debug, Clone, Copy)]
enum Closing {
    Cancelled,
    Skipped,
    /// Running steps fail, unstarted ones are skipped.
    Failed,
    /// Running steps take the reported conclusion, unstarted ones are skipped.
    Reported(Conclusion),
}

impl Closing {
    fn conclusion_for(self, step: &Step) -> Conclusion {
        let started = step.status == Status::InProgress;
        match self {
            Closing::Cancelled => Conclusion::Cancelled,
            Closing::Skipped => Conclusion::Skipped,
            Closing::Failed if started => Conclusion::Failure,
            Closing::Reported(conclusion) if started => conclusion,
            Closing::Failed | Closing::Reported(_) => Conclusion::Skipped,
        }
    }
}

/// The terminal status that goes with a conclusion.
pub fn terminal_status(conclusion: Conclusion) -> Status {
    match conclusion {
        Conclusion::Cancelled => Status::Cancelled,
        _ => Status::Completed,
    }
}

/// Queued steps for a new job attempt, numbered from 1.
pub(crate) fn fresh_steps<'a, I>(job_id: JobId, attempt: i32, defs: I) -> Vec<Step>
where
    I: IntoIterator<Item = (&'a str, bool)>,
{
    defs.into_iter()
        .zip(1..)
        .map(|((name, continue_on_error), number)| Step {
            id: StepId::new(),
            job_id,
            attempt,
            number,
            name: name.to_string(),
            status: Status::Queued,
            conclusion: None,
            log_ref: None,
            continue_on_error,
            started_at: None,
            completed_at: None,
            version: 0,
        })
        .collect()
}

/// Apply a derived state to a job. `None` when nothing would change, which
/// includes every attempt to move a job backwards or out of a terminal status.
pub fn advance_job(job: &Job, derived: Rollup, now: DateTime<Utc>) -> Option<Job> {
    if job.status.is_terminal() {
        return None;
    }
    let mut next = job.clone();
    match derived.status {
        Status::Queued => return None,
        Status::InProgress => {
            if job.status != Status::Queued {
                return None;
            }
            next.status = Status::InProgress;
            next.started_at = Some(now);
        }
        Status::Completed | Status::Cancelled => {
            let conclusion = if job.cancel_requested_at.is_some() {
                Conclusion::Cancelled
            } else {
                derived.conclusion.unwrap_or(Conclusion::Success)
            };
            next.status = terminal_status(conclusion);
            next.conclusion = Some(conclusion);
            next.started_at.get_or_insert(now);
            next.completed_at = Some(now);
        }
    }
    Some(next)
}

/// Apply a derived state to a run, with the same monotonic rules as jobs.
pub fn advance_run(run: &WorkflowRun, derived: Rollup, now: DateTime<Utc>) -> Option<WorkflowRun> {
    if run.status.is_terminal() {
        return None;
    }
    let mut next = run.clone();
    match derived.status {
        Status::Queued => return None,
        Status::InProgress => {
            if run.status != Status::Queued {
                return None;
            }
            next.status = Status::InProgress;
            next.started_at = Some(now);
        }
        Status::Completed | Status::Cancelled => {
            let conclusion = derived.conclusion.unwrap_or(Conclusion::Success);
            next.status = terminal_status(conclusion);
            next.conclusion = Some(conclusion);
            next.started_at.get_or_insert(now);
            next.completed_at = Some(now);
        }
    }
    Some(next)
}

#[derive(Clone)]
pub struct RollupEngine {
    store: Arc<dyn SchedulerStore>,
    queue: DispatchQueue,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn SchedulerStore>, queue: DispatchQueue) -> Self {
        Self { store, queue }
    }

    /// Recompute a job from its current attempt's steps.
    pub async fn roll_up_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
        retry_stale("job rollup", move || async move {
            let job = self.store.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let steps = self.store.list_steps(job_id, job.attempt()).await?;
            let derived = rollup(steps.iter().map(Step::child_state));
            match advance_job(&job, derived, now) {
                Some(next) => self.store.update_job(&next, job.status).await.inspect(|job| {
                    if let Some(conclusion) = job.conclusion {
                        info!(job_id = %job.id, status = %job.status, conclusion = %conclusion, "Job concluded");
                    }
                }),
                None => Ok(job),
            }
        })
        .await
    }

    /// Recompute a run from its jobs.
    pub async fn roll_up_run(&self, run_id: RunId, now: DateTime<Utc>) -> Result<WorkflowRun> {
        retry_stale("run rollup", move || async move {
            let run = self.store.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            let jobs = self.store.list_jobs(run_id).await?;
            let derived = rollup(jobs.iter().map(Job::child_state));
            match advance_run(&run, derived, now) {
                Some(next) => self.store.update_run(&next, run.status).await.inspect(|run| {
                    if let Some(conclusion) = run.conclusion {
                        info!(run_id = %run.id, number = run.number, conclusion = %conclusion, "Run concluded");
                    }
                }),
                None => Ok(run),
            }
        })
        .await
    }

    /// Apply `f` to the freshest copy of a job until the write sticks. `f`
    /// returning `None` leaves the job untouched.
    pub(crate) async fn modify_job<F>(&self, job_id: JobId, f: F) -> Result<Job>
    where
        F: Fn(&Job) -> Option<Job> + Send + Sync,
    {
        let f = &f;
        retry_stale("job update", move || async move {
            let job = self.store.get_job(job_id).await?;
            match f(&job) {
                Some(next) => self.store.update_job(&next, job.status).await,
                None => Ok(job),
            }
        })
        .await
    }

    pub(crate) async fn modify_step<F>(&self, step_id: StepId, f: F) -> Result<Step>
    where
        F: Fn(&Step) -> Option<Step> + Send + Sync,
    {
        let f = &f;
        retry_stale("step update", move || async move {
            let step = self.store.get_step(step_id).await?;
            match f(&step) {
                Some(next) => self.store.update_step(&next, step.status).await,
                None => Ok(step),
            }
        })
        .await
    }

    async fn close_steps(
        &self,
        job_id: JobId,
        attempt: i32,
        closing: Closing,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for step in self.store.list_steps(job_id, attempt).await? {
            if step.status.is_terminal() {
                continue;
            }
            self.modify_step(step.id, move |s| {
                if s.status.is_terminal() {
                    return None;
                }
                let conclusion = closing.conclusion_for(s);
                let mut next = s.clone();
                next.status = terminal_status(conclusion);
                next.conclusion = Some(conclusion);
                next.completed_at = Some(now);
                Some(next)
            })
            .await?;
        }
        Ok(())
    }

    /// Cancel a job and its unfinished steps outright.
    pub async fn finalize_cancelled(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.close_steps(job_id, job.attempt(), Closing::Cancelled, now)
            .await?;
        let job = self
            .modify_job(job_id, move |j| {
                if j.status.is_terminal() {
                    return None;
                }
                let mut next = j.clone();
                next.status = Status::Cancelled;
                next.conclusion = Some(Conclusion::Cancelled);
                next.completed_at = Some(now);
                Some(next)
            })
            .await?;
        info!(job_id = %job_id, "Job cancelled");
        Ok(job)
    }

    /// Conclude a job `failure` for a reason no step is to blame for.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.close_steps(job_id, job.attempt(), Closing::Failed, now)
            .await?;
        let job = self
            .modify_job(job_id, move |j| {
                if j.status.is_terminal() {
                    return None;
                }
                let mut next = j.clone();
                next.status = Status::Completed;
                next.conclusion = Some(Conclusion::Failure);
                next.failure_reason = Some(reason);
                next.completed_at = Some(now);
                Some(next)
            })
            .await?;
        warn!(job_id = %job_id, reason = %reason, "Job failed");
        Ok(job)
    }

    /// Conclude a job as its runner reported, closing any unfinished steps.
    pub async fn conclude_job(
        &self,
        job_id: JobId,
        conclusion: Conclusion,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.close_steps(job_id, job.attempt(), Closing::Reported(conclusion), now)
            .await?;
        let job = self
            .modify_job(job_id, move |j| {
                if j.status.is_terminal() {
                    return None;
                }
                let conclusion = if j.cancel_requested_at.is_some() {
                    Conclusion::Cancelled
                } else {
                    conclusion
                };
                let mut next = j.clone();
                next.status = terminal_status(conclusion);
                next.conclusion = Some(conclusion);
                if conclusion == Conclusion::Failure {
                    next.failure_reason = Some(FailureReason::RunnerReported);
                }
                next.started_at.get_or_insert(now);
                next.completed_at = Some(now);
                Some(next)
            })
            .await?;
        info!(job_id = %job_id, conclusion = ?job.conclusion, "Runner concluded job");
        Ok(job)
    }

    /// Open attempt `attempt` of a job: cancel what is left of earlier
    /// attempts and give the attempt its own queued steps, copied from the
    /// first attempt. Repeating it is harmless. Returns the attempt's steps.
    pub async fn open_attempt(
        &self,
        job_id: JobId,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Step>> {
        for earlier in 0..attempt {
            self.close_steps(job_id, earlier, Closing::Cancelled, now)
                .await?;
        }

        let existing = self.store.list_steps(job_id, attempt).await?;
        if attempt == 0 || !existing.is_empty() {
            return Ok(existing);
        }
        let template = self.store.list_steps(job_id, 0).await?;
        let steps = fresh_steps(
            job_id,
            attempt,
            template
                .iter()
                .map(|s| (s.name.as_str(), s.continue_on_error)),
        );
        if steps.is_empty() {
            return Ok(steps);
        }
        match self.store.insert_steps(&steps).await {
            Ok(()) => info!(job_id = %job_id, attempt, "Opened job attempt"),
            Err(DbError::Duplicate(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.store.list_steps(job_id, attempt).await?)
    }

    /// Conclude a still-queued job `skipped` because a dependency did not
    /// succeed. `None` when the job was no longer queued.
    pub async fn skip_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = self.store.get_job(job_id).await?;
        if job.status != Status::Queued {
            return Ok(None);
        }
        if let Some(entry) = self.queue.entry_for_job(job_id).await? {
            match entry.status {
                QueueStatus::Pending => {
                    let retired = self
                        .queue
                        .retire(entry.id, QueueStatus::Pending, QueueStatus::Completed)
                        .await?;
                    if retired.is_none() && !entry.is_quarantined() {
                        return Ok(None);
                    }
                }
                QueueStatus::Processing => return Ok(None),
                QueueStatus::Completed | QueueStatus::Failed => {}
            }
        }

        self.close_steps(job_id, job.attempt(), Closing::Skipped, now)
            .await?;
        let job = self
            .modify_job(job_id, move |j| {
                if j.status != Status::Queued {
                    return None;
                }
                let mut next = j.clone();
                next.status = Status::Completed;
                next.conclusion = Some(Conclusion::Skipped);
                next.completed_at = Some(now);
                Some(next)
            })
            .await?;
        info!(job_id = %job_id, "Skipped job with unsuccessful dependency");
        Ok(Some(job))
    }

    /// Skip every queued job that transitively needs `job`.
    async fn skip_dependents(&self, job: &Job, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self.store.list_jobs(job.run_id).await?;
        let mut blocked: BTreeSet<JobId> = BTreeSet::from([job.id]);
        loop {
            let before = blocked.len();
            for candidate in &jobs {
                if candidate.needs.iter().any(|dep| blocked.contains(dep)) {
                    blocked.insert(candidate.id);
                }
            }
            if blocked.len() == before {
                break;
            }
        }

        let mut skipped = 0;
        for dependent in jobs.iter().filter(|j| j.id != job.id && blocked.contains(&j.id)) {
            if dependent.status == Status::Queued && self.skip_job(dependent.id, now).await?.is_some()
            {
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    /// Cancel one job. A job nobody is working on is cancelled at once; a
    /// leased job has its lease revoked and is only marked as cancelling, to
    /// be finished when its runner reports back or the grace period runs out.
    pub async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Revocation>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.store.get_job(job_id).await?;
            if job.status.is_terminal() || job.cancel_requested_at.is_some() {
                return Ok(None);
            }

            match self.queue.entry_for_job(job_id).await? {
                Some(entry) if entry.status == QueueStatus::Pending && !entry.is_quarantined() => {
                    let retired = self
                        .queue
                        .retire(entry.id, QueueStatus::Pending, QueueStatus::Failed)
                        .await?;
                    if retired.is_none() {
                        continue;
                    }
                    self.finalize_cancelled(job_id, now).await?;
                    return Ok(None);
                }
                Some(entry) if entry.status == QueueStatus::Processing => {
                    let revoked = if entry.is_quarantined() {
                        None
                    } else {
                        match self
                            .queue
                            .retire(entry.id, QueueStatus::Processing, QueueStatus::Failed)
                            .await?
                        {
                            Some(revoked) => Some(revoked),
                            None => continue,
                        }
                    };
                    self.modify_job(job_id, move |j| {
                        if j.status.is_terminal() || j.cancel_requested_at.is_some() {
                            return None;
                        }
                        let mut next = j.clone();
                        next.cancel_requested_at = Some(now);
                        Some(next)
                    })
                    .await?;
                    info!(job_id = %job_id, "Cancellation requested for leased job");
                    return Ok(revoked.and_then(|entry| {
                        entry.lease_holder.map(|runner_id| Revocation {
                            runner_id,
                            entry_id: entry.id,
                        })
                    }));
                }
                _ => {
                    self.finalize_cancelled(job_id, now).await?;
                    return Ok(None);
                }
            }
        }
        Err(Error::StaleState(format!(
            "job {} kept changing while being cancelled",
            job_id
        )))
    }

    /// Cancel a run top-down. Repeated calls and calls on finished runs are
    /// no-ops apart from returning the run.
    pub async fn cancel_run(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Result<(WorkflowRun, Vec<Revocation>)> {
        let run = retry_stale("run cancel", move || async move {
            let run = self.store.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            let mut next = run.clone();
            next.status = Status::Cancelled;
            next.conclusion = Some(Conclusion::Cancelled);
            next.cancel_requested_at = Some(now);
            next.completed_at = Some(now);
            self.store.update_run(&next, run.status).await
        })
        .await?;

        let mut revocations = Vec::new();
        if run.status != Status::Cancelled {
            return Ok((run, revocations));
        }
        for job in self.store.list_jobs(run_id).await? {
            if !job.status.is_terminal() {
                revocations.extend(self.cancel_job(job.id, now).await?);
            }
        }
        info!(run_id = %run_id, revoked = revocations.len(), "Run cancelled");
        Ok((run, revocations))
    }

    /// Propagate a job reaching a terminal status: skip its dependents if it
    /// did not succeed, apply fail-fast, then roll up the run.
    pub async fn job_finished(&self, job: &Job, now: DateTime<Utc>) -> Result<Vec<Revocation>> {
        let mut revocations = Vec::new();
        if !job.status.is_terminal() {
            return Ok(revocations);
        }
        if !job.succeeded() {
            self.skip_dependents(job, now).await?;
        }

        let run = self.store.get_run(job.run_id).await?;
        let failed = job.conclusion == Some(Conclusion::Failure);
        if failed && job.is_required() && run.fail_fast && !run.status.is_terminal() {
            info!(run_id = %run.id, job_id = %job.id, "Fail-fast: cancelling remaining jobs");
            for other in self.store.list_jobs(run.id).await? {
                if other.id != job.id && !other.status.is_terminal() {
                    revocations.extend(self.cancel_job(other.id, now).await?);
                }
            }
        }

        self.roll_up_run(run.id, now).await?;
        Ok(revocations)
    }
}
