//! In-memory implementation of [`SchedulerStore`].
//!
//! Every operation takes the state lock once, checks its condition and
//! applies its write before releasing it, which gives the same
//! compare-and-set semantics as the conditional SQL statements. The lock is
//! never held across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runway_core::status::EntityKind;
use runway_core::{
    EntryId, Job, JobId, QueueEntry, QueueStatus, RepositoryId, RunId, Runner, RunnerHeartbeat,
    RunnerId, RunnerStatus, Status, Step, StepId, Workflow, WorkflowId, WorkflowRun,
};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::repo::{Claim, SchedulerStore, guard_transition};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    workflows: HashMap<WorkflowId, Workflow>,
    run_counters: HashMap<RepositoryId, i64>,
    runs: HashMap<RunId, WorkflowRun>,
    jobs: HashMap<JobId, Job>,
    steps: HashMap<StepId, Step>,
    entries: HashMap<EntryId, QueueEntry>,
    runners: HashMap<RunnerId, Runner>,
}

impl State {
    fn has_live_entry(&self, job_id: JobId) -> bool {
        self.entries
            .values()
            .any(|e| e.job_id == job_id && !e.status.is_terminal())
    }

    fn dependencies_met(&self, job: &Job) -> bool {
        job.needs
            .iter()
            .all(|dep| self.jobs.get(dep).is_some_and(|d| d.succeeded()))
    }

    fn run_cancelled(&self, run_id: RunId) -> bool {
        self.runs
            .get(&run_id)
            .is_some_and(|r| r.cancel_requested_at.is_some())
    }

    /// Whether the runner still holds a lease, or a revoked lease on a job
    /// that has not finished.
    fn runner_has_work(&self, runner_id: RunnerId) -> bool {
        self.entries.values().any(|e| {
            e.lease_holder == Some(runner_id)
                && match e.status {
                    QueueStatus::Processing => true,
                    QueueStatus::Failed => self
                        .jobs
                        .get(&e.job_id)
                        .is_some_and(|j| !j.status.is_terminal()),
                    _ => false,
                }
        })
    }

    /// Apply `f` to an unquarantined entry whose condition holds.
    fn update_entry<P, F>(&mut self, id: EntryId, condition: P, f: F) -> Option<QueueEntry>
    where
        P: FnOnce(&QueueEntry) -> bool,
        F: FnOnce(&mut QueueEntry),
    {
        let entry = self.entries.get_mut(&id)?;
        if entry.is_quarantined() || !condition(entry) {
            return None;
        }
        f(entry);
        Some(entry.clone())
    }
}

/// Shared in-memory store; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert an entry without the one-live-entry-per-job check. Only useful
    /// for reproducing corrupted queues when exercising invariant detection.
    pub fn insert_entry_unchecked(&self, entry: QueueEntry) {
        self.state().entries.insert(entry.id, entry);
    }
}

fn stale(
    entity: &str,
    id: impl std::fmt::Display,
    expected: (Status, i64),
    found: (Status, i64),
) -> DbError {
    DbError::Stale(format!(
        "{} {} expected {} v{} found {} v{}",
        entity, id, expected.0, expected.1, found.0, found.1
    ))
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn upsert_workflow(&self, workflow: &Workflow) -> DbResult<Workflow> {
        let mut state = self.state();
        if let Some(existing) = state
            .workflows
            .values()
            .find(|w| w.repository_id == workflow.repository_id && w.path == workflow.path)
        {
            return Ok(existing.clone());
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow.clone())
    }

    async fn get_workflow(&self, id: WorkflowId) -> DbResult<Workflow> {
        self.state()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("workflow {}", id)))
    }

    async fn set_workflow_enabled(&self, id: WorkflowId, enabled: bool) -> DbResult<Workflow> {
        let mut state = self.state();
        let workflow = state
            .workflows
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("workflow {}", id)))?;
        workflow.enabled = enabled;
        Ok(workflow.clone())
    }

    async fn delete_workflow(&self, id: WorkflowId) -> DbResult<()> {
        let mut state = self.state();
        state.workflows.remove(&id);

        let run_ids: BTreeSet<RunId> = state
            .runs
            .values()
            .filter(|r| r.workflow_id == id)
            .map(|r| r.id)
            .collect();
        let job_ids: BTreeSet<JobId> = state
            .jobs
            .values()
            .filter(|j| run_ids.contains(&j.run_id))
            .map(|j| j.id)
            .collect();
        state.runs.retain(|run_id, _| !run_ids.contains(run_id));
        state.jobs.retain(|job_id, _| !job_ids.contains(job_id));
        state.steps.retain(|_, s| !job_ids.contains(&s.job_id));
        state.entries.retain(|_, e| !job_ids.contains(&e.job_id));
        Ok(())
    }

    async fn create_run(
        &self,
        run: &WorkflowRun,
        jobs: &[Job],
        steps: &[Step],
        entries: &[QueueEntry],
    ) -> DbResult<WorkflowRun> {
        let mut state = self.state();
        if !state.workflows.contains_key(&run.workflow_id) {
            return Err(DbError::NotFound(format!("workflow {}", run.workflow_id)));
        }
        if state.runs.contains_key(&run.id) {
            return Err(DbError::Duplicate(format!("workflow run {}", run.id)));
        }
        for source in jobs.iter().filter_map(|j| j.rerun_of) {
            if state.jobs.values().any(|j| j.rerun_of == Some(source)) {
                return Err(DbError::Duplicate(format!("re-run of job {}", source)));
            }
        }
        for entry in entries {
            if state.has_live_entry(entry.job_id) {
                return Err(DbError::Duplicate(format!(
                    "live queue entry for job {}",
                    entry.job_id
                )));
            }
        }

        let counter = state.run_counters.entry(run.repository_id).or_insert(0);
        *counter += 1;
        let mut created = run.clone();
        created.number = *counter;

        state.runs.insert(created.id, created.clone());
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        for entry in entries {
            let mut entry = entry.clone();
            entry.status = QueueStatus::Pending;
            state.entries.insert(entry.id, entry);
        }
        Ok(created)
    }

    async fn get_run(&self, id: RunId) -> DbResult<WorkflowRun> {
        self.state()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("workflow run {}", id)))
    }

    async fn list_runs(
        &self,
        repository_id: RepositoryId,
        limit: i64,
    ) -> DbResult<Vec<WorkflowRun>> {
        let state = self.state();
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| r.repository_id == repository_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| Reverse(r.number));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn update_run(&self, run: &WorkflowRun, expected: Status) -> DbResult<WorkflowRun> {
        guard_transition(EntityKind::Run, expected, run.status)?;
        let mut state = self.state();
        let current = state
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| DbError::NotFound(format!("workflow run {}", run.id)))?;
        if current.status != expected || current.version != run.version {
            return Err(stale(
                "workflow run",
                run.id,
                (expected, run.version),
                (current.status, current.version),
            ));
        }
        current.status = run.status;
        current.conclusion = run.conclusion;
        current.cancel_requested_at = run.cancel_requested_at;
        current.started_at = run.started_at;
        current.completed_at = run.completed_at;
        current.version += 1;
        Ok(current.clone())
    }

    async fn get_job(&self, id: JobId) -> DbResult<Job> {
        self.state()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list_jobs(&self, run_id: RunId) -> DbResult<Vec<Job>> {
        let state = self.state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn update_job(&self, job: &Job, expected: Status) -> DbResult<Job> {
        guard_transition(EntityKind::Job, expected, job.status)?;
        let mut state = self.state();
        let current = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;
        if current.status != expected || current.version != job.version {
            return Err(stale(
                "job",
                job.id,
                (expected, job.version),
                (current.status, current.version),
            ));
        }
        current.status = job.status;
        current.conclusion = job.conclusion;
        current.failure_reason = job.failure_reason;
        current.runner_id = job.runner_id;
        current.retry_count = job.retry_count;
        current.cancel_requested_at = job.cancel_requested_at;
        current.started_at = job.started_at;
        current.completed_at = job.completed_at;
        current.version += 1;
        Ok(current.clone())
    }

    async fn find_rerun_of(&self, job_id: JobId) -> DbResult<Option<Job>> {
        let state = self.state();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.rerun_of == Some(job_id))
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn cancelling_jobs(&self, requested_before: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let state = self.state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                !j.status.is_terminal()
                    && j.cancel_requested_at.is_some_and(|at| at <= requested_before)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.cancel_requested_at);
        Ok(jobs)
    }

    async fn jobs_of_cancelled_runs(&self, limit: i64) -> DbResult<Vec<Job>> {
        let state = self.state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                !j.status.is_terminal()
                    && j.cancel_requested_at.is_none()
                    && state.run_cancelled(j.run_id)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn get_step(&self, id: StepId) -> DbResult<Step> {
        self.state()
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("step {}", id)))
    }

    async fn list_steps(&self, job_id: JobId, attempt: i32) -> DbResult<Vec<Step>> {
        let state = self.state();
        let mut steps: Vec<Step> = state
            .steps
            .values()
            .filter(|s| s.job_id == job_id && s.attempt == attempt)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.number);
        Ok(steps)
    }

    async fn insert_steps(&self, steps: &[Step]) -> DbResult<()> {
        let mut state = self.state();
        for step in steps {
            let clash = state.steps.values().any(|s| {
                s.job_id == step.job_id && s.attempt == step.attempt && s.number == step.number
            });
            if clash {
                return Err(DbError::Duplicate(format!(
                    "steps for job {} attempt {}",
                    step.job_id, step.attempt
                )));
            }
        }
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn update_step(&self, step: &Step, expected: Status) -> DbResult<Step> {
        guard_transition(EntityKind::Step, expected, step.status)?;
        let mut state = self.state();
        let current = state
            .steps
            .get_mut(&step.id)
            .ok_or_else(|| DbError::NotFound(format!("step {}", step.id)))?;
        if current.status != expected || current.version != step.version {
            return Err(stale(
                "step",
                step.id,
                (expected, step.version),
                (current.status, current.version),
            ));
        }
        current.status = step.status;
        current.conclusion = step.conclusion;
        current.log_ref = step.log_ref.clone();
        current.started_at = step.started_at;
        current.completed_at = step.completed_at;
        current.version += 1;
        Ok(current.clone())
    }

    async fn enqueue(&self, entry: &QueueEntry) -> DbResult<QueueEntry> {
        let mut state = self.state();
        if !state.jobs.contains_key(&entry.job_id) {
            return Err(DbError::NotFound(format!("job {}", entry.job_id)));
        }
        if state.has_live_entry(entry.job_id) {
            return Err(DbError::Duplicate(format!(
                "live queue entry for job {}",
                entry.job_id
            )));
        }
        let mut entry = entry.clone();
        entry.status = QueueStatus::Pending;
        entry.lease_holder = None;
        entry.lease_expires_at = None;
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&self, id: EntryId) -> DbResult<QueueEntry> {
        self.state()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("queue entry {}", id)))
    }

    async fn entry_for_job(&self, job_id: JobId) -> DbResult<Option<QueueEntry>> {
        let state = self.state();
        Ok(state
            .entries
            .values()
            .filter(|e| e.job_id == job_id)
            .max_by_key(|e| (e.created_at, e.id))
            .cloned())
    }

    async fn peek_ready(
        &self,
        labels: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<QueueEntry>> {
        let state = self.state();
        Ok(state
            .entries
            .values()
            .filter(|e| {
                e.status == QueueStatus::Pending
                    && !e.is_quarantined()
                    && e.available_at <= now
                    && !state.run_cancelled(e.workflow_run_id)
            })
            .filter(|e| {
                state.jobs.get(&e.job_id).is_some_and(|job| {
                    job.required_labels.is_subset(labels) && state.dependencies_met(job)
                })
            })
            .min_by_key(|e| (Reverse(e.priority), e.created_at, e.id))
            .cloned())
    }

    async fn claim_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Claim> {
        let mut state = self.state();
        let online = state
            .runners
            .get(&runner_id)
            .is_some_and(|r| r.status == RunnerStatus::Online);
        if !online {
            return Ok(Claim::RunnerUnavailable);
        }
        let claimed = state.update_entry(
            id,
            |e| e.status == QueueStatus::Pending,
            |e| {
                e.status = QueueStatus::Processing;
                e.lease_holder = Some(runner_id);
                e.lease_expires_at = Some(expires_at);
            },
        );
        let Some(entry) = claimed else {
            return Ok(Claim::EntryTaken);
        };
        if let Some(runner) = state.runners.get_mut(&runner_id) {
            runner.status = RunnerStatus::Busy;
        }
        Ok(Claim::Leased(entry))
    }

    async fn renew_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Option<QueueEntry>> {
        Ok(self.state().update_entry(
            id,
            |e| e.is_held_by(runner_id),
            |e| e.lease_expires_at = Some(expires_at),
        ))
    }

    async fn finish_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        outcome: QueueStatus,
    ) -> DbResult<Option<QueueEntry>> {
        Ok(self.state().update_entry(
            id,
            |e| e.is_held_by(runner_id),
            |e| {
                e.status = outcome;
                e.lease_expires_at = None;
            },
        ))
    }

    async fn requeue_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expired_by: Option<DateTime<Utc>>,
        available_at: DateTime<Utc>,
        attempt: i32,
    ) -> DbResult<Option<QueueEntry>> {
        let mut state = self.state();
        let requeued = state.update_entry(
            id,
            |e| {
                e.is_held_by(runner_id)
                    && expired_by.is_none_or(|by| e.lease_expires_at.is_some_and(|x| x <= by))
            },
            |e| {
                e.status = QueueStatus::Pending;
                e.lease_holder = None;
                e.lease_expires_at = None;
                e.available_at = available_at;
            },
        );
        if let Some(job) = requeued
            .as_ref()
            .and_then(|e| state.jobs.get_mut(&e.job_id))
            .filter(|j| !j.status.is_terminal())
        {
            job.retry_count = job.retry_count.max(attempt);
            job.runner_id = None;
            job.version += 1;
        }
        Ok(requeued)
    }

    async fn retire_entry(
        &self,
        id: EntryId,
        from: QueueStatus,
        outcome: QueueStatus,
    ) -> DbResult<Option<QueueEntry>> {
        Ok(self.state().update_entry(
            id,
            |e| e.status == from,
            |e| {
                e.status = outcome;
                e.lease_expires_at = None;
            },
        ))
    }

    async fn expired_entries(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<QueueEntry>> {
        let state = self.state();
        let mut expired: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|e| {
                e.status == QueueStatus::Processing
                    && !e.is_quarantined()
                    && e.lease_expires_at.is_some_and(|x| x <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|e| e.lease_expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn live_entries(&self) -> DbResult<Vec<QueueEntry>> {
        let state = self.state();
        let mut live: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        live.sort_by_key(|e| (Reverse(e.priority), e.created_at, e.id));
        Ok(live)
    }

    async fn quarantine_entry(&self, id: EntryId, reason: &str) -> DbResult<()> {
        let mut state = self.state();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("queue entry {}", id)))?;
        if entry.quarantine_reason.is_none() {
            entry.quarantine_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn record_heartbeat(&self, heartbeat: &RunnerHeartbeat) -> DbResult<Runner> {
        let mut state = self.state();
        let runner = state
            .runners
            .entry(heartbeat.runner_id)
            .or_insert_with(|| Runner {
                id: heartbeat.runner_id,
                name: heartbeat.name.clone(),
                status: heartbeat.status,
                kind: heartbeat.kind,
                labels: heartbeat.labels.clone(),
                last_heartbeat: heartbeat.timestamp,
            });
        runner.name = heartbeat.name.clone();
        runner.kind = heartbeat.kind;
        runner.labels = heartbeat.labels.clone();
        runner.last_heartbeat = runner.last_heartbeat.max(heartbeat.timestamp);
        if runner.status != RunnerStatus::Busy {
            runner.status = heartbeat.status;
        }
        Ok(runner.clone())
    }

    async fn get_runner(&self, id: RunnerId) -> DbResult<Runner> {
        self.state()
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))
    }

    async fn list_runners(&self) -> DbResult<Vec<Runner>> {
        let state = self.state();
        let mut runners: Vec<Runner> = state.runners.values().cloned().collect();
        runners.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(runners)
    }

    async fn set_runner_status(
        &self,
        id: RunnerId,
        expected: RunnerStatus,
        next: RunnerStatus,
    ) -> DbResult<Option<Runner>> {
        let mut state = self.state();
        let runner = state
            .runners
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        if runner.status != expected {
            return Ok(None);
        }
        runner.status = next;
        Ok(Some(runner.clone()))
    }

    async fn release_runner(&self, id: RunnerId) -> DbResult<Option<Runner>> {
        let mut state = self.state();
        if state.runner_has_work(id) {
            return Ok(None);
        }
        let runner = state
            .runners
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        if runner.status != RunnerStatus::Busy {
            return Ok(None);
        }
        runner.status = RunnerStatus::Online;
        Ok(Some(runner.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(run_id: RunId, priority: i32, labels: &[&str], needs: Vec<JobId>) -> Job {
        Job {
            id: JobId::new(),
            run_id,
            name: format!("job-{}", priority),
            status: Status::Queued,
            conclusion: None,
            failure_reason: None,
            runner_id: None,
            required_labels: labels.iter().map(|s| s.to_string()).collect(),
            needs,
            priority,
            continue_on_error: false,
            retry_count: 0,
            max_retries: 1,
            rerun_of: None,
            cancel_requested_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    fn seed(store: &MemoryStore, jobs: &[Job]) -> Vec<QueueEntry> {
        let mut state = store.state();
        let now = Utc::now();
        jobs.iter()
            .enumerate()
            .map(|(i, job)| {
                state.jobs.insert(job.id, job.clone());
                let mut entry = QueueEntry::pending(
                    job,
                    serde_json::Value::Null,
                    now + Duration::milliseconds(i as i64),
                );
                entry.available_at = now;
                state.entries.insert(entry.id, entry.clone());
                entry
            })
            .collect()
    }

    async fn online_runner(store: &MemoryStore) -> RunnerId {
        let heartbeat = RunnerHeartbeat {
            runner_id: RunnerId::new(),
            name: "linux-1".to_string(),
            kind: runway_core::RunnerKind::SelfHosted,
            labels: labels(&["linux"]),
            status: RunnerStatus::Online,
            timestamp: Utc::now(),
        };
        store.record_heartbeat(&heartbeat).await.unwrap().id
    }

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_peek_ready_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let run_id = RunId::new();
        let entries = seed(
            &store,
            &[
                job(run_id, 100, &[], vec![]),
                job(run_id, 200, &[], vec![]),
                job(run_id, 200, &[], vec![]),
            ],
        );

        let now = Utc::now() + Duration::seconds(1);
        let ready = store.peek_ready(&labels(&[]), now).await.unwrap().unwrap();
        assert_eq!(ready.id, entries[1].id);

        // Peeking does not mutate.
        let again = store.peek_ready(&labels(&[]), now).await.unwrap().unwrap();
        assert_eq!(again.id, entries[1].id);
    }

    #[tokio::test]
    async fn test_peek_ready_respects_labels_and_dependencies() {
        let store = MemoryStore::new();
        let run_id = RunId::new();
        let build = job(run_id, 0, &["linux"], vec![]);
        let gpu = job(run_id, 50, &["gpu"], vec![]);
        let test = job(run_id, 100, &["linux"], vec![build.id]);
        let entries = seed(&store, &[build.clone(), gpu, test]);

        let now = Utc::now() + Duration::seconds(1);
        let ready = store
            .peek_ready(&labels(&["linux", "x64"]), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.id, entries[0].id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let entries = seed(&store, &[job(RunId::new(), 0, &[], vec![])]);
        let expiry = Utc::now() + Duration::seconds(30);
        let a = online_runner(&store).await;
        let b = online_runner(&store).await;

        let first = store.claim_entry(entries[0].id, a, expiry).await.unwrap();
        let second = store.claim_entry(entries[0].id, b, expiry).await.unwrap();

        assert!(matches!(first, Claim::Leased(ref e) if e.lease_holder == Some(a)));
        assert!(matches!(second, Claim::EntryTaken));
        assert_eq!(store.get_runner(a).await.unwrap().status, RunnerStatus::Busy);
        assert_eq!(store.get_runner(b).await.unwrap().status, RunnerStatus::Online);
    }

    #[tokio::test]
    async fn test_busy_runner_cannot_claim_again() {
        let store = MemoryStore::new();
        let entries = seed(
            &store,
            &[job(RunId::new(), 0, &[], vec![]), job(RunId::new(), 0, &[], vec![])],
        );
        let expiry = Utc::now() + Duration::seconds(30);
        let runner = online_runner(&store).await;

        store.claim_entry(entries[0].id, runner, expiry).await.unwrap();
        let second = store.claim_entry(entries[1].id, runner, expiry).await.unwrap();

        assert!(matches!(second, Claim::RunnerUnavailable));
        let untouched = store.get_entry(entries[1].id).await.unwrap();
        assert_eq!(untouched.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_release_keeps_runner_that_holds_a_lease() {
        let store = MemoryStore::new();
        let entries = seed(&store, &[job(RunId::new(), 0, &[], vec![])]);
        let runner = online_runner(&store).await;
        let expiry = Utc::now() + Duration::seconds(30);
        store.claim_entry(entries[0].id, runner, expiry).await.unwrap();

        assert!(store.release_runner(runner).await.unwrap().is_none());
        assert_eq!(store.get_runner(runner).await.unwrap().status, RunnerStatus::Busy);

        store
            .finish_entry(entries[0].id, runner, QueueStatus::Completed)
            .await
            .unwrap();
        let released = store.release_runner(runner).await.unwrap().unwrap();
        assert_eq!(released.status, RunnerStatus::Online);
    }

    #[tokio::test]
    async fn test_requeue_records_attempt_with_the_entry() {
        let store = MemoryStore::new();
        let j = job(RunId::new(), 0, &[], vec![]);
        let entries = seed(&store, std::slice::from_ref(&j));
        let runner = online_runner(&store).await;
        let now = Utc::now();
        store
            .claim_entry(entries[0].id, runner, now + Duration::seconds(30))
            .await
            .unwrap();

        let requeued = store
            .requeue_entry(entries[0].id, runner, None, now, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);

        let after = store.get_job(j.id).await.unwrap();
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.version, j.version + 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_hides_its_entries() {
        let store = MemoryStore::new();
        let run_id = RunId::new();
        let j = job(run_id, 0, &[], vec![]);
        seed(&store, std::slice::from_ref(&j));
        let now = Utc::now() + Duration::seconds(1);
        assert!(store.peek_ready(&labels(&[]), now).await.unwrap().is_some());

        {
            let mut state = store.state();
            let run = WorkflowRun {
                id: run_id,
                workflow_id: WorkflowId::new(),
                repository_id: RepositoryId::new(),
                number: 1,
                event: "push".to_string(),
                head_sha: "abc".to_string(),
                head_branch: None,
                actor: "octo".to_string(),
                status: Status::Cancelled,
                conclusion: Some(runway_core::Conclusion::Cancelled),
                fail_fast: false,
                rerun_of: None,
                cancel_requested_at: Some(now),
                created_at: now,
                started_at: None,
                completed_at: Some(now),
                version: 0,
            };
            state.runs.insert(run_id, run);
        }

        assert!(store.peek_ready(&labels(&[]), now).await.unwrap().is_none());
        let orphans = store.jobs_of_cancelled_runs(10).await.unwrap();
        assert_eq!(orphans.iter().map(|j| j.id).collect::<Vec<_>>(), vec![j.id]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_second_live_entry() {
        let store = MemoryStore::new();
        let j = job(RunId::new(), 0, &[], vec![]);
        seed(&store, std::slice::from_ref(&j));

        let err = store
            .enqueue(&QueueEntry::pending(&j, serde_json::Value::Null, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_stale_job_write() {
        let store = MemoryStore::new();
        let j = job(RunId::new(), 0, &[], vec![]);
        seed(&store, std::slice::from_ref(&j));

        let mut started = j.clone();
        started.status = Status::InProgress;
        store.update_job(&started, Status::Queued).await.unwrap();

        let err = store.update_job(&started, Status::Queued).await.unwrap_err();
        assert!(matches!(err, DbError::Stale(_)));

        // Same status, older version: another writer got there first.
        let current = store.get_job(j.id).await.unwrap();
        let mut first = current.clone();
        first.cancel_requested_at = Some(Utc::now());
        store.update_job(&first, Status::InProgress).await.unwrap();
        let mut second = current;
        second.runner_id = Some(RunnerId::new());
        let err = store
            .update_job(&second, Status::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Stale(_)));
        assert!(store.get_job(j.id).await.unwrap().cancel_requested_at.is_some());

        let mut backwards = store.get_job(j.id).await.unwrap();
        backwards.status = Status::Queued;
        let err = store
            .update_job(&backwards, Status::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::IllegalTransition(_)));
    }
}
