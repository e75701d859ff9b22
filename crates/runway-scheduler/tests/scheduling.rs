use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use runway_config::SchedulerConfig;
use runway_core::dispatch::{Assignment, RunnerDispatcher};
use runway_core::tree::{JobRequest, RunRequest, StepRequest};
use runway_core::{
    Conclusion, EntryId, Error, FailureReason, Job, JobId, QueueEntry, QueueStatus, RepositoryId,
    Runner, RunnerHeartbeat, RunnerId, RunnerKind, RunnerStatus, Status, WorkflowRun,
};
use runway_db::{DbError, MemoryStore, SchedulerStore};
use runway_scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingDispatcher {
    dispatched: Mutex<Vec<(RunnerId, JobId)>>,
    revoked: Mutex<Vec<(RunnerId, EntryId)>>,
    fail: AtomicBool,
}

#[async_trait]
impl RunnerDispatcher for RecordingDispatcher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn dispatch(&self, runner: &Runner, assignment: &Assignment) -> runway_core::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Timeout("runner unreachable".to_string()));
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((runner.id, assignment.job.id));
        Ok(())
    }

    async fn revoke(&self, runner_id: RunnerId, entry_id: EntryId) -> runway_core::Result<()> {
        self.revoked.lock().unwrap().push((runner_id, entry_id));
        Ok(())
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    store: Arc<MemoryStore>,
    dispatcher: Arc<RecordingDispatcher>,
    repository_id: RepositoryId,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let config = SchedulerConfig {
            runner_heartbeat_timeout: std::time::Duration::from_secs(3600),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(store.clone(), dispatcher.clone(), config);
        Self {
            scheduler: Arc::new(scheduler),
            store,
            dispatcher,
            repository_id: RepositoryId::new(),
        }
    }

    async fn runner(&self, labels: &[&str]) -> RunnerId {
        let heartbeat = RunnerHeartbeat {
            runner_id: RunnerId::new(),
            name: format!("runner-{}", labels.join("-")),
            kind: RunnerKind::SelfHosted,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            status: RunnerStatus::Online,
            timestamp: Utc::now(),
        };
        self.scheduler.heartbeat(&heartbeat).await.unwrap().id
    }

    async fn revive(&self, runner_id: RunnerId) {
        let runner = self.scheduler.registry().get(runner_id).await.unwrap();
        let heartbeat = RunnerHeartbeat {
            runner_id,
            name: runner.name,
            kind: runner.kind,
            labels: runner.labels,
            status: RunnerStatus::Online,
            timestamp: Utc::now(),
        };
        self.scheduler.heartbeat(&heartbeat).await.unwrap();
    }

    async fn submit(&self, jobs: Vec<JobRequest>, fail_fast: bool) -> WorkflowRun {
        let workflow = self
            .scheduler
            .register_workflow(self.repository_id, ".runway/ci.kdl")
            .await
            .unwrap();
        let request = RunRequest {
            workflow_id: workflow.id,
            repository_id: self.repository_id,
            event: "push".to_string(),
            head_sha: "3f2a9c1".to_string(),
            head_branch: Some("main".to_string()),
            actor: "octo".to_string(),
            fail_fast,
            jobs,
        };
        self.scheduler.submit_run(&request).await.unwrap()
    }

    async fn job(&self, run: &WorkflowRun, name: &str) -> Job {
        self.store
            .list_jobs(run.id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.name == name)
            .unwrap()
    }

    async fn run(&self, run: &WorkflowRun) -> WorkflowRun {
        self.store.get_run(run.id).await.unwrap()
    }

    async fn entry(&self, job: &Job) -> QueueEntry {
        self.store.entry_for_job(job.id).await.unwrap().unwrap()
    }

    async fn runner_status(&self, runner_id: RunnerId) -> RunnerStatus {
        self.scheduler.registry().get(runner_id).await.unwrap().status
    }

    async fn lease(&self, runner_id: RunnerId, now: DateTime<Utc>) -> Assignment {
        self.scheduler
            .lease_next(runner_id, now)
            .await
            .unwrap()
            .expect("runner should get work")
    }

    /// Start and conclude every step of an assignment.
    async fn run_steps(&self, runner_id: RunnerId, assignment: &Assignment, conclusion: Conclusion) {
        for step in &assignment.steps {
            self.scheduler
                .start_step(runner_id, step.id, None)
                .await
                .unwrap();
            self.scheduler
                .complete_step(runner_id, step.id, conclusion)
                .await
                .unwrap();
        }
    }
}

fn job(name: &str, needs: &[&str], labels: &[&str], steps: &[&str]) -> JobRequest {
    JobRequest {
        name: name.to_string(),
        needs: needs.iter().map(|n| n.to_string()).collect(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        priority: 0,
        max_retries: None,
        continue_on_error: false,
        steps: steps
            .iter()
            .map(|s| StepRequest {
                name: s.to_string(),
                continue_on_error: false,
            })
            .collect(),
        payload: serde_json::json!({ "job": name }),
    }
}

#[tokio::test]
async fn test_single_job_runs_to_success() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;
    assert_eq!(run.number, 1);
    assert_eq!(run.status, Status::Queued);

    let assignment = h.lease(runner, Utc::now()).await;
    assert_eq!(assignment.job.name, "build");
    assert_eq!(assignment.steps.len(), 1);
    assert_eq!(assignment.entry.data["job"], "build");
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Busy);

    let step = h
        .scheduler
        .start_step(runner, assignment.steps[0].id, Some("logs/build/1".to_string()))
        .await
        .unwrap();
    assert_eq!(step.status, Status::InProgress);
    assert_eq!(h.job(&run, "build").await.status, Status::InProgress);
    assert_eq!(h.run(&run).await.status, Status::InProgress);

    h.scheduler
        .complete_step(runner, assignment.steps[0].id, Conclusion::Success)
        .await
        .unwrap();

    let build = h.job(&run, "build").await;
    assert_eq!(build.status, Status::Completed);
    assert_eq!(build.conclusion, Some(Conclusion::Success));
    assert_eq!(build.runner_id, Some(runner));
    let run = h.run(&run).await;
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.conclusion, Some(Conclusion::Success));
    assert_eq!(h.entry(&build).await.status, QueueStatus::Completed);
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);
}

#[tokio::test]
async fn test_dependent_waits_for_dependency() {
    let h = Harness::new();
    let first = h.runner(&["linux"]).await;
    let second = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("build", &[], &["linux"], &["compile"]),
                job("test", &["build"], &["linux"], &["unit"]),
            ],
            false,
        )
        .await;

    let now = Utc::now();
    let build = h.lease(first, now).await;
    assert_eq!(build.job.name, "build");
    assert!(h.scheduler.lease_next(second, now).await.unwrap().is_none());
    assert_eq!(h.runner_status(second).await, RunnerStatus::Online);

    h.run_steps(first, &build, Conclusion::Success).await;

    let test = h.lease(second, now).await;
    assert_eq!(test.job.name, "test");
    h.run_steps(second, &test, Conclusion::Success).await;

    let run = h.run(&run).await;
    assert_eq!(run.conclusion, Some(Conclusion::Success));
}

#[tokio::test]
async fn test_higher_priority_dispatches_first() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let mut urgent = job("deploy", &[], &["linux"], &[]);
    urgent.priority = 10;
    h.submit(vec![job("lint", &[], &["linux"], &[]), urgent], false)
        .await;

    let assignment = h.lease(runner, Utc::now()).await;
    assert_eq!(assignment.job.name, "deploy");
}

#[tokio::test]
async fn test_runner_only_gets_jobs_its_labels_cover() {
    let h = Harness::new();
    let runner = h.runner(&["linux", "x64"]).await;
    let mut train = job("train", &[], &["gpu"], &["fit"]);
    train.priority = 50;
    h.submit(vec![train, job("build", &[], &["linux"], &["compile"])], false)
        .await;

    let assignment = h.lease(runner, Utc::now()).await;
    assert_eq!(assignment.job.name, "build");
    h.run_steps(runner, &assignment, Conclusion::Success).await;
    assert!(
        h.scheduler
            .lease_next(runner, Utc::now())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_continue_on_error_step_does_not_fail_job() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let mut build = job("build", &[], &["linux"], &["lint", "compile"]);
    build.steps[0].continue_on_error = true;
    let run = h.submit(vec![build], false).await;

    let assignment = h.lease(runner, Utc::now()).await;
    let (lint, compile) = (&assignment.steps[0], &assignment.steps[1]);
    assert!(lint.continue_on_error);

    h.scheduler.start_step(runner, lint.id, None).await.unwrap();
    h.scheduler
        .complete_step(runner, lint.id, Conclusion::Failure)
        .await
        .unwrap();
    assert_eq!(h.job(&run, "build").await.status, Status::InProgress);

    h.scheduler.start_step(runner, compile.id, None).await.unwrap();
    h.scheduler
        .complete_step(runner, compile.id, Conclusion::Success)
        .await
        .unwrap();

    let build = h.job(&run, "build").await;
    assert_eq!(build.conclusion, Some(Conclusion::Success));
    assert_eq!(h.run(&run).await.conclusion, Some(Conclusion::Success));
}

#[tokio::test]
async fn test_expired_lease_is_requeued_with_backoff() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;

    let now = Utc::now();
    let first = h.lease(runner, now).await;
    h.scheduler
        .start_step(runner, first.steps[0].id, None)
        .await
        .unwrap();

    let report = h.scheduler.tick_at(now + Duration::seconds(35)).await.unwrap();
    assert_eq!(report.leases_expired, 1);
    assert_eq!(report.requeued, 1);

    let build = h.job(&run, "build").await;
    assert_eq!(build.retry_count, 1);
    assert!(!build.status.is_terminal());
    let entry = h.entry(&build).await;
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.lease_holder, None);
    assert_eq!(entry.available_at, now + Duration::seconds(45));
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Offline);

    // The previous attempt's step was closed and the old holder is locked out.
    let old_step = h.store.get_step(first.steps[0].id).await.unwrap();
    assert_eq!(old_step.status, Status::Cancelled);
    let stale = h
        .scheduler
        .complete_step(runner, first.steps[0].id, Conclusion::Success)
        .await;
    assert!(matches!(stale, Err(Error::NotLeaseHolder(_))));

    h.revive(runner).await;
    assert!(
        h.scheduler
            .lease_next(runner, now + Duration::seconds(40))
            .await
            .unwrap()
            .is_none()
    );
    let second = h.lease(runner, now + Duration::seconds(46)).await;
    assert_eq!(second.job.id, build.id);
    assert_eq!(second.steps.len(), 1);
    assert_eq!(second.steps[0].attempt, 1);
    assert_ne!(second.steps[0].id, first.steps[0].id);

    h.run_steps(runner, &second, Conclusion::Success).await;
    assert_eq!(
        h.run(&run).await.conclusion,
        Some(Conclusion::Success)
    );
}

#[tokio::test]
async fn test_retries_exhausted_fails_job_and_skips_dependents() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let mut flaky = job("build", &[], &["linux"], &["compile"]);
    flaky.max_retries = Some(1);
    let run = h
        .submit(vec![flaky, job("test", &["build"], &["linux"], &["unit"])], false)
        .await;

    let now = Utc::now();
    h.lease(runner, now).await;
    let report = h.scheduler.tick_at(now + Duration::seconds(35)).await.unwrap();
    assert_eq!(report.requeued, 1);

    h.revive(runner).await;
    let later = now + Duration::seconds(50);
    h.lease(runner, later).await;
    let report = h
        .scheduler
        .tick_at(later + Duration::seconds(35))
        .await
        .unwrap();
    assert_eq!(report.retries_exhausted, 1);

    let build = h.job(&run, "build").await;
    assert_eq!(build.conclusion, Some(Conclusion::Failure));
    assert_eq!(build.failure_reason, Some(FailureReason::RetriesExhausted));
    assert_eq!(build.retry_count, 1);
    assert_eq!(h.entry(&build).await.status, QueueStatus::Failed);

    let test = h.job(&run, "test").await;
    assert_eq!(test.conclusion, Some(Conclusion::Skipped));
    assert_eq!(h.entry(&test).await.status, QueueStatus::Completed);

    let run = h.run(&run).await;
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.conclusion, Some(Conclusion::Failure));
}

#[tokio::test]
async fn test_fail_fast_cancels_running_sibling() {
    let h = Harness::new();
    let first = h.runner(&["linux"]).await;
    let second = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("lint", &[], &["linux"], &["clippy"]),
                job("test", &[], &["linux"], &["unit"]),
            ],
            true,
        )
        .await;

    let now = Utc::now();
    let a = h.lease(first, now).await;
    let b = h.lease(second, now).await;
    h.scheduler.start_step(first, a.steps[0].id, None).await.unwrap();
    h.scheduler.start_step(second, b.steps[0].id, None).await.unwrap();

    h.scheduler
        .complete_step(first, a.steps[0].id, Conclusion::Failure)
        .await
        .unwrap();

    let sibling = h.store.get_job(b.job.id).await.unwrap();
    assert!(sibling.cancel_requested_at.is_some());
    assert_eq!(
        *h.dispatcher.revoked.lock().unwrap(),
        vec![(second, b.entry.id)]
    );
    assert_eq!(h.run(&run).await.status, Status::InProgress);

    // The revoked runner may still report; its job ends cancelled.
    h.scheduler
        .complete_step(second, b.steps[0].id, Conclusion::Success)
        .await
        .unwrap();
    let sibling = h.store.get_job(b.job.id).await.unwrap();
    assert_eq!(sibling.status, Status::Cancelled);
    assert_eq!(sibling.conclusion, Some(Conclusion::Cancelled));
    assert_eq!(h.runner_status(second).await, RunnerStatus::Online);

    let run = h.run(&run).await;
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.conclusion, Some(Conclusion::Failure));
}

#[tokio::test]
async fn test_unreported_cancellation_is_reaped_after_grace() {
    let h = Harness::new();
    let first = h.runner(&["linux"]).await;
    let second = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("lint", &[], &["linux"], &["clippy"]),
                job("test", &[], &["linux"], &["unit"]),
            ],
            true,
        )
        .await;

    let now = Utc::now();
    let a = h.lease(first, now).await;
    let b = h.lease(second, now).await;
    h.scheduler
        .complete_job(first, a.job.id, Conclusion::Failure)
        .await
        .unwrap();

    let report = h.scheduler.tick_at(now + Duration::seconds(30)).await.unwrap();
    assert_eq!(report.cancellations_reaped, 0);
    assert_eq!(report.runners_reset, 0);
    assert_eq!(h.runner_status(second).await, RunnerStatus::Busy);

    let report = h.scheduler.tick_at(now + Duration::seconds(65)).await.unwrap();
    assert_eq!(report.cancellations_reaped, 1);
    let sibling = h.store.get_job(b.job.id).await.unwrap();
    assert_eq!(sibling.conclusion, Some(Conclusion::Cancelled));
    assert_eq!(h.runner_status(second).await, RunnerStatus::Online);
    assert_eq!(h.run(&run).await.conclusion, Some(Conclusion::Failure));
}

#[tokio::test]
async fn test_masked_failure_does_not_fail_fast() {
    let h = Harness::new();
    let first = h.runner(&["linux"]).await;
    let second = h.runner(&["linux"]).await;
    let mut optional = job("audit", &[], &["linux"], &["cargo-audit"]);
    optional.continue_on_error = true;
    let run = h
        .submit(vec![optional, job("test", &[], &["linux"], &["unit"])], true)
        .await;

    let now = Utc::now();
    let a = h.lease(first, now).await;
    let b = h.lease(second, now).await;
    let (audit, test) = if a.job.name == "audit" { (a, b) } else { (b, a) };
    let (audit_runner, test_runner) = (audit.job.runner_id.unwrap(), test.job.runner_id.unwrap());

    h.run_steps(audit_runner, &audit, Conclusion::Failure).await;
    let sibling = h.store.get_job(test.job.id).await.unwrap();
    assert!(sibling.cancel_requested_at.is_none());

    h.run_steps(test_runner, &test, Conclusion::Success).await;
    let run = h.run(&run).await;
    assert_eq!(run.conclusion, Some(Conclusion::Success));
}

#[tokio::test]
async fn test_cancel_run_is_top_down_and_idempotent() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("build", &[], &["linux"], &["compile", "package"]),
                job("deploy", &["build"], &["linux"], &["ship"]),
            ],
            false,
        )
        .await;

    let now = Utc::now();
    let build = h.lease(runner, now).await;
    h.scheduler
        .start_step(runner, build.steps[0].id, None)
        .await
        .unwrap();

    let cancelled = h.scheduler.cancel_run(run.id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert_eq!(cancelled.conclusion, Some(Conclusion::Cancelled));

    let deploy = h.job(&run, "deploy").await;
    assert_eq!(deploy.status, Status::Cancelled);
    assert_eq!(h.entry(&deploy).await.status, QueueStatus::Failed);
    assert_eq!(
        *h.dispatcher.revoked.lock().unwrap(),
        vec![(runner, build.entry.id)]
    );

    // No new steps once cancellation is requested.
    let start = h.scheduler.start_step(runner, build.steps[1].id, None).await;
    assert!(matches!(start, Err(Error::LeaseLost(_))));

    let again = h.scheduler.cancel_run(run.id).await.unwrap();
    assert_eq!(again.status, Status::Cancelled);
    assert_eq!(h.dispatcher.revoked.lock().unwrap().len(), 1);

    let job = h
        .scheduler
        .complete_job(runner, build.job.id, Conclusion::Success)
        .await
        .unwrap();
    assert_eq!(job.status, Status::Cancelled);
    let steps = h.store.list_steps(job.id, 0).await.unwrap();
    assert!(steps.iter().all(|s| s.status == Status::Cancelled));
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_are_exclusive() {
    let h = Harness::new();
    let mut runners = Vec::new();
    for _ in 0..8 {
        runners.push(h.runner(&["linux"]).await);
    }
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;

    let now = Utc::now();
    let tasks: Vec<_> = runners
        .iter()
        .map(|runner| {
            let scheduler = h.scheduler.clone();
            let runner = *runner;
            tokio::spawn(async move { scheduler.lease_next(runner, now).await })
        })
        .collect();

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(assignment) = task.await.unwrap().unwrap() {
            winners.push(assignment);
        }
    }
    assert_eq!(winners.len(), 1);

    let build = h.job(&run, "build").await;
    let entry = h.entry(&build).await;
    assert_eq!(entry.status, QueueStatus::Processing);
    assert_eq!(entry.lease_holder, build.runner_id);

    let mut busy = 0;
    for runner in &runners {
        if h.runner_status(*runner).await == RunnerStatus::Busy {
            busy += 1;
        }
    }
    assert_eq!(busy, 1);
}

#[tokio::test]
async fn test_failed_job_skips_transitive_dependents() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("build", &[], &["linux"], &["compile"]),
                job("test", &["build"], &["linux"], &["unit"]),
                job("deploy", &["test"], &["linux"], &["ship"]),
            ],
            false,
        )
        .await;

    let build = h.lease(runner, Utc::now()).await;
    h.run_steps(runner, &build, Conclusion::Failure).await;

    for name in ["test", "deploy"] {
        let job = h.job(&run, name).await;
        assert_eq!(job.conclusion, Some(Conclusion::Skipped), "{}", name);
        let steps = h.store.list_steps(job.id, 0).await.unwrap();
        assert!(steps.iter().all(|s| s.conclusion == Some(Conclusion::Skipped)));
    }
    assert!(h.scheduler.queue_snapshot().await.unwrap().is_empty());
    assert_eq!(h.run(&run).await.conclusion, Some(Conclusion::Failure));
}

#[tokio::test]
async fn test_retry_job_reruns_dependents_once() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("build", &[], &["linux"], &["compile"]),
                job("test", &["build"], &["linux"], &["unit"]),
                job("docs", &[], &["linux"], &["rustdoc"]),
            ],
            false,
        )
        .await;

    let now = Utc::now();
    let first = h.lease(runner, now).await;
    assert!(matches!(
        h.scheduler.retry_job(first.job.id).await,
        Err(Error::Conflict(_))
    ));
    let conclusion = if first.job.name == "build" {
        Conclusion::Failure
    } else {
        Conclusion::Success
    };
    h.scheduler
        .complete_job(runner, first.job.id, conclusion)
        .await
        .unwrap();
    let second = h.lease(runner, now).await;
    let conclusion = if second.job.name == "build" {
        Conclusion::Failure
    } else {
        Conclusion::Success
    };
    h.scheduler
        .complete_job(runner, second.job.id, conclusion)
        .await
        .unwrap();

    let build = h.job(&run, "build").await;
    let docs = h.job(&run, "docs").await;
    assert_eq!(build.conclusion, Some(Conclusion::Failure));
    assert_eq!(docs.conclusion, Some(Conclusion::Success));
    assert!(matches!(
        h.scheduler.retry_job(docs.id).await,
        Err(Error::Conflict(_))
    ));

    let rerun = h.scheduler.retry_job(build.id).await.unwrap();
    assert_eq!(rerun.rerun_of, Some(run.id));
    assert_eq!(rerun.number, 2);
    let jobs = h.store.list_jobs(rerun.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let new_build = jobs.iter().find(|j| j.name == "build").unwrap();
    let new_test = jobs.iter().find(|j| j.name == "test").unwrap();
    assert_eq!(new_build.rerun_of, Some(build.id));
    assert_eq!(new_test.needs, vec![new_build.id]);
    assert_eq!(
        h.store.list_steps(new_build.id, 0).await.unwrap().len(),
        1
    );

    let again = h.scheduler.retry_job(build.id).await.unwrap();
    assert_eq!(again.id, rerun.id);
}

#[tokio::test]
async fn test_unmatched_labels_fail_after_timeout() {
    let h = Harness::new();
    h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("train", &[], &["linux", "gpu"], &["fit"])], false)
        .await;

    let now = Utc::now();
    let report = h.scheduler.tick_at(now + Duration::seconds(30)).await.unwrap();
    assert_eq!(report.unmatched, 0);
    assert_eq!(report.dispatched, 0);

    let report = h.scheduler.tick_at(now + Duration::seconds(660)).await.unwrap();
    assert_eq!(report.unmatched, 1);
    let train = h.job(&run, "train").await;
    assert_eq!(train.conclusion, Some(Conclusion::Failure));
    assert_eq!(train.failure_reason, Some(FailureReason::NoMatchingRunner));
    assert_eq!(h.run(&run).await.conclusion, Some(Conclusion::Failure));
}

#[tokio::test]
async fn test_tick_dispatches_to_idle_runners() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;

    let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    let build = h.job(&run, "build").await;
    assert_eq!(
        *h.dispatcher.dispatched.lock().unwrap(),
        vec![(runner, build.id)]
    );
    assert_eq!(h.entry(&build).await.lease_holder, Some(runner));
}

#[tokio::test]
async fn test_failed_delivery_requeues_job() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;
    h.dispatcher.fail.store(true, Ordering::SeqCst);

    let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.dispatch_failures, 1);

    let build = h.job(&run, "build").await;
    assert_eq!(build.retry_count, 1);
    assert_eq!(h.entry(&build).await.status, QueueStatus::Pending);
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Offline);
}

#[tokio::test]
async fn test_duplicate_processing_entries_are_quarantined() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    h.submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;

    let now = Utc::now();
    let assignment = h.lease(runner, now).await;
    let mut rogue = assignment.entry.clone();
    rogue.id = EntryId::new();
    rogue.lease_holder = Some(RunnerId::new());
    rogue.created_at = now + Duration::milliseconds(1);
    h.store.insert_entry_unchecked(rogue);

    let report = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(report.quarantined, 2);
    assert!(
        h.scheduler
            .queue_snapshot()
            .await
            .unwrap()
            .iter()
            .all(|e| e.is_quarantined())
    );

    let report = h
        .scheduler
        .complete_step(runner, assignment.steps[0].id, Conclusion::Success)
        .await;
    assert!(matches!(report, Err(Error::InvariantViolation(_))));

    // Quarantined leases are never swept.
    let report = h.scheduler.tick_at(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(report.leases_expired, 0);
}

#[tokio::test]
async fn test_busy_runner_without_lease_is_reset() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    h.store
        .set_runner_status(runner, RunnerStatus::Online, RunnerStatus::Busy)
        .await
        .unwrap();

    let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
    assert_eq!(report.runners_reset, 1);
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);
}

#[tokio::test]
async fn test_tick_between_claim_and_bind_keeps_runner_busy() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(
            vec![
                job("build", &[], &["linux"], &["compile"]),
                job("lint", &[], &["linux"], &["clippy"]),
            ],
            false,
        )
        .await;
    let build = h.entry(&h.job(&run, "build").await).await;
    let lint = h.entry(&h.job(&run, "lint").await).await;
    let now = Utc::now();

    // One worker has claimed the entry but not yet bound the job.
    h.scheduler.leases().lease(build.id, runner, now).await.unwrap();
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Busy);

    // Another worker ticks in between.
    let report = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(report.runners_reset, 0);
    assert_eq!(report.dispatched, 0);
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Busy);

    let err = h
        .scheduler
        .leases()
        .lease(lint.id, runner, now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunnerUnavailable(_)));

    let report = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(report.quarantined, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ticks_racing_leases_never_double_book_a_runner() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    h.submit(
        vec![
            job("build", &[], &["linux"], &["compile"]),
            job("lint", &[], &["linux"], &["clippy"]),
            job("docs", &[], &["linux"], &["rustdoc"]),
        ],
        false,
    )
    .await;

    let now = Utc::now();
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    scheduler.tick_at(now).await.map(|_| ())
                } else {
                    scheduler.lease_next(runner, now).await.map(|_| ())
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let entries = h.scheduler.queue_snapshot().await.unwrap();
    assert_eq!(entries.iter().filter(|e| e.is_held_by(runner)).count(), 1);
    assert!(entries.iter().all(|e| !e.is_quarantined()));
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Busy);
}

#[tokio::test]
async fn test_cancel_survives_a_stale_job_write() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;
    let build = h.job(&run, "build").await;
    let entry = h.entry(&build).await;
    let now = Utc::now();

    h.scheduler.leases().lease(entry.id, runner, now).await.unwrap();
    // A binder that read the job before the cancel landed.
    let mut stale = h.store.get_job(build.id).await.unwrap();
    h.scheduler.cancel_run(run.id).await.unwrap();

    stale.runner_id = Some(runner);
    let err = h.store.update_job(&stale, stale.status).await.unwrap_err();
    assert!(matches!(err, DbError::Stale(_)));
    let build = h.job(&run, "build").await;
    assert!(build.cancel_requested_at.is_some());

    let job = h
        .scheduler
        .complete_job(runner, build.id, Conclusion::Success)
        .await
        .unwrap();
    assert_eq!(job.status, Status::Cancelled);
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_lease_always_ends_cancelled() {
    for _ in 0..20 {
        let h = Harness::new();
        let runner = h.runner(&["linux"]).await;
        let run = h
            .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
            .await;

        let now = Utc::now();
        let scheduler = h.scheduler.clone();
        let lease = tokio::spawn(async move { scheduler.lease_next(runner, now).await });
        let scheduler = h.scheduler.clone();
        let run_id = run.id;
        let cancel = tokio::spawn(async move { scheduler.cancel_run(run_id).await });
        let assignment = lease.await.unwrap().unwrap();
        cancel.await.unwrap().unwrap();

        let build = h.job(&run, "build").await;
        if !build.status.is_terminal() {
            // Only a job that reached its runner waits for the runner.
            assert!(assignment.is_some());
            assert!(build.cancel_requested_at.is_some());
            h.scheduler
                .complete_job(runner, build.id, Conclusion::Success)
                .await
                .unwrap();
        }
        let build = h.job(&run, "build").await;
        assert_eq!(build.status, Status::Cancelled);
        assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);
    }
}

/// Mark a run cancelled without touching its jobs, as a cancel that stopped
/// halfway leaves it.
async fn cancel_run_only(h: &Harness, run: &WorkflowRun, now: DateTime<Utc>) {
    let current = h.run(run).await;
    let mut cancelled = current.clone();
    cancelled.status = Status::Cancelled;
    cancelled.conclusion = Some(Conclusion::Cancelled);
    cancelled.cancel_requested_at = Some(now);
    cancelled.completed_at = Some(now);
    h.store.update_run(&cancelled, current.status).await.unwrap();
}

#[tokio::test]
async fn test_tick_finishes_an_interrupted_run_cancel() {
    let h = Harness::new();
    let run = h
        .submit(
            vec![
                job("build", &[], &["linux"], &["compile"]),
                job("deploy", &["build"], &["linux"], &["ship"]),
            ],
            false,
        )
        .await;
    let now = Utc::now();
    cancel_run_only(&h, &run, now).await;

    let runner = h.runner(&["linux"]).await;
    assert!(h.scheduler.lease_next(runner, now).await.unwrap().is_none());

    let report = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(report.cancellations_resumed, 2);
    assert_eq!(report.dispatched, 0);
    for name in ["build", "deploy"] {
        let job = h.job(&run, name).await;
        assert_eq!(job.status, Status::Cancelled);
        assert_eq!(h.entry(&job).await.status, QueueStatus::Failed);
    }
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);

    let report = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(report.cancellations_resumed, 0);
}

#[tokio::test]
async fn test_interrupted_run_cancel_revokes_running_job() {
    let h = Harness::new();
    let runner = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;
    let now = Utc::now();
    let assignment = h.lease(runner, now).await;
    h.scheduler
        .start_step(runner, assignment.steps[0].id, None)
        .await
        .unwrap();
    cancel_run_only(&h, &run, now).await;

    let report = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(report.cancellations_resumed, 1);
    assert_eq!(report.runners_reset, 0);
    assert_eq!(
        *h.dispatcher.revoked.lock().unwrap(),
        vec![(runner, assignment.entry.id)]
    );
    let build = h.job(&run, "build").await;
    assert!(build.cancel_requested_at.is_some());
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Busy);

    let job = h
        .scheduler
        .complete_job(runner, build.id, Conclusion::Success)
        .await
        .unwrap();
    assert_eq!(job.status, Status::Cancelled);
    assert_eq!(h.runner_status(runner).await, RunnerStatus::Online);
}

#[tokio::test]
async fn test_requeue_counts_the_attempt_at_once() {
    let h = Harness::new();
    let first = h.runner(&["linux"]).await;
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;
    let now = Utc::now();
    let assignment = h.lease(first, now).await;
    let held = h.entry(&assignment.job).await;

    // Nothing after the requeue runs: no new steps, no runner bookkeeping.
    h.scheduler
        .leases()
        .requeue(&held, None, now, 1)
        .await
        .unwrap()
        .unwrap();
    let build = h.job(&run, "build").await;
    assert_eq!(build.retry_count, 1);
    assert_eq!(build.runner_id, None);
    assert!(h.store.list_steps(build.id, 1).await.unwrap().is_empty());

    let second = h.runner(&["linux"]).await;
    let retried = h.lease(second, now).await;
    assert_eq!(retried.job.id, build.id);
    assert_eq!(retried.steps.len(), 1);
    assert_eq!(retried.steps[0].attempt, 1);
    let old = h.store.get_step(assignment.steps[0].id).await.unwrap();
    assert_eq!(old.status, Status::Cancelled);
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let h = Harness::new();
    let run = h
        .submit(vec![job("build", &[], &["linux"], &["compile"])], false)
        .await;
    let build = h.job(&run, "build").await;
    let existing = h.entry(&build).await;

    let entry = h.scheduler.enqueue(build.id, 5).await.unwrap();
    assert_eq!(entry.id, existing.id);
    assert_eq!(h.scheduler.queue_snapshot().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_submit_rejects_disabled_workflow() {
    let h = Harness::new();
    let workflow = h
        .scheduler
        .register_workflow(h.repository_id, ".runway/nightly.kdl")
        .await
        .unwrap();
    h.scheduler
        .set_workflow_enabled(workflow.id, false)
        .await
        .unwrap();

    let request = RunRequest {
        workflow_id: workflow.id,
        repository_id: h.repository_id,
        event: "schedule".to_string(),
        head_sha: "3f2a9c1".to_string(),
        head_branch: None,
        actor: "cron".to_string(),
        fail_fast: false,
        jobs: vec![job("build", &[], &[], &[])],
    };
    assert!(matches!(
        h.scheduler.submit_run(&request).await,
        Err(Error::InvalidInput(_))
    ));
}
