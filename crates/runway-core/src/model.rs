//! Entity records for workflows, runs, jobs, steps, runners and queue entries.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::status::{ChildState, Conclusion, QueueStatus, RunnerStatus, Status};
use crate::{EntryId, Error, JobId, RepositoryId, RunId, RunnerId, StepId, WorkflowId};

/// An indexed workflow file. Immutable apart from `enabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub repository_id: RepositoryId,
    /// Path of the definition inside the repository.
    pub path: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub repository_id: RepositoryId,
    /// Per-repository run number, assigned by the store.
    pub number: i64,
    pub event: String,
    pub head_sha: String,
    pub head_branch: Option<String>,
    pub actor: String,
    pub status: Status,
    pub conclusion: Option<Conclusion>,
    /// Cancel the remaining jobs as soon as a required job fails.
    pub fail_fast: bool,
    /// Source run when this run was created by an explicit re-run.
    pub rerun_of: Option<RunId>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Why a job concluded `failure` without a failing step to blame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[display("retries_exhausted")]
    RetriesExhausted,
    #[display("no_matching_runner")]
    NoMatchingRunner,
    #[display("runner_reported")]
    RunnerReported,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::NoMatchingRunner => "no_matching_runner",
            FailureReason::RunnerReported => "runner_reported",
        }
    }
}

impl FromStr for FailureReason {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "retries_exhausted" => Ok(FailureReason::RetriesExhausted),
            "no_matching_runner" => Ok(FailureReason::NoMatchingRunner),
            "runner_reported" => Ok(FailureReason::RunnerReported),
            _ => Err(Error::InvalidInput(format!("unknown failure reason: {}", s))),
        }
    }
}

/// A unit of work within a run, leased to one runner at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    /// Unique within the run.
    pub name: String,
    pub status: Status,
    pub conclusion: Option<Conclusion>,
    pub failure_reason: Option<FailureReason>,
    /// Runner holding (or last holding) the job's lease.
    pub runner_id: Option<RunnerId>,
    /// Labels a runner must advertise to be leased this job.
    pub required_labels: BTreeSet<String>,
    /// Jobs in the same run that must succeed first.
    pub needs: Vec<JobId>,
    pub priority: i32,
    /// A failure of this job does not fail the run or trigger fail-fast.
    pub continue_on_error: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Source job when this job was created by an explicit re-run.
    pub rerun_of: Option<JobId>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by every write. A write computed from an older read is stale.
    pub version: i64,
}

impl Job {
    /// The attempt whose steps currently describe this job.
    pub fn attempt(&self) -> i32 {
        self.retry_count
    }

    /// Required jobs can fail their run and trigger fail-fast.
    pub fn is_required(&self) -> bool {
        !self.continue_on_error
    }

    pub fn succeeded(&self) -> bool {
        self.status == Status::Completed && self.conclusion == Some(Conclusion::Success)
    }

    pub fn child_state(&self) -> ChildState {
        ChildState {
            status: self.status,
            conclusion: self.conclusion,
            masks_failure: self.continue_on_error,
        }
    }
}

/// The smallest ordered unit of execution within a job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    /// Job attempt this step belongs to; a retry creates a fresh set.
    pub attempt: i32,
    /// 1-based ordinal within the attempt.
    pub number: i32,
    pub name: String,
    pub status: Status,
    pub conclusion: Option<Conclusion>,
    /// Opaque handle into the external log store.
    pub log_ref: Option<String>,
    pub continue_on_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Step {
    pub fn child_state(&self) -> ChildState {
        ChildState {
            status: self.status,
            conclusion: self.conclusion,
            masks_failure: self.continue_on_error,
        }
    }
}

/// Where a runner executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    #[display("kubernetes")]
    Kubernetes,
    #[display("self-hosted")]
    SelfHosted,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Kubernetes => "kubernetes",
            RunnerKind::SelfHosted => "self-hosted",
        }
    }
}

impl FromStr for RunnerKind {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "kubernetes" => Ok(RunnerKind::Kubernetes),
            "self-hosted" => Ok(RunnerKind::SelfHosted),
            _ => Err(Error::InvalidInput(format!("unknown runner kind: {}", s))),
        }
    }
}

/// An execution agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub status: RunnerStatus,
    pub kind: RunnerKind,
    pub labels: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Runner {
    /// A runner can take a job when it advertises every required label.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.labels)
    }
}

/// A liveness report from the runner-management layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHeartbeat {
    pub runner_id: RunnerId,
    pub name: String,
    pub kind: RunnerKind,
    pub labels: BTreeSet<String>,
    pub status: RunnerStatus,
    pub timestamp: DateTime<Utc>,
}

/// The dispatch queue's persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub job_id: JobId,
    pub workflow_run_id: RunId,
    /// Higher is dispatched first.
    pub priority: i32,
    pub status: QueueStatus,
    /// Opaque dispatch payload handed to the runner.
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Hidden from dispatch until this instant (retry backoff).
    pub available_at: DateTime<Utc>,
    pub lease_holder: Option<RunnerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Set when the entry is held for manual review.
    pub quarantine_reason: Option<String>,
}

impl QueueEntry {
    /// A fresh `pending` entry for a job.
    pub fn pending(job: &Job, data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            job_id: job.id,
            workflow_run_id: job.run_id,
            priority: job.priority,
            status: QueueStatus::Pending,
            data,
            created_at: now,
            available_at: now,
            lease_holder: None,
            lease_expires_at: None,
            quarantine_reason: None,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine_reason.is_some()
    }

    /// Processing with a lease that has not yet expired.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing
            && self.lease_expires_at.is_some_and(|expiry| expiry > now)
    }

    pub fn is_held_by(&self, runner_id: RunnerId) -> bool {
        self.status == QueueStatus::Processing && self.lease_holder == Some(runner_id)
    }
}
