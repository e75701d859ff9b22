//! Database row types and their mapping onto the domain model.

use chrono::{DateTime, Utc};
use runway_core::{
    Conclusion, FailureReason, Job, QueueEntry, QueueStatus, Runner, RunnerKind, RunnerStatus,
    Status, Step, Workflow, WorkflowRun,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{DbError, DbResult};

fn parse<T>(column: &str, value: &str) -> DbResult<T>
where
    T: FromStr,
{
    value
        .parse()
        .map_err(|_| DbError::Corrupt(format!("{} = {:?}", column, value)))
}

fn parse_opt<T>(column: &str, value: Option<&str>) -> DbResult<Option<T>>
where
    T: FromStr,
{
    value.map(|v| parse(column, v)).transpose()
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowRecord {
    pub id: uuid::Uuid,
    pub repository_id: uuid::Uuid,
    pub path: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WorkflowRecord> for Workflow {
    fn from(row: WorkflowRecord) -> Self {
        Workflow {
            id: row.id.into(),
            repository_id: row.repository_id.into(),
            path: row.path,
            enabled: row.enabled,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: uuid::Uuid,
    pub workflow_id: uuid::Uuid,
    pub repository_id: uuid::Uuid,
    pub number: i64,
    pub event: String,
    pub head_sha: String,
    pub head_branch: Option<String>,
    pub actor: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub fail_fast: bool,
    pub rerun_of: Option<uuid::Uuid>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl TryFrom<RunRecord> for WorkflowRun {
    type Error = DbError;

    fn try_from(row: RunRecord) -> DbResult<Self> {
        Ok(WorkflowRun {
            id: row.id.into(),
            workflow_id: row.workflow_id.into(),
            repository_id: row.repository_id.into(),
            number: row.number,
            event: row.event,
            head_sha: row.head_sha,
            head_branch: row.head_branch,
            actor: row.actor,
            status: parse::<Status>("workflow_runs.status", &row.status)?,
            conclusion: parse_opt::<Conclusion>(
                "workflow_runs.conclusion",
                row.conclusion.as_deref(),
            )?,
            fail_fast: row.fail_fast,
            rerun_of: row.rerun_of.map(Into::into),
            cancel_requested_at: row.cancel_requested_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub run_id: uuid::Uuid,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub failure_reason: Option<String>,
    pub runner_id: Option<uuid::Uuid>,
    pub required_labels: Vec<String>,
    pub needs: Vec<uuid::Uuid>,
    pub priority: i32,
    pub continue_on_error: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    pub rerun_of: Option<uuid::Uuid>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(row: JobRecord) -> DbResult<Self> {
        Ok(Job {
            id: row.id.into(),
            run_id: row.run_id.into(),
            name: row.name,
            status: parse::<Status>("jobs.status", &row.status)?,
            conclusion: parse_opt::<Conclusion>("jobs.conclusion", row.conclusion.as_deref())?,
            failure_reason: parse_opt::<FailureReason>(
                "jobs.failure_reason",
                row.failure_reason.as_deref(),
            )?,
            runner_id: row.runner_id.map(Into::into),
            required_labels: row.required_labels.into_iter().collect(),
            needs: row.needs.into_iter().map(Into::into).collect(),
            priority: row.priority,
            continue_on_error: row.continue_on_error,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            rerun_of: row.rerun_of.map(Into::into),
            cancel_requested_at: row.cancel_requested_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub attempt: i32,
    pub number: i32,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub log_ref: Option<String>,
    pub continue_on_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl TryFrom<StepRecord> for Step {
    type Error = DbError;

    fn try_from(row: StepRecord) -> DbResult<Self> {
        Ok(Step {
            id: row.id.into(),
            job_id: row.job_id.into(),
            attempt: row.attempt,
            number: row.number,
            name: row.name,
            status: parse::<Status>("steps.status", &row.status)?,
            conclusion: parse_opt::<Conclusion>("steps.conclusion", row.conclusion.as_deref())?,
            log_ref: row.log_ref,
            continue_on_error: row.continue_on_error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnerRecord {
    pub id: uuid::Uuid,
    pub name: String,
    pub status: String,
    pub kind: String,
    pub labels: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl TryFrom<RunnerRecord> for Runner {
    type Error = DbError;

    fn try_from(row: RunnerRecord) -> DbResult<Self> {
        Ok(Runner {
            id: row.id.into(),
            name: row.name,
            status: parse::<RunnerStatus>("runners.status", &row.status)?,
            kind: parse::<RunnerKind>("runners.kind", &row.kind)?,
            labels: row.labels.into_iter().collect(),
            last_heartbeat: row.last_heartbeat,
        })
    }
}

/// A queued job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub workflow_run_id: uuid::Uuid,
    pub priority: i32,
    pub status: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub lease_holder: Option<uuid::Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub quarantine_reason: Option<String>,
}

impl TryFrom<QueueRecord> for QueueEntry {
    type Error = DbError;

    fn try_from(row: QueueRecord) -> DbResult<Self> {
        Ok(QueueEntry {
            id: row.id.into(),
            job_id: row.job_id.into(),
            workflow_run_id: row.workflow_run_id.into(),
            priority: row.priority,
            status: parse::<QueueStatus>("job_queue.status", &row.status)?,
            data: row.data,
            created_at: row.created_at,
            available_at: row.available_at,
            lease_holder: row.lease_holder.map(Into::into),
            lease_expires_at: row.lease_expires_at,
            quarantine_reason: row.quarantine_reason,
        })
    }
}

/// Convert a batch of rows, failing on the first corrupt one.
pub fn convert_all<R, T>(rows: Vec<R>) -> DbResult<Vec<T>>
where
    T: TryFrom<R, Error = DbError>,
{
    rows.into_iter().map(T::try_from).collect()
}
