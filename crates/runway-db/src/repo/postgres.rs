//! PostgreSQL implementation of [`SchedulerStore`].
//!
//! Exclusivity comes from conditional `UPDATE ... WHERE status = ... AND
//! version = ... RETURNING *` statements, short transactions where a write
//! spans two tables, and the partial unique index on live queue entries, so
//! any number of scheduler processes may share the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runway_core::status::EntityKind;
use runway_core::{
    EntryId, Job, JobId, QueueEntry, QueueStatus, RepositoryId, RunId, Runner, RunnerHeartbeat,
    RunnerId, RunnerStatus, Status, Step, StepId, Workflow, WorkflowId, WorkflowRun,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;

use super::rows::{
    JobRecord, QueueRecord, RunRecord, RunnerRecord, StepRecord, WorkflowRecord, convert_all,
};
use super::store::{Claim, SchedulerStore, guard_transition};
use crate::{DbError, DbResult};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn duplicate_on_conflict(err: DbError, what: String) -> DbError {
    match err {
        DbError::Database(ref db) if is_unique_violation(db) => DbError::Duplicate(what),
        other => other,
    }
}

fn labels_vec(labels: &BTreeSet<String>) -> Vec<String> {
    labels.iter().cloned().collect()
}

fn opt_str<T: AsRef<str>>(value: Option<T>) -> Option<String> {
    value.map(|v| v.as_ref().to_string())
}

/// PostgreSQL implementation of SchedulerStore.
#[derive(Clone)]
pub struct PgSchedulerStore {
    pool: PgPool,
}

impl PgSchedulerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional write matched no row.
    async fn stale_or_missing(
        &self,
        table: &str,
        id: uuid::Uuid,
        expected: Status,
        version: i64,
    ) -> DbResult<DbError> {
        let sql = format!("SELECT status, version FROM {} WHERE id = $1", table);
        let found: Option<(String, i64)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match found {
            Some((status, found_version)) => DbError::Stale(format!(
                "{} {} expected {} v{} found {} v{}",
                table, id, expected, version, status, found_version
            )),
            None => DbError::NotFound(format!("{} {}", table, id)),
        })
    }

    async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, run_id, name, status, conclusion, failure_reason, runner_id,
                              required_labels, needs, priority, continue_on_error, retry_count,
                              max_retries, rerun_of, cancel_requested_at, created_at, started_at,
                              completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.run_id.as_uuid())
        .bind(&job.name)
        .bind(job.status.as_str())
        .bind(opt_str(job.conclusion.map(|c| c.as_str())))
        .bind(opt_str(job.failure_reason.map(|r| r.as_str())))
        .bind(job.runner_id.map(uuid::Uuid::from))
        .bind(labels_vec(&job.required_labels))
        .bind(job.needs.iter().map(|id| *id.as_uuid()).collect::<Vec<_>>())
        .bind(job.priority)
        .bind(job.continue_on_error)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.rerun_of.map(uuid::Uuid::from))
        .bind(job.cancel_requested_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_step<'e, E>(executor: E, step: &Step) -> DbResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO steps (id, job_id, attempt, number, name, status, conclusion, log_ref,
                               continue_on_error, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.job_id.as_uuid())
        .bind(step.attempt)
        .bind(step.number)
        .bind(&step.name)
        .bind(step.status.as_str())
        .bind(opt_str(step.conclusion.map(|c| c.as_str())))
        .bind(&step.log_ref)
        .bind(step.continue_on_error)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn insert_entry<'e, E>(executor: E, entry: &QueueEntry) -> DbResult<QueueEntry>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            INSERT INTO job_queue (id, job_id, workflow_run_id, priority, status, data,
                                   created_at, available_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(entry.workflow_run_id.as_uuid())
        .bind(entry.priority)
        .bind(&entry.data)
        .bind(entry.created_at)
        .bind(entry.available_at)
        .fetch_one(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::Duplicate(format!("live queue entry for job {}", entry.job_id))
            } else {
                DbError::Database(e)
            }
        })?;
        record.try_into()
    }

    fn queue_entry(record: Option<QueueRecord>) -> DbResult<Option<QueueEntry>> {
        record.map(QueueEntry::try_from).transpose()
    }
}

#[async_trait]
impl SchedulerStore for PgSchedulerStore {
    async fn upsert_workflow(&self, workflow: &Workflow) -> DbResult<Workflow> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            INSERT INTO workflows (id, repository_id, path, enabled, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (repository_id, path) DO UPDATE SET path = EXCLUDED.path
            RETURNING *
            "#,
        )
        .bind(workflow.id.as_uuid())
        .bind(workflow.repository_id.as_uuid())
        .bind(&workflow.path)
        .bind(workflow.enabled)
        .bind(workflow.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record.into())
    }

    async fn get_workflow(&self, id: WorkflowId) -> DbResult<Workflow> {
        let record = sqlx::query_as::<_, WorkflowRecord>("SELECT * FROM workflows WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("workflow {}", id)))?;
        Ok(record.into())
    }

    async fn set_workflow_enabled(&self, id: WorkflowId, enabled: bool) -> DbResult<Workflow> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            "UPDATE workflows SET enabled = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("workflow {}", id)))?;
        Ok(record.into())
    }

    async fn delete_workflow(&self, id: WorkflowId) -> DbResult<()> {
        sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_run(
        &self,
        run: &WorkflowRun,
        jobs: &[Job],
        steps: &[Step],
        entries: &[QueueEntry],
    ) -> DbResult<WorkflowRun> {
        let mut tx = self.pool.begin().await?;

        let number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO repository_run_counters (repository_id, last_number)
            VALUES ($1, 1)
            ON CONFLICT (repository_id)
            DO UPDATE SET last_number = repository_run_counters.last_number + 1
            RETURNING last_number
            "#,
        )
        .bind(run.repository_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, repository_id, number, event, head_sha,
                                       head_branch, actor, status, conclusion, fail_fast,
                                       rerun_of, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.workflow_id.as_uuid())
        .bind(run.repository_id.as_uuid())
        .bind(number)
        .bind(&run.event)
        .bind(&run.head_sha)
        .bind(&run.head_branch)
        .bind(&run.actor)
        .bind(run.status.as_str())
        .bind(opt_str(run.conclusion.map(|c| c.as_str())))
        .bind(run.fail_fast)
        .bind(run.rerun_of.map(uuid::Uuid::from))
        .bind(run.created_at)
        .fetch_one(&mut *tx)
        .await?;

        for job in jobs {
            Self::insert_job(&mut tx, job)
                .await
                .map_err(|e| duplicate_on_conflict(e, format!("job {}", job.name)))?;
        }
        for step in steps {
            Self::insert_step(&mut *tx, step).await?;
        }
        for entry in entries {
            Self::insert_entry(&mut *tx, entry).await?;
        }

        tx.commit().await?;
        record.try_into()
    }

    async fn get_run(&self, id: RunId) -> DbResult<WorkflowRun> {
        let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("workflow run {}", id)))?;
        record.try_into()
    }

    async fn list_runs(
        &self,
        repository_id: RepositoryId,
        limit: i64,
    ) -> DbResult<Vec<WorkflowRun>> {
        let records = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM workflow_runs WHERE repository_id = $1 ORDER BY number DESC LIMIT $2",
        )
        .bind(repository_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn update_run(&self, run: &WorkflowRun, expected: Status) -> DbResult<WorkflowRun> {
        guard_transition(EntityKind::Run, expected, run.status)?;
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE workflow_runs
            SET status = $2, conclusion = $3, cancel_requested_at = $4, started_at = $5,
                completed_at = $6, version = version + 1
            WHERE id = $1 AND status = $7 AND version = $8
            RETURNING *
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.status.as_str())
        .bind(opt_str(run.conclusion.map(|c| c.as_str())))
        .bind(run.cancel_requested_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(expected.as_str())
        .bind(run.version)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => record.try_into(),
            None => Err(self
                .stale_or_missing("workflow_runs", *run.id.as_uuid(), expected, run.version)
                .await?),
        }
    }

    async fn get_job(&self, id: JobId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.try_into()
    }

    async fn list_jobs(&self, run_id: RunId) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE run_id = $1 ORDER BY created_at, id",
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn update_job(&self, job: &Job, expected: Status) -> DbResult<Job> {
        guard_transition(EntityKind::Job, expected, job.status)?;
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = $2, conclusion = $3, failure_reason = $4, runner_id = $5,
                retry_count = $6, cancel_requested_at = $7, started_at = $8, completed_at = $9,
                version = version + 1
            WHERE id = $1 AND status = $10 AND version = $11
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(opt_str(job.conclusion.map(|c| c.as_str())))
        .bind(opt_str(job.failure_reason.map(|r| r.as_str())))
        .bind(job.runner_id.map(uuid::Uuid::from))
        .bind(job.retry_count)
        .bind(job.cancel_requested_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(expected.as_str())
        .bind(job.version)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => record.try_into(),
            None => Err(self
                .stale_or_missing("jobs", *job.id.as_uuid(), expected, job.version)
                .await?),
        }
    }

    async fn find_rerun_of(&self, job_id: JobId) -> DbResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE rerun_of = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        record.map(Job::try_from).transpose()
    }

    async fn cancelling_jobs(&self, requested_before: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE cancel_requested_at <= $1 AND status IN ('queued', 'in_progress')
            ORDER BY cancel_requested_at
            "#,
        )
        .bind(requested_before)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn jobs_of_cancelled_runs(&self, limit: i64) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT j.*
            FROM jobs j
            JOIN workflow_runs r ON r.id = j.run_id
            WHERE r.cancel_requested_at IS NOT NULL
              AND j.cancel_requested_at IS NULL
              AND j.status IN ('queued', 'in_progress')
            ORDER BY j.created_at, j.id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn get_step(&self, id: StepId) -> DbResult<Step> {
        let record = sqlx::query_as::<_, StepRecord>("SELECT * FROM steps WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("step {}", id)))?;
        record.try_into()
    }

    async fn list_steps(&self, job_id: JobId, attempt: i32) -> DbResult<Vec<Step>> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM steps WHERE job_id = $1 AND attempt = $2 ORDER BY number",
        )
        .bind(job_id.as_uuid())
        .bind(attempt)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn insert_steps(&self, steps: &[Step]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            Self::insert_step(&mut *tx, step).await.map_err(|e| {
                duplicate_on_conflict(
                    e,
                    format!("steps for job {} attempt {}", step.job_id, step.attempt),
                )
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_step(&self, step: &Step, expected: Status) -> DbResult<Step> {
        guard_transition(EntityKind::Step, expected, step.status)?;
        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            UPDATE steps
            SET status = $2, conclusion = $3, log_ref = $4, started_at = $5, completed_at = $6,
                version = version + 1
            WHERE id = $1 AND status = $7 AND version = $8
            RETURNING *
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(opt_str(step.conclusion.map(|c| c.as_str())))
        .bind(&step.log_ref)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(expected.as_str())
        .bind(step.version)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => record.try_into(),
            None => Err(self
                .stale_or_missing("steps", *step.id.as_uuid(), expected, step.version)
                .await?),
        }
    }

    async fn enqueue(&self, entry: &QueueEntry) -> DbResult<QueueEntry> {
        Self::insert_entry(&self.pool, entry).await
    }

    async fn get_entry(&self, id: EntryId) -> DbResult<QueueEntry> {
        let record = sqlx::query_as::<_, QueueRecord>("SELECT * FROM job_queue WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("queue entry {}", id)))?;
        record.try_into()
    }

    async fn entry_for_job(&self, job_id: JobId) -> DbResult<Option<QueueEntry>> {
        let record = sqlx::query_as::<_, QueueRecord>(
            "SELECT * FROM job_queue WHERE job_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Self::queue_entry(record)
    }

    async fn peek_ready(
        &self,
        labels: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<QueueEntry>> {
        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT q.*
            FROM job_queue q
            JOIN jobs j ON j.id = q.job_id
            JOIN workflow_runs r ON r.id = q.workflow_run_id
            WHERE q.status = 'pending'
              AND q.quarantine_reason IS NULL
              AND r.cancel_requested_at IS NULL
              AND q.available_at <= $2
              AND j.required_labels <@ $1::text[]
              AND NOT EXISTS (
                  SELECT 1 FROM jobs d
                  WHERE d.id = ANY (j.needs)
                    AND NOT (d.status = 'completed' AND d.conclusion = 'success')
              )
            ORDER BY q.priority DESC, q.created_at ASC, q.id ASC
            LIMIT 1
            "#,
        )
        .bind(labels_vec(labels))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Self::queue_entry(record)
    }

    async fn claim_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Claim> {
        let mut tx = self.pool.begin().await?;

        let reserved: Option<uuid::Uuid> = sqlx::query_scalar(
            "UPDATE runners SET status = 'busy' WHERE id = $1 AND status = 'online' RETURNING id",
        )
        .bind(runner_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        if reserved.is_none() {
            tx.rollback().await?;
            return Ok(Claim::RunnerUnavailable);
        }

        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE job_queue
            SET status = 'processing', lease_holder = $2, lease_expires_at = $3
            WHERE id = $1 AND status = 'pending' AND quarantine_reason IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_uuid())
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(record) = record else {
            tx.rollback().await?;
            return Ok(Claim::EntryTaken);
        };

        tx.commit().await?;
        Ok(Claim::Leased(record.try_into()?))
    }

    async fn renew_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Option<QueueEntry>> {
        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE job_queue
            SET lease_expires_at = $3
            WHERE id = $1 AND status = 'processing' AND lease_holder = $2
              AND quarantine_reason IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_uuid())
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;
        Self::queue_entry(record)
    }

    async fn finish_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        outcome: QueueStatus,
    ) -> DbResult<Option<QueueEntry>> {
        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE job_queue
            SET status = $3, lease_expires_at = NULL
            WHERE id = $1 AND status = 'processing' AND lease_holder = $2
              AND quarantine_reason IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_uuid())
        .bind(outcome.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Self::queue_entry(record)
    }

    async fn requeue_entry(
        &self,
        id: EntryId,
        runner_id: RunnerId,
        expired_by: Option<DateTime<Utc>>,
        available_at: DateTime<Utc>,
        attempt: i32,
    ) -> DbResult<Option<QueueEntry>> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE job_queue
            SET status = 'pending', lease_holder = NULL, lease_expires_at = NULL,
                available_at = $4
            WHERE id = $1 AND status = 'processing' AND lease_holder = $2
              AND ($3::timestamptz IS NULL OR lease_expires_at <= $3)
              AND quarantine_reason IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_uuid())
        .bind(expired_by)
        .bind(available_at)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(record) = record else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET retry_count = GREATEST(retry_count, $2), runner_id = NULL,
                version = version + 1
            WHERE id = $1 AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(record.job_id)
        .bind(attempt)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        QueueEntry::try_from(record).map(Some)
    }

    async fn retire_entry(
        &self,
        id: EntryId,
        from: QueueStatus,
        outcome: QueueStatus,
    ) -> DbResult<Option<QueueEntry>> {
        let record = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE job_queue
            SET status = $3, lease_expires_at = NULL
            WHERE id = $1 AND status = $2 AND quarantine_reason IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(outcome.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Self::queue_entry(record)
    }

    async fn expired_entries(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<QueueEntry>> {
        let records = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT * FROM job_queue
            WHERE status = 'processing' AND quarantine_reason IS NULL
              AND lease_expires_at <= $1
            ORDER BY lease_expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn live_entries(&self) -> DbResult<Vec<QueueEntry>> {
        let records = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT * FROM job_queue
            WHERE status IN ('pending', 'processing')
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn quarantine_entry(&self, id: EntryId, reason: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE job_queue SET quarantine_reason = $2 WHERE id = $1 AND quarantine_reason IS NULL",
        )
        .bind(id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_heartbeat(&self, heartbeat: &RunnerHeartbeat) -> DbResult<Runner> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            INSERT INTO runners (id, name, status, kind, labels, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                labels = EXCLUDED.labels,
                last_heartbeat = GREATEST(runners.last_heartbeat, EXCLUDED.last_heartbeat),
                status = CASE WHEN runners.status = 'busy' THEN 'busy' ELSE EXCLUDED.status END
            RETURNING *
            "#,
        )
        .bind(heartbeat.runner_id.as_uuid())
        .bind(&heartbeat.name)
        .bind(heartbeat.status.as_str())
        .bind(heartbeat.kind.as_str())
        .bind(labels_vec(&heartbeat.labels))
        .bind(heartbeat.timestamp)
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get_runner(&self, id: RunnerId) -> DbResult<Runner> {
        let record = sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        record.try_into()
    }

    async fn list_runners(&self) -> DbResult<Vec<Runner>> {
        let records = sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        convert_all(records)
    }

    async fn set_runner_status(
        &self,
        id: RunnerId,
        expected: RunnerStatus,
        next: RunnerStatus,
    ) -> DbResult<Option<Runner>> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            "UPDATE runners SET status = $3 WHERE id = $1 AND status = $2 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record.map(Runner::try_from).transpose()
    }

    async fn release_runner(&self, id: RunnerId) -> DbResult<Option<Runner>> {
        let mut tx = self.pool.begin().await?;

        // Serialises against a claim for the same runner.
        sqlx::query("SELECT 1 FROM runners WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;

        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            UPDATE runners SET status = 'online'
            WHERE id = $1 AND status = 'busy'
              AND NOT EXISTS (
                  SELECT 1 FROM job_queue q
                  JOIN jobs j ON j.id = q.job_id
                  WHERE q.lease_holder = $1
                    AND (q.status = 'processing'
                         OR (q.status = 'failed' AND j.status IN ('queued', 'in_progress')))
              )
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        record.map(Runner::try_from).transpose()
    }
}
