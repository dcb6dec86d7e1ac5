//! Postgres-backed job ledger and failed-job store.
//!
//! Transitions run inside a transaction: the row is locked with
//! `SELECT ... FOR UPDATE`, the transition is applied with the same
//! `JobRecord` rules the in-memory ledger uses, and the row is written back.
//! Concurrent writers to one job therefore serialize on the row lock.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LedgerError |
//! |------------|-------------|
//! | Database (any code) | `Storage` with the database message |
//! | PoolClosed | `Storage` |
//! | Decode / ColumnNotFound | `Storage` (schema drift) |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use super::ledger::{FailedJob, FailedJobStore, JobLedger, LedgerError, StatusCounts};
use super::types::{JobId, JobRecord, JobStatus};

const JOB_COLUMNS: &str = "job_id, job_type, queue, status, payload, result, error_message, error_trace, \
     attempts, max_attempts, progress, started_at, finished_at, next_retry_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobLedger {
    pool: Arc<PgPool>,
}

impl PostgresJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<JobRecord, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_statuses WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or(LedgerError::NotFound(job_id))?;

        JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_job", e))?
            .try_into()
    }

    async fn write_row(tx: &mut Transaction<'_, Postgres>, job: &JobRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE job_statuses SET
                status = $2,
                result = $3,
                error_message = $4,
                error_trace = $5,
                attempts = $6,
                progress = $7,
                started_at = $8,
                finished_at = $9,
                next_retry_at = $10,
                updated_at = $11
            WHERE job_id = $1
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.error_trace)
        .bind(job.attempts as i32)
        .bind(i16::from(job.progress))
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.next_retry_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_job", e))?;
        Ok(())
    }

    /// Lock, transition, write back, commit.
    async fn transition<F>(&self, job_id: JobId, f: F) -> Result<JobRecord, LedgerError>
    where
        F: FnOnce(&mut JobRecord, DateTime<Utc>) -> Result<(), LedgerError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        let mut job = Self::lock_row(&mut tx, job_id).await?;
        f(&mut job, Utc::now())?;
        Self::write_row(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(job)
    }

    async fn fetch_jobs(&self, operation: &str, sql: &str, at: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let rows = sqlx::query(sql)
            .bind(at)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|row| -> Result<JobRecord, LedgerError> {
                JobRow::from_row(row)
                    .map_err(|e| map_sqlx_error(operation, e))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait]
impl JobLedger for PostgresJobLedger {
    #[instrument(skip(self, payload), fields(job_id = %job_id), err)]
    async fn create(
        &self,
        job_id: JobId,
        job_type: &str,
        queue: &str,
        payload: JsonValue,
        max_attempts: u32,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO job_statuses
                (job_id, job_type, queue, status, payload, attempts, max_attempts, progress, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, 0, $5, 0, now(), now())
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job_type)
        .bind(queue)
        .bind(payload)
        .bind(max_attempts as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;
        Ok(())
    }

    async fn mark_processing(&self, job_id: JobId, attempt: u32) -> Result<(), LedgerError> {
        self.transition(job_id, |job, now| job.start(attempt, now)).await.map(drop)
    }

    async fn update_progress(&self, job_id: JobId, percent: i64) -> Result<(), LedgerError> {
        if !(0..=100).contains(&percent) {
            return Err(LedgerError::InvalidProgress(percent));
        }
        self.transition(job_id, |job, now| job.set_progress(percent, now)).await.map(drop)
    }

    async fn mark_completed(&self, job_id: JobId, result: Option<JsonValue>) -> Result<(), LedgerError> {
        self.transition(job_id, |job, now| job.complete(result, now)).await.map(drop)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
        trace: Option<&str>,
    ) -> Result<(), LedgerError> {
        let trace = trace.map(str::to_string);
        self.transition(job_id, |job, now| job.fail(message, trace, now)).await.map(drop)
    }

    async fn mark_for_retry(
        &self,
        job_id: JobId,
        delay: Duration,
        reason: Option<&str>,
    ) -> Result<(), LedgerError> {
        let reason = reason.map(str::to_string);
        self.transition(job_id, |job, now| job.schedule_retry(delay, reason, now))
            .await
            .map(drop)
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), LedgerError> {
        self.transition(job_id, |job, now| job.cancel(now)).await.map(drop)
    }

    async fn can_retry(&self, job_id: JobId) -> Result<bool, LedgerError> {
        Ok(self.get(job_id).await?.is_some_and(|job| job.can_retry()))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job_statuses WHERE job_id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        match row {
            Some(row) => Ok(Some(
                JobRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("get_job", e))?
                    .try_into()?,
            )),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn reset_for_retry(&self, job_id: JobId) -> Result<JobRecord, LedgerError> {
        self.transition(job_id, |job, now| job.reset_for_retry(now)).await
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, LedgerError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_statuses GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts_by_status", e))?;

        let mut counts = StatusCounts::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts_by_status", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts_by_status", e))?;
            counts.add(status.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_statuses \
             WHERE status = 'processing' AND started_at < $1 ORDER BY started_at ASC"
        );
        self.fetch_jobs("stuck_jobs", &sql, started_before).await
    }

    async fn completed_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_statuses \
             WHERE status = 'completed' AND finished_at >= $1 ORDER BY finished_at ASC"
        );
        self.fetch_jobs("completed_since", &sql, since).await
    }
}

#[async_trait]
impl FailedJobStore for PostgresJobLedger {
    async fn record_failure(&self, entry: FailedJob) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO failed_jobs (job_id, job_type, queue, payload, unique_id, error, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO UPDATE SET
                error = EXCLUDED.error,
                payload = EXCLUDED.payload,
                failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(entry.job_id.as_uuid())
        .bind(&entry.job_type)
        .bind(&entry.queue)
        .bind(&entry.payload)
        .bind(&entry.unique_id)
        .bind(&entry.error)
        .bind(entry.failed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(())
    }

    async fn failed_job(&self, job_id: JobId) -> Result<Option<FailedJob>, LedgerError> {
        let row = sqlx::query(
            "SELECT job_id, job_type, queue, payload, unique_id, error, failed_at FROM failed_jobs WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("failed_job", e))?;
        row.map(|row| failed_from_row(&row)).transpose()
    }

    async fn failed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<FailedJob>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, job_type, queue, payload, unique_id, error, failed_at
            FROM failed_jobs
            WHERE $1::timestamptz IS NULL OR failed_at >= $1
            ORDER BY failed_at DESC
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("failed_since", e))?;
        rows.iter().map(failed_from_row).collect()
    }

    async fn count_failed_since(&self, since: Option<DateTime<Utc>>) -> Result<u64, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM failed_jobs WHERE $1::timestamptz IS NULL OR failed_at >= $1",
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_failed_since", e))?;
        let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_failed_since", e))?;
        Ok(n.max(0) as u64)
    }

    async fn remove_failed(&self, job_id: JobId) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM failed_jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_failed", e))?;
        Ok(result.rows_affected() > 0)
    }
}

fn failed_from_row(row: &PgRow) -> Result<FailedJob, LedgerError> {
    let decode = |e| map_sqlx_error("decode_failed_job", e);
    Ok(FailedJob {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        queue: row.try_get("queue").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        unique_id: row.try_get("unique_id").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        failed_at: row.try_get("failed_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {}", operation))
        }
        other => LedgerError::Storage(format!("{} failed: {}", operation, other)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    job_id: uuid::Uuid,
    job_type: String,
    queue: String,
    status: String,
    payload: JsonValue,
    result: Option<JsonValue>,
    error_message: Option<String>,
    error_trace: Option<String>,
    attempts: i32,
    max_attempts: i32,
    progress: i16,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            queue: row.try_get("queue")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            error_trace: row.try_get("error_trace")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            progress: row.try_get("progress")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = LedgerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            job_id: JobId::from_uuid(row.job_id),
            job_type: row.job_type,
            queue: row.queue,
            status: row.status.parse::<JobStatus>()?,
            payload: row.payload,
            result: row.result,
            error_message: row.error_message,
            error_trace: row.error_trace,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            progress: row.progress.clamp(0, 100) as u8,
            started_at: row.started_at,
            finished_at: row.finished_at,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
