//! Job status ledger and failed-job store.
//!
//! The ledger is the durable, queryable record of every job's lifecycle. The
//! broker owns delivery; the ledger owns "what happened". Writes that would
//! move a job out of a terminal state are rejected.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::types::{JobId, JobRecord, JobStatus};

/// Ledger error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("progress {0} is outside 0..=100")]
    InvalidProgress(i64),
    #[error("progress for job {job_id} cannot go from {current} back to {requested}")]
    ProgressRegression {
        job_id: JobId,
        current: u8,
        requested: u8,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Number of ledger rows per status. Every status is present, zero or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts(pub BTreeMap<JobStatus, u64>);

impl StatusCounts {
    pub fn new() -> Self {
        Self(JobStatus::ALL.into_iter().map(|s| (s, 0)).collect())
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn add(&mut self, status: JobStatus, n: u64) {
        *self.0.entry(status).or_insert(0) += n;
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl Default for StatusCounts {
    fn default() -> Self {
        Self::new()
    }
}

/// Job status ledger.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a `pending` row. Creating an id that already exists is a no-op.
    async fn create(
        &self,
        job_id: JobId,
        job_type: &str,
        queue: &str,
        payload: JsonValue,
        max_attempts: u32,
    ) -> Result<(), LedgerError>;

    async fn mark_processing(&self, job_id: JobId, attempt: u32) -> Result<(), LedgerError>;

    /// Record progress in percent; out-of-range values and regressions are errors.
    async fn update_progress(&self, job_id: JobId, percent: i64) -> Result<(), LedgerError>;

    async fn mark_completed(&self, job_id: JobId, result: Option<JsonValue>) -> Result<(), LedgerError>;

    async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
        trace: Option<&str>,
    ) -> Result<(), LedgerError>;

    async fn mark_for_retry(
        &self,
        job_id: JobId,
        delay: Duration,
        reason: Option<&str>,
    ) -> Result<(), LedgerError>;

    async fn cancel(&self, job_id: JobId) -> Result<(), LedgerError>;

    /// Unknown jobs cannot be retried.
    async fn can_retry(&self, job_id: JobId) -> Result<bool, LedgerError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, LedgerError>;

    /// Operator retry: `failed`/`cancelled` back to `pending` with attempts reset.
    async fn reset_for_retry(&self, job_id: JobId) -> Result<JobRecord, LedgerError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, LedgerError>;

    /// `processing` jobs whose current attempt started before `started_before`.
    async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError>;

    /// `completed` jobs that finished at or after `since`.
    async fn completed_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError>;
}

/// A job that exhausted its attempts (or could not be built at all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: String,
    pub payload: JsonValue,
    pub unique_id: Option<String>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable list of failed jobs, used for operator inspection and retry.
#[async_trait]
pub trait FailedJobStore: Send + Sync {
    /// Recording the same job twice replaces the earlier entry.
    async fn record_failure(&self, entry: FailedJob) -> Result<(), LedgerError>;

    async fn failed_job(&self, job_id: JobId) -> Result<Option<FailedJob>, LedgerError>;

    /// Entries newest first; `None` lists everything.
    async fn failed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<FailedJob>, LedgerError>;

    async fn count_failed_since(&self, since: Option<DateTime<Utc>>) -> Result<u64, LedgerError>;

    /// Returns whether an entry was removed.
    async fn remove_failed(&self, job_id: JobId) -> Result<bool, LedgerError>;
}

/// In-memory ledger and failed-job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    failed: RwLock<HashMap<JobId, FailedJob>>,
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Storage("ledger lock poisoned".to_string())
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn modify<F>(&self, job_id: JobId, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut JobRecord, DateTime<Utc>) -> Result<(), LedgerError>,
    {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let record = jobs.get_mut(&job_id).ok_or(LedgerError::NotFound(job_id))?;
        f(record, Utc::now())
    }
}

#[async_trait]
impl JobLedger for InMemoryJobLedger {
    async fn create(
        &self,
        job_id: JobId,
        job_type: &str,
        queue: &str,
        payload: JsonValue,
        max_attempts: u32,
    ) -> Result<(), LedgerError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.entry(job_id).or_insert_with(|| {
            JobRecord::new(job_id, job_type, queue, payload, max_attempts, Utc::now())
        });
        Ok(())
    }

    async fn mark_processing(&self, job_id: JobId, attempt: u32) -> Result<(), LedgerError> {
        self.modify(job_id, |job, now| job.start(attempt, now))
    }

    async fn update_progress(&self, job_id: JobId, percent: i64) -> Result<(), LedgerError> {
        self.modify(job_id, |job, now| job.set_progress(percent, now))
    }

    async fn mark_completed(&self, job_id: JobId, result: Option<JsonValue>) -> Result<(), LedgerError> {
        self.modify(job_id, |job, now| job.complete(result, now))
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
        trace: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.modify(job_id, |job, now| job.fail(message, trace.map(str::to_string), now))
    }

    async fn mark_for_retry(
        &self,
        job_id: JobId,
        delay: Duration,
        reason: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.modify(job_id, |job, now| {
            job.schedule_retry(delay, reason.map(str::to_string), now)
        })
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), LedgerError> {
        self.modify(job_id, |job, now| job.cancel(now))
    }

    async fn can_retry(&self, job_id: JobId) -> Result<bool, LedgerError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).is_some_and(JobRecord::can_retry))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, LedgerError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn reset_for_retry(&self, job_id: JobId) -> Result<JobRecord, LedgerError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let record = jobs.get_mut(&job_id).ok_or(LedgerError::NotFound(job_id))?;
        record.reset_for_retry(Utc::now())?;
        Ok(record.clone())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, LedgerError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut counts = StatusCounts::new();
        for job in jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stuck: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|started| started < started_before)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.started_at);
        Ok(stuck)
    }

    async fn completed_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut done: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Completed && j.finished_at.is_some_and(|at| at >= since)
            })
            .cloned()
            .collect();
        done.sort_by_key(|j| j.finished_at);
        Ok(done)
    }
}

#[async_trait]
impl FailedJobStore for InMemoryJobLedger {
    async fn record_failure(&self, entry: FailedJob) -> Result<(), LedgerError> {
        let mut failed = self.failed.write().map_err(poisoned)?;
        failed.insert(entry.job_id, entry);
        Ok(())
    }

    async fn failed_job(&self, job_id: JobId) -> Result<Option<FailedJob>, LedgerError> {
        let failed = self.failed.read().map_err(poisoned)?;
        Ok(failed.get(&job_id).cloned())
    }

    async fn failed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<FailedJob>, LedgerError> {
        let failed = self.failed.read().map_err(poisoned)?;
        let mut entries: Vec<_> = failed
            .values()
            .filter(|f| since.is_none_or(|since| f.failed_at >= since))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(entries)
    }

    async fn count_failed_since(&self, since: Option<DateTime<Utc>>) -> Result<u64, LedgerError> {
        let failed = self.failed.read().map_err(poisoned)?;
        Ok(failed
            .values()
            .filter(|f| since.is_none_or(|since| f.failed_at >= since))
            .count() as u64)
    }

    async fn remove_failed(&self, job_id: JobId) -> Result<bool, LedgerError> {
        let mut failed = self.failed.write().map_err(poisoned)?;
        Ok(failed.remove(&job_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_is_idempotent() {
        let ledger = InMemoryJobLedger::new();
        let id = JobId::new();
        ledger.create(id, "a", "default", json!({"n": 1}), 3).await.unwrap();
        ledger.mark_processing(id, 1).await.unwrap();
        ledger.create(id, "a", "default", json!({"n": 2}), 5).await.unwrap();

        let record = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.payload, json!({"n": 1}));
        assert_eq!(record.max_attempts, 3);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found_and_not_retryable() {
        let ledger = InMemoryJobLedger::new();
        let id = JobId::new();
        assert_eq!(ledger.mark_processing(id, 1).await, Err(LedgerError::NotFound(id)));
        assert!(!ledger.can_retry(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_job_rejects_completion() {
        let ledger = InMemoryJobLedger::new();
        let id = JobId::new();
        ledger.create(id, "a", "default", json!({}), 3).await.unwrap();
        ledger.cancel(id).await.unwrap();

        let err = ledger.mark_completed(id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { to: JobStatus::Completed, .. }));
        assert!(!ledger.can_retry(id).await.unwrap());
    }

    #[tokio::test]
    async fn counts_include_every_status() {
        let ledger = InMemoryJobLedger::new();
        let a = JobId::new();
        let b = JobId::new();
        ledger.create(a, "a", "default", json!({}), 3).await.unwrap();
        ledger.create(b, "a", "default", json!({}), 3).await.unwrap();
        ledger.mark_processing(b, 1).await.unwrap();
        ledger.mark_completed(b, None).await.unwrap();

        let counts = ledger.counts_by_status().await.unwrap();
        assert_eq!(counts.get(JobStatus::Pending), 1);
        assert_eq!(counts.get(JobStatus::Completed), 1);
        assert_eq!(counts.get(JobStatus::Failed), 0);
        assert_eq!(counts.0.len(), JobStatus::ALL.len());
    }

    #[tokio::test]
    async fn stuck_jobs_only_lists_old_processing_rows() {
        let ledger = InMemoryJobLedger::new();
        let id = JobId::new();
        ledger.create(id, "a", "default", json!({}), 3).await.unwrap();
        ledger.mark_processing(id, 1).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(ledger.stuck_jobs(past).await.unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(ledger.stuck_jobs(future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_entries_filter_by_time_and_remove() {
        let ledger = InMemoryJobLedger::new();
        let now = Utc::now();
        for hours in [0, 2, 30] {
            ledger
                .record_failure(FailedJob {
                    job_id: JobId::new(),
                    job_type: "a".into(),
                    queue: "default".into(),
                    payload: json!({}),
                    unique_id: None,
                    error: "boom".into(),
                    failed_at: now - chrono::Duration::hours(hours),
                })
                .await
                .unwrap();
        }

        assert_eq!(ledger.count_failed_since(None).await.unwrap(), 3);
        let last_day = ledger
            .failed_since(Some(now - chrono::Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(last_day.len(), 2);
        assert!(last_day[0].failed_at >= last_day[1].failed_at);

        assert!(ledger.remove_failed(last_day[0].job_id).await.unwrap());
        assert!(!ledger.remove_failed(last_day[0].job_id).await.unwrap());
        assert_eq!(ledger.count_failed_since(None).await.unwrap(), 2);
    }
}
