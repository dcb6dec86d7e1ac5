//! Core job types: identifiers, ledger records and backoff schedules.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::ledger::LedgerError;

/// Unique job identifier. Shared by the broker envelope and the ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// Ledger status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Known to the ledger, not started yet
    Pending,
    /// An attempt is running
    Processing,
    /// Finished successfully (or skipped)
    Completed,
    /// Exhausted its attempts
    Failed,
    /// Released back to the broker with a delay
    Retrying,
    /// Cancelled by an operator
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LedgerError::Storage(format!("unknown job status: {s}")))
    }
}

/// Per-job retry delays. Attempt `n` (1-indexed) waits `delays[n - 1]`,
/// clamped to the last entry once the list runs out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule(Vec<Duration>);

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self(delays)
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Fixed delay for every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self(vec![delay])
    }

    pub fn delays(&self) -> &[Duration] {
        &self.0
    }

    /// Delay before retrying after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.0.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.max(1) as usize - 1).min(self.0.len() - 1);
        self.0[idx]
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(60))
    }
}

/// One ledger row per job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: String,
    pub status: JobStatus,
    pub payload: JsonValue,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// 0..=100, never decreases within one attempt
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        payload: JsonValue,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            queue: queue.into(),
            status: JobStatus::Pending,
            payload,
            result: None,
            error_message: None,
            error_trace: None,
            attempts: 0,
            max_attempts,
            progress: 0,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn reject(&self, target: JobStatus) -> LedgerError {
        LedgerError::InvalidTransition {
            job_id: self.job_id,
            from: self.status,
            to: target,
        }
    }

    /// Begin attempt `attempt`. Progress resets for the new attempt.
    pub fn start(&mut self, attempt: u32, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status.is_terminal() {
            return Err(self.reject(JobStatus::Processing));
        }
        self.status = JobStatus::Processing;
        self.attempts = attempt;
        self.progress = 0;
        self.started_at = Some(now);
        self.finished_at = None;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_progress(&mut self, percent: i64, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let percent = u8::try_from(percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(LedgerError::InvalidProgress(percent))?;
        if self.status != JobStatus::Processing {
            return Err(self.reject(JobStatus::Processing));
        }
        if percent < self.progress {
            return Err(LedgerError::ProgressRegression {
                job_id: self.job_id,
                current: self.progress,
                requested: percent,
            });
        }
        self.progress = percent;
        self.updated_at = now;
        Ok(())
    }

    /// Completing an already completed job is a no-op.
    pub fn complete(&mut self, result: Option<JsonValue>, now: DateTime<Utc>) -> Result<(), LedgerError> {
        match self.status {
            JobStatus::Completed => return Ok(()),
            JobStatus::Failed | JobStatus::Cancelled => return Err(self.reject(JobStatus::Completed)),
            _ => {}
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = result;
        self.finished_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Failing an already failed job is a no-op.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        trace: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        match self.status {
            JobStatus::Failed => return Ok(()),
            JobStatus::Completed | JobStatus::Cancelled => return Err(self.reject(JobStatus::Failed)),
            _ => {}
        }
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.error_trace = trace;
        self.finished_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        delay: Duration,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.status.is_terminal() {
            return Err(self.reject(JobStatus::Retrying));
        }
        self.status = JobStatus::Retrying;
        if reason.is_some() {
            self.error_message = reason;
        }
        self.next_retry_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        self.updated_at = now;
        Ok(())
    }

    /// Cancelling twice is a no-op; finished jobs cannot be cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        match self.status {
            JobStatus::Cancelled => return Ok(()),
            JobStatus::Completed | JobStatus::Failed => return Err(self.reject(JobStatus::Cancelled)),
            _ => {}
        }
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Operator retry: a failed or cancelled job goes back to `pending` with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if !matches!(self.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(self.reject(JobStatus::Pending));
        }
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.progress = 0;
        self.result = None;
        self.error_message = None;
        self.error_trace = None;
        self.started_at = None;
        self.finished_at = None;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        !matches!(self.status, JobStatus::Completed | JobStatus::Cancelled)
            && self.attempts < self.max_attempts
    }

    /// Wall-clock time of the last attempt, once it finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) if finished >= started => Some(finished - started),
            _ => None,
        }
    }
}
