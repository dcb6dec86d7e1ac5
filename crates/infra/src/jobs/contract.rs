//! The contract every background job implements.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::context::JobExecutionContext;
use super::types::BackoffSchedule;

/// Why an attempt did not succeed. Any error counts as a failed attempt and
/// goes through the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("no job registered for type {0}")]
    UnknownJobType(String),
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Dependency(Box<dyn std::error::Error + Send + Sync>),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn dependency(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Dependency(Box::new(err))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

/// What a successful `execute` asks the worker to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Done. The value is stored as the ledger result.
    Completed(Option<JsonValue>),
    /// Nothing to do (target gone, rule disabled, already sent). Not a failure.
    Skipped(String),
    /// Give the worker back and resume later from `checkpoint`. Does not use up an attempt.
    Yield {
        delay: Duration,
        checkpoint: Option<JsonValue>,
        reason: String,
    },
}

/// A unit of background work. Implementations are built from a broker
/// envelope by the job registry and executed once per attempt.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn job_type(&self) -> &'static str;

    fn queue(&self) -> &str;

    /// Serialized form carried by the broker envelope.
    fn payload(&self) -> JsonValue;

    fn backoff_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::default()
    }

    /// Deduplication key. While a job with this key is queued or running, an
    /// enqueue with the same key is a no-op.
    fn unique_id(&self) -> Option<String> {
        None
    }

    /// Overrides the queue's attempt limit.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Overrides the queue's per-attempt timeout (never above it).
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutcome, JobError>;
}
