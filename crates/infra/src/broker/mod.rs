//! Queue broker: named queues with delayed delivery, leases with a
//! visibility timeout, and unique-key deduplication.
//!
//! ## Semantics
//!
//! - `enqueue` with a `unique_id` that is already held returns `Duplicate`;
//!   the key is held until the job is acknowledged
//! - `lease` increments the attempt counter and hides the job for the
//!   queue's `retry_after`; an unacknowledged lease becomes leasable again
//! - `release` puts a leased job back with a delay; a `Yield` release gives
//!   the attempt back

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::jobs::{Job, JobId};

pub use in_memory::{InMemoryBroker, QueuedJob};
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// What the broker carries for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub job_type: String,
    pub queue: String,
    pub payload: JsonValue,
    pub unique_id: Option<String>,
    /// Resume state written by the last yield.
    pub checkpoint: Option<JsonValue>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(job_type: impl Into<String>, queue: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            queue: queue.into(),
            payload,
            unique_id: None,
            checkpoint: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn for_job(job: &dyn Job) -> Self {
        Self::new(job.job_type(), job.queue(), job.payload()).with_unique_id(job.unique_id())
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_unique_id(mut self, unique_id: Option<String>) -> Self {
        self.unique_id = unique_id;
        self
    }
}

/// A leased job. `attempt` is 1 on first delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub envelope: JobEnvelope,
    pub attempt: u32,
    pub leased_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// The attempt failed and counts.
    Retry,
    /// The job gave its worker back voluntarily; the attempt does not count.
    Yield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(JobId),
    /// A job holding the same unique key is already queued or running.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

/// Jobs held by one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Leasable now
    pub ready: u64,
    /// Waiting for their delay to pass
    pub delayed: u64,
    /// Leased and not yet acknowledged
    pub reserved: u64,
}

impl QueueDepth {
    /// Jobs not yet handed to a worker.
    pub fn pending(&self) -> u64 {
        self.ready + self.delayed
    }

    pub fn total(&self) -> u64 {
        self.ready + self.delayed + self.reserved
    }
}

/// Broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("broker command failed: {0}")]
    Command(String),
    #[error("envelope serialization failed: {0}")]
    Serialization(String),
    #[error("broker state unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, envelope: JobEnvelope, delay: Duration) -> Result<EnqueueOutcome, BrokerError>;

    /// Lease the next ready job on `queue`, if any.
    async fn lease(&self, queue: &str) -> Result<Option<Lease>, BrokerError>;

    /// Remove a leased job for good and free its unique key.
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Put a leased job back after `delay`. A `Some` checkpoint replaces the envelope's.
    async fn release(
        &self,
        lease: &Lease,
        delay: Duration,
        kind: ReleaseKind,
        checkpoint: Option<JsonValue>,
    ) -> Result<(), BrokerError>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth, BrokerError>;
}

/// Enqueue `job` on its own queue.
pub async fn dispatch(broker: &dyn Broker, job: &dyn Job, delay: Duration) -> Result<EnqueueOutcome, BrokerError> {
    broker.enqueue(JobEnvelope::for_job(job), delay).await
}
