//! Per-attempt execution context handed to every job.
//!
//! Ledger writes made through the context never fail the job: errors are
//! logged as warnings and the job keeps running.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use super::ledger::JobLedger;
use super::types::JobId;

pub struct JobExecutionContext {
    ledger: Arc<dyn JobLedger>,
    job_id: JobId,
    job_type: String,
    queue: String,
    payload: JsonValue,
    checkpoint: Option<JsonValue>,
    attempt: u32,
    max_attempts: u32,
    progress: AtomicU8,
    started: Instant,
}

impl std::fmt::Debug for JobExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl JobExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        job_id: JobId,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        payload: JsonValue,
        checkpoint: Option<JsonValue>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger,
            job_id,
            job_type: job_type.into(),
            queue: queue.into(),
            payload,
            checkpoint,
            attempt,
            max_attempts,
            progress: AtomicU8::new(0),
            started: Instant::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// State saved by the previous yield of this job, if any.
    pub fn checkpoint(&self) -> Option<&JsonValue> {
        self.checkpoint.as_ref()
    }

    /// 1-indexed attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Ensure a ledger row exists and mark this attempt as processing.
    pub async fn start(&self) {
        if let Err(err) = self
            .ledger
            .create(
                self.job_id,
                &self.job_type,
                &self.queue,
                self.payload.clone(),
                self.max_attempts,
            )
            .await
        {
            warn!(job_id = %self.job_id, error = %err, "failed to create job ledger row");
        }
        if let Err(err) = self.ledger.mark_processing(self.job_id, self.attempt).await {
            warn!(job_id = %self.job_id, error = %err, "failed to mark job processing");
        }
        info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            queue = %self.queue,
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            "job started"
        );
    }

    /// Report progress in percent. Values outside 0..=100 are clamped; a value
    /// below the last reported one is ignored.
    pub async fn update_progress(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.progress.fetch_max(percent, Ordering::SeqCst);
        if percent < previous {
            debug!(job_id = %self.job_id, previous, requested = percent, "ignoring progress regression");
            return;
        }
        if percent == previous && previous != 0 {
            return;
        }
        if let Err(err) = self.ledger.update_progress(self.job_id, i64::from(percent)).await {
            warn!(job_id = %self.job_id, progress = percent, error = %err, "failed to record job progress");
        }
    }

    pub async fn complete(&self, result: Option<JsonValue>) {
        self.progress.store(100, Ordering::SeqCst);
        if let Err(err) = self.ledger.mark_completed(self.job_id, result).await {
            warn!(job_id = %self.job_id, error = %err, "failed to mark job completed");
        }
        info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            duration_ms = self.elapsed().as_millis() as u64,
            "job completed"
        );
    }

    pub async fn fail(&self, message: &str, trace: Option<&str>) {
        if let Err(err) = self.ledger.mark_failed(self.job_id, message, trace).await {
            warn!(job_id = %self.job_id, error = %err, "failed to mark job failed");
        }
        error!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            queue = %self.queue,
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            error = message,
            "job failed permanently"
        );
    }

    pub async fn retry(&self, delay: Duration, reason: Option<&str>) {
        if let Err(err) = self.ledger.mark_for_retry(self.job_id, delay, reason).await {
            warn!(job_id = %self.job_id, error = %err, "failed to mark job for retry");
        }
        info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            delay_secs = delay.as_secs(),
            reason = reason.unwrap_or(""),
            "job released for retry"
        );
    }
}
