//! `JobService`: the operations other layers call into.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use taskpulse_core::DomainError;
use taskpulse_infra::broker::{Broker, BrokerError, dispatch};
use taskpulse_infra::jobs::{ChunkedExecutor, JobId, JobLedger, JobRecord, LedgerError};
use taskpulse_infra::monitor::{FailedJobFilter, MonitorError, QueueHealthMonitor};
use taskpulse_infra::reminders::{
    DispatchSummary, EngineError, ReminderBackfillProcessor, ReminderRuleEngine, ReminderStore,
};
use taskpulse_reminders::ReminderRule;

/// Which failed jobs an operator retry touches.
pub type RetryFilter = FailedJobFilter;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        ServiceError::Engine(err.into())
    }
}

/// Collaborators of the default-rule backfill job.
#[derive(Clone)]
pub struct BackfillDeps {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ReminderStore>,
    pub executor: Arc<ChunkedExecutor>,
}

#[derive(Clone)]
pub struct JobService {
    engine: Arc<ReminderRuleEngine>,
    ledger: Arc<dyn JobLedger>,
    monitor: Arc<QueueHealthMonitor>,
    backfill: BackfillDeps,
}

impl JobService {
    pub fn new(
        engine: Arc<ReminderRuleEngine>,
        ledger: Arc<dyn JobLedger>,
        monitor: Arc<QueueHealthMonitor>,
        backfill: BackfillDeps,
    ) -> Self {
        Self {
            engine,
            ledger,
            monitor,
            backfill,
        }
    }

    /// Enqueue a delivery for `rule`. When a delivery with the same
    /// idempotency key is already queued, its id is returned instead.
    pub async fn enqueue_delivery(&self, rule: &ReminderRule) -> Result<JobId, ServiceError> {
        if !rule.enabled {
            return Err(DomainError::validation(format!("rule {} is disabled", rule.id)).into());
        }
        let outcome = self.engine.enqueue_delivery(rule).await?;
        info!(rule_id = %rule.id, job_id = %outcome.job_id(), enqueued = outcome.is_enqueued(), "delivery requested");
        Ok(outcome.job_id())
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<Option<JobRecord>, ServiceError> {
        Ok(self.ledger.get(job_id).await?)
    }

    /// Re-enqueue failed jobs selected by `filter`; returns how many were queued.
    pub async fn retry_failed_jobs(&self, filter: &RetryFilter) -> Result<u64, ServiceError> {
        Ok(self.monitor.retry_failed_jobs(filter).await?)
    }

    pub async fn dispatch_due_notifications(&self, dry_run: bool) -> Result<DispatchSummary, ServiceError> {
        Ok(self.engine.dispatch_due_notifications(dry_run).await?)
    }

    /// Queue the default-rule backfill on the heavy queue. Only one backfill
    /// is queued at a time; a second request returns the queued job's id.
    pub async fn enqueue_backfill(&self) -> Result<JobId, ServiceError> {
        let BackfillDeps { broker, store, executor } = &self.backfill;
        let job = ReminderBackfillProcessor::job(store.clone(), executor.clone());
        let outcome = dispatch(broker.as_ref(), &job, Duration::ZERO).await?;
        info!(job_id = %outcome.job_id(), enqueued = outcome.is_enqueued(), "reminder backfill requested");
        Ok(outcome.job_id())
    }
}
