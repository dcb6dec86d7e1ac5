//! Queue health monitoring and operator retry of failed jobs.
//!
//! The monitor only reads: queue depths from the broker, status counts and
//! timings from the ledger, and entries from the failed-job store. Stuck jobs
//! are reported, never remediated. The only writes are the explicit retry
//! operations, which re-enqueue a failed job under its original id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, EnqueueOutcome, JobEnvelope, QueueDepth};
use crate::config::QueueTable;
use crate::jobs::{FailedJob, FailedJobStore, JobId, JobLedger, JobStatus, LedgerError};

/// Alerting thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// A `processing` job older than this is stuck.
    pub stuck_after: chrono::Duration,
    /// Failures in the last hour above this make the system unhealthy.
    pub failure_threshold: u64,
    /// Total pending depth above this raises a backlog alert.
    pub pending_threshold: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stuck_after: chrono::Duration::hours(1),
            failure_threshold: 100,
            pending_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed job {0} not found")]
    FailedJobNotFound(JobId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobStats {
    pub total: u64,
    pub last_24h: u64,
    pub last_1h: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
    pub stuck: u64,
}

/// Run times in seconds of jobs completed in the last 24 hours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl PerformanceMetrics {
    pub fn from_durations(mut secs: Vec<f64>) -> Self {
        if secs.is_empty() {
            return Self::default();
        }
        secs.sort_by(f64::total_cmp);
        let n = secs.len();
        let median = if n % 2 == 0 {
            (secs[n / 2 - 1] + secs[n / 2]) / 2.0
        } else {
            secs[n / 2]
        };
        Self {
            count: n as u64,
            avg: secs.iter().sum::<f64>() / n as f64,
            min: secs[0],
            max: secs[n - 1],
            median,
        }
    }
}

/// One monitoring cycle's view of the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub queues: Vec<(String, QueueStatus)>,
    pub total_pending: u64,
    pub failed: FailedJobStats,
    pub statuses: JobStatusStats,
    pub performance: PerformanceMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "alert")]
pub enum Alert {
    StuckJobs { count: u64 },
    FailureRate { last_hour: u64, threshold: u64 },
    QueueBacklog { pending: u64, threshold: u64 },
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StuckJobs { count } => write!(f, "{count} jobs stuck in processing"),
            Self::FailureRate { last_hour, threshold } => {
                write!(f, "{last_hour} failed jobs in the last hour (threshold {threshold})")
            }
            Self::QueueBacklog { pending, threshold } => {
                write!(f, "{pending} jobs pending across queues (threshold {threshold})")
            }
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: &Alert, snapshot: &HealthSnapshot);
}

/// Alerts as error-level log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: &Alert, snapshot: &HealthSnapshot) {
        error!(
            alert = %alert,
            total_pending = snapshot.total_pending,
            stuck = snapshot.statuses.stuck,
            failed_last_hour = snapshot.failed.last_1h,
            "queue health alert"
        );
    }
}

/// Selects failed jobs for an operator retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobFilter {
    /// Only jobs that failed within this many hours.
    pub since_hours: Option<i64>,
    pub queue: Option<String>,
    pub job_type: Option<String>,
}

impl FailedJobFilter {
    pub fn since_hours(hours: Option<i64>) -> Self {
        Self {
            since_hours: hours,
            ..Default::default()
        }
    }

    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.since_hours.map(|h| now - chrono::Duration::hours(h))
    }

    pub fn matches(&self, job: &FailedJob) -> bool {
        self.queue.as_deref().is_none_or(|q| q == job.queue)
            && self.job_type.as_deref().is_none_or(|t| t == job.job_type)
    }
}

pub struct QueueHealthMonitor {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn JobLedger>,
    failed: Arc<dyn FailedJobStore>,
    queues: Arc<QueueTable>,
    config: MonitorConfig,
    sink: Arc<dyn AlertSink>,
}

impl QueueHealthMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn JobLedger>,
        failed: Arc<dyn FailedJobStore>,
        queues: Arc<QueueTable>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            broker,
            ledger,
            failed,
            queues,
            config,
            sink: Arc::new(LogAlertSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, MonitorError> {
        Ok(self.broker.depth(queue).await?)
    }

    /// Pending jobs across every configured queue.
    pub async fn total_depth(&self) -> Result<u64, MonitorError> {
        let mut total = 0;
        for name in self.queues.names() {
            total += self.broker.depth(name).await?.pending();
        }
        Ok(total)
    }

    pub async fn queue_status(&self) -> Result<Vec<(String, QueueStatus)>, MonitorError> {
        let mut statuses = Vec::new();
        for name in self.queues.names() {
            let depth = self.broker.depth(name).await?;
            statuses.push((
                name.to_string(),
                QueueStatus {
                    pending: depth.pending(),
                    processing: depth.reserved,
                },
            ));
        }
        Ok(statuses)
    }

    pub async fn failed_job_stats(&self) -> Result<FailedJobStats, MonitorError> {
        self.failed_job_stats_at(Utc::now()).await
    }

    pub async fn failed_job_stats_at(&self, now: DateTime<Utc>) -> Result<FailedJobStats, MonitorError> {
        Ok(FailedJobStats {
            total: self.failed.count_failed_since(None).await?,
            last_24h: self
                .failed
                .count_failed_since(Some(now - chrono::Duration::hours(24)))
                .await?,
            last_1h: self
                .failed
                .count_failed_since(Some(now - chrono::Duration::hours(1)))
                .await?,
        })
    }

    pub async fn job_status_stats(&self) -> Result<JobStatusStats, MonitorError> {
        self.job_status_stats_at(Utc::now()).await
    }

    pub async fn job_status_stats_at(&self, now: DateTime<Utc>) -> Result<JobStatusStats, MonitorError> {
        let counts = self.ledger.counts_by_status().await?;
        let stuck = self.ledger.stuck_jobs(now - self.config.stuck_after).await?;
        Ok(JobStatusStats {
            pending: counts.get(JobStatus::Pending),
            processing: counts.get(JobStatus::Processing),
            completed: counts.get(JobStatus::Completed),
            failed: counts.get(JobStatus::Failed),
            retrying: counts.get(JobStatus::Retrying),
            cancelled: counts.get(JobStatus::Cancelled),
            stuck: stuck.len() as u64,
        })
    }

    pub async fn performance_metrics(&self) -> Result<PerformanceMetrics, MonitorError> {
        self.performance_metrics_at(Utc::now()).await
    }

    pub async fn performance_metrics_at(&self, now: DateTime<Utc>) -> Result<PerformanceMetrics, MonitorError> {
        let completed = self
            .ledger
            .completed_since(now - chrono::Duration::hours(24))
            .await?;
        let secs = completed
            .iter()
            .filter_map(|job| job.duration())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();
        Ok(PerformanceMetrics::from_durations(secs))
    }

    /// Unhealthy when jobs are stuck or last-hour failures exceed the threshold.
    pub async fn is_healthy(&self) -> Result<bool, MonitorError> {
        let now = Utc::now();
        let statuses = self.job_status_stats_at(now).await?;
        let failed = self.failed_job_stats_at(now).await?;
        Ok(self.healthy(&statuses, &failed))
    }

    fn healthy(&self, statuses: &JobStatusStats, failed: &FailedJobStats) -> bool {
        statuses.stuck == 0 && failed.last_1h <= self.config.failure_threshold
    }

    pub async fn health_snapshot(&self) -> Result<HealthSnapshot, MonitorError> {
        self.health_snapshot_at(Utc::now()).await
    }

    pub async fn health_snapshot_at(&self, now: DateTime<Utc>) -> Result<HealthSnapshot, MonitorError> {
        let queues = self.queue_status().await?;
        let statuses = self.job_status_stats_at(now).await?;
        let failed = self.failed_job_stats_at(now).await?;
        Ok(HealthSnapshot {
            timestamp: now,
            healthy: self.healthy(&statuses, &failed),
            total_pending: queues.iter().map(|(_, s)| s.pending).sum(),
            queues,
            failed,
            statuses,
            performance: self.performance_metrics_at(now).await?,
        })
    }

    /// Alerts warranted by `snapshot`.
    pub fn alerts_for(&self, snapshot: &HealthSnapshot) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if snapshot.statuses.stuck > 0 {
            alerts.push(Alert::StuckJobs {
                count: snapshot.statuses.stuck,
            });
        }
        if snapshot.failed.last_1h > self.config.failure_threshold {
            alerts.push(Alert::FailureRate {
                last_hour: snapshot.failed.last_1h,
                threshold: self.config.failure_threshold,
            });
        }
        if snapshot.total_pending > self.config.pending_threshold {
            alerts.push(Alert::QueueBacklog {
                pending: snapshot.total_pending,
                threshold: self.config.pending_threshold,
            });
        }
        alerts
    }

    /// One monitoring cycle: log the snapshot and raise any alerts.
    pub async fn monitor_and_alert(&self) -> Result<Vec<Alert>, MonitorError> {
        self.monitor_and_alert_at(Utc::now()).await
    }

    pub async fn monitor_and_alert_at(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, MonitorError> {
        let snapshot = self.health_snapshot_at(now).await?;
        info!(
            healthy = snapshot.healthy,
            total_pending = snapshot.total_pending,
            processing = snapshot.statuses.processing,
            stuck = snapshot.statuses.stuck,
            failed_total = snapshot.failed.total,
            failed_last_24h = snapshot.failed.last_24h,
            failed_last_1h = snapshot.failed.last_1h,
            completed_24h = snapshot.performance.count,
            avg_secs = snapshot.performance.avg,
            median_secs = snapshot.performance.median,
            "queue health"
        );
        let alerts = self.alerts_for(&snapshot);
        for alert in &alerts {
            self.sink.raise(alert, &snapshot).await;
        }
        Ok(alerts)
    }

    /// Reset a failed job and put it back on its queue under the same id.
    pub async fn retry_failed_job(&self, job_id: JobId) -> Result<EnqueueOutcome, MonitorError> {
        let entry = self
            .failed
            .failed_job(job_id)
            .await?
            .ok_or(MonitorError::FailedJobNotFound(job_id))?;
        self.requeue(entry).await
    }

    pub async fn retry_all_failed_jobs(&self, since_hours: Option<i64>) -> Result<u64, MonitorError> {
        self.retry_failed_jobs(&FailedJobFilter::since_hours(since_hours)).await
    }

    /// Retry every failed job the filter selects; returns how many were re-enqueued.
    pub async fn retry_failed_jobs(&self, filter: &FailedJobFilter) -> Result<u64, MonitorError> {
        let entries = self.failed.failed_since(filter.since(Utc::now())).await?;
        let mut retried = 0;
        for entry in entries.into_iter().filter(|e| filter.matches(e)) {
            let job_id = entry.job_id;
            match self.requeue(entry).await {
                Ok(EnqueueOutcome::Enqueued(_)) => retried += 1,
                Ok(EnqueueOutcome::Duplicate(existing)) => {
                    warn!(job_id = %job_id, existing = %existing, "failed job already queued under its unique key");
                }
                Err(err) => warn!(job_id = %job_id, error = %err, "failed job retry skipped"),
            }
        }
        info!(retried, "failed jobs retried");
        Ok(retried)
    }

    /// The ledger row is reset before enqueueing so a worker that leases the
    /// job straight away finds it pending. When nothing was queued the row
    /// goes back to `failed` and the failed-job entry is kept.
    async fn requeue(&self, entry: FailedJob) -> Result<EnqueueOutcome, MonitorError> {
        let reset = match self.ledger.reset_for_retry(entry.job_id).await {
            Ok(_) => true,
            Err(LedgerError::NotFound(_)) => false,
            Err(err) => return Err(err.into()),
        };
        let envelope = JobEnvelope::new(entry.job_type.clone(), entry.queue.clone(), entry.payload.clone())
            .with_id(entry.job_id)
            .with_unique_id(entry.unique_id.clone());
        let outcome = match self.broker.enqueue(envelope, Duration::ZERO).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if reset {
                    self.restore_failed(&entry).await;
                }
                return Err(err.into());
            }
        };
        if outcome.is_enqueued() {
            self.failed.remove_failed(entry.job_id).await?;
            info!(job_id = %entry.job_id, job_type = %entry.job_type, queue = %entry.queue, "failed job re-enqueued");
        } else if reset {
            self.restore_failed(&entry).await;
        }
        Ok(outcome)
    }

    async fn restore_failed(&self, entry: &FailedJob) {
        if let Err(err) = self.ledger.mark_failed(entry.job_id, &entry.error, None).await {
            warn!(job_id = %entry.job_id, error = %err, "could not restore failed status after retry");
        }
    }
}
