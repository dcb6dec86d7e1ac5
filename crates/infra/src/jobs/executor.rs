//! Job runner and worker pool.
//!
//! The runner takes one lease through the whole lifecycle: build the job from
//! its envelope, run it under the queue's timeout with panics caught, then
//! acknowledge, release for retry, or record a permanent failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::context::JobExecutionContext;
use super::contract::{Job, JobError, JobOutcome};
use super::ledger::{FailedJob, FailedJobStore, JobLedger};
use super::types::JobStatus;
use crate::broker::{Broker, BrokerError, JobEnvelope, Lease, ReleaseKind};
use crate::config::QueueTable;

/// Builds a job from its envelope.
pub type JobFactory = Arc<dyn Fn(&JobEnvelope) -> Result<Arc<dyn Job>, JobError> + Send + Sync>;

/// Job type -> factory.
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: impl Into<String>, factory: F)
    where
        F: Fn(&JobEnvelope) -> Result<Arc<dyn Job>, JobError> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.into(), Arc::new(factory));
    }

    pub fn build(&self, envelope: &JobEnvelope) -> Result<Arc<dyn Job>, JobError> {
        let factory = self
            .factories
            .get(&envelope.job_type)
            .ok_or_else(|| JobError::UnknownJobType(envelope.job_type.clone()))?;
        factory(envelope)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// What happened to one lease.
#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    Completed,
    Skipped(String),
    Yielded { delay: Duration },
    Retrying { attempt: u32, delay: Duration },
    Failed { attempt: u32, error: String },
    /// The ledger says the job was cancelled; it was dropped without running.
    Cancelled,
}

/// Runs leased jobs against the registry.
pub struct JobRunner {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn JobLedger>,
    failed: Arc<dyn FailedJobStore>,
    registry: Arc<JobRegistry>,
    queues: Arc<QueueTable>,
}

impl JobRunner {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn JobLedger>,
        failed: Arc<dyn FailedJobStore>,
        registry: Arc<JobRegistry>,
        queues: Arc<QueueTable>,
    ) -> Self {
        Self {
            broker,
            ledger,
            failed,
            registry,
            queues,
        }
    }

    /// Lease and run the next ready job on `queue`.
    pub async fn run_next(&self, queue: &str) -> Result<Option<RunReport>, BrokerError> {
        match self.broker.lease(queue).await? {
            Some(lease) => Ok(Some(self.run(lease).await)),
            None => Ok(None),
        }
    }

    pub async fn run(&self, lease: Lease) -> RunReport {
        let envelope = &lease.envelope;
        let queue = self.queues.get(&envelope.queue);

        if let Ok(Some(record)) = self.ledger.get(envelope.id).await {
            if record.status == JobStatus::Cancelled {
                info!(job_id = %envelope.id, job_type = %envelope.job_type, "skipping cancelled job");
                self.ack(&lease).await;
                return RunReport::Cancelled;
            }
        }

        let job = match self.registry.build(envelope) {
            Ok(job) => job,
            Err(err) => {
                // Without a job there is no retry policy; this cannot succeed later.
                let ctx = self.context(&lease, queue.max_attempts);
                ctx.start().await;
                return self.fail_permanently(&lease, &ctx, &err).await;
            }
        };

        let max_attempts = job.max_attempts().unwrap_or(queue.max_attempts).max(1);
        let timeout = job
            .timeout()
            .map_or(queue.timeout, |t| t.min(queue.timeout));
        let ctx = Arc::new(self.context(&lease, max_attempts));
        ctx.start().await;

        match execute_guarded(job.clone(), ctx.clone(), timeout).await {
            Ok(JobOutcome::Completed(result)) => {
                ctx.complete(result).await;
                self.ack(&lease).await;
                RunReport::Completed
            }
            Ok(JobOutcome::Skipped(reason)) => {
                info!(job_id = %envelope.id, job_type = %envelope.job_type, reason = %reason, "job skipped");
                ctx.complete(Some(json!({ "skipped": reason }))).await;
                self.ack(&lease).await;
                RunReport::Skipped(reason)
            }
            Ok(JobOutcome::Yield {
                delay,
                checkpoint,
                reason,
            }) => {
                ctx.retry(delay, Some(&reason)).await;
                self.release(&lease, delay, ReleaseKind::Yield, checkpoint).await;
                RunReport::Yielded { delay }
            }
            Err(err) => {
                error!(
                    job_id = %envelope.id,
                    job_type = %envelope.job_type,
                    queue = %envelope.queue,
                    attempt = lease.attempt,
                    max_attempts,
                    error = %err,
                    "job attempt failed"
                );
                if lease.attempt < max_attempts {
                    let delay = job.backoff_schedule().delay_for_attempt(lease.attempt);
                    ctx.retry(delay, Some(&err.to_string())).await;
                    self.release(&lease, delay, ReleaseKind::Retry, None).await;
                    RunReport::Retrying {
                        attempt: lease.attempt,
                        delay,
                    }
                } else {
                    self.fail_permanently(&lease, &ctx, &err).await
                }
            }
        }
    }

    fn context(&self, lease: &Lease, max_attempts: u32) -> JobExecutionContext {
        let envelope = &lease.envelope;
        JobExecutionContext::new(
            self.ledger.clone(),
            envelope.id,
            envelope.job_type.clone(),
            envelope.queue.clone(),
            envelope.payload.clone(),
            envelope.checkpoint.clone(),
            lease.attempt,
            max_attempts,
        )
    }

    async fn fail_permanently(&self, lease: &Lease, ctx: &JobExecutionContext, err: &JobError) -> RunReport {
        let message = err.to_string();
        ctx.fail(&message, Some(&format!("{err:?}"))).await;

        let envelope = &lease.envelope;
        let entry = FailedJob {
            job_id: envelope.id,
            job_type: envelope.job_type.clone(),
            queue: envelope.queue.clone(),
            payload: envelope.payload.clone(),
            unique_id: envelope.unique_id.clone(),
            error: message.clone(),
            failed_at: Utc::now(),
        };
        if let Err(store_err) = self.failed.record_failure(entry).await {
            warn!(job_id = %envelope.id, error = %store_err, "failed to record failed job");
        }
        self.ack(lease).await;
        RunReport::Failed {
            attempt: lease.attempt,
            error: message,
        }
    }

    async fn ack(&self, lease: &Lease) {
        if let Err(err) = self.broker.ack(lease).await {
            error!(job_id = %lease.envelope.id, error = %err, "failed to acknowledge job");
        }
    }

    async fn release(
        &self,
        lease: &Lease,
        delay: Duration,
        kind: ReleaseKind,
        checkpoint: Option<serde_json::Value>,
    ) {
        if let Err(err) = self.broker.release(lease, delay, kind, checkpoint).await {
            error!(job_id = %lease.envelope.id, error = %err, "failed to release job");
        }
    }
}

/// Run `job` on its own task so a panic or timeout cannot take the worker down.
async fn execute_guarded(
    job: Arc<dyn Job>,
    ctx: Arc<JobExecutionContext>,
    timeout: Duration,
) -> Result<JobOutcome, JobError> {
    let handle = tokio::spawn(async move { job.execute(&ctx).await });
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(JobError::Panicked(panic_message(join_err.into_panic())))
        }
        Ok(Err(join_err)) => Err(JobError::Failed(join_err.to_string())),
        Err(_) => {
            abort.abort();
            Err(JobError::TimedOut(timeout))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to control running workers.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop leasing new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

/// Spawns `workers` tasks per configured queue.
pub struct WorkerPool {
    runner: Arc<JobRunner>,
    queues: Arc<QueueTable>,
}

impl WorkerPool {
    pub fn new(runner: Arc<JobRunner>, queues: Arc<QueueTable>) -> Self {
        Self { runner, queues }
    }

    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        for queue in self.queues.iter() {
            for n in 0..queue.workers {
                let name = format!("{}-{}", queue.name, n);
                workers.push(tokio::spawn(worker_loop(
                    name,
                    self.runner.clone(),
                    queue.name.clone(),
                    queue.poll_interval,
                    shutdown_rx.clone(),
                )));
            }
        }

        info!(workers = workers.len(), "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            workers,
        }
    }
}

async fn worker_loop(
    name: String,
    runner: Arc<JobRunner>,
    queue: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = %name, queue = %queue, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match runner.run_next(&queue).await {
            Ok(Some(report)) => {
                debug!(worker = %name, report = ?report, "job finished");
                false
            }
            Ok(None) => true,
            Err(err) => {
                error!(worker = %name, queue = %queue, error = %err, "failed to lease job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    // Handle dropped without an explicit shutdown.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!(worker = %name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::jobs::ledger::InMemoryJobLedger;
    use crate::jobs::types::BackoffSchedule;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Sleep,
    }

    struct TestJob {
        behaviour: Behaviour,
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Job for TestJob {
        fn job_type(&self) -> &'static str {
            "test.job"
        }

        fn queue(&self) -> &str {
            "default"
        }

        fn payload(&self) -> JsonValue {
            json!({})
        }

        fn backoff_schedule(&self) -> BackoffSchedule {
            BackoffSchedule::from_secs(&[10, 20])
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }

        async fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutcome, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.update_progress(10).await;
            match self.behaviour {
                Behaviour::Succeed => Ok(JobOutcome::Completed(Some(json!({"ok": true})))),
                Behaviour::Fail => Err(JobError::failed("downstream unavailable")),
                Behaviour::Panic => panic!("handler bug"),
                Behaviour::Sleep => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(JobOutcome::Completed(None))
                }
            }
        }
    }

    struct Harness {
        broker: Arc<InMemoryBroker>,
        ledger: Arc<InMemoryJobLedger>,
        runner: JobRunner,
        runs: Arc<AtomicU32>,
    }

    fn harness(behaviour: Behaviour) -> Harness {
        let queues = Arc::new(QueueTable::default());
        let broker = InMemoryBroker::arc(queues.clone());
        let ledger = InMemoryJobLedger::arc();
        let runs = Arc::new(AtomicU32::new(0));

        let mut registry = JobRegistry::new();
        let counter = runs.clone();
        registry.register("test.job", move |_| {
            Ok(Arc::new(TestJob {
                behaviour,
                runs: counter.clone(),
            }) as Arc<dyn Job>)
        });

        let runner = JobRunner::new(
            broker.clone(),
            ledger.clone(),
            ledger.clone(),
            Arc::new(registry),
            queues,
        );
        Harness {
            broker,
            ledger,
            runner,
            runs,
        }
    }

    async fn enqueue(h: &Harness, job_type: &str) -> JobEnvelope {
        let envelope = JobEnvelope::new(job_type, "default", json!({}));
        h.broker.enqueue(envelope.clone(), Duration::ZERO).await.unwrap();
        envelope
    }

    #[tokio::test]
    async fn successful_job_is_acked_and_completed() {
        let h = harness(Behaviour::Succeed);
        let envelope = enqueue(&h, "test.job").await;

        let report = h.runner.run_next("default").await.unwrap().unwrap();
        assert_eq!(report, RunReport::Completed);

        let record = h.ledger.get(envelope.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.result, Some(json!({"ok": true})));
        assert!(h.broker.snapshot("default").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_follow_backoff_then_land_in_failed_store() {
        let h = harness(Behaviour::Fail);
        let envelope = enqueue(&h, "test.job").await;
        let start = Utc::now();

        let lease = h.broker.lease_at("default", start).unwrap().unwrap();
        assert_eq!(
            h.runner.run(lease).await,
            RunReport::Retrying { attempt: 1, delay: Duration::from_secs(10) }
        );
        let queued = h.broker.find(envelope.id).unwrap().unwrap();
        assert!(queued.available_at >= start + chrono::Duration::seconds(10));
        assert_eq!(
            h.ledger.get(envelope.id).await.unwrap().unwrap().status,
            JobStatus::Retrying
        );

        let later = Utc::now() + chrono::Duration::seconds(30);
        let lease = h.broker.lease_at("default", later).unwrap().unwrap();
        assert_eq!(
            h.runner.run(lease).await,
            RunReport::Retrying { attempt: 2, delay: Duration::from_secs(20) }
        );

        let later = Utc::now() + chrono::Duration::seconds(60);
        let lease = h.broker.lease_at("default", later).unwrap().unwrap();
        assert!(matches!(h.runner.run(lease).await, RunReport::Failed { attempt: 3, .. }));

        let record = h.ledger.get(envelope.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("downstream unavailable"));
        assert!(h.ledger.failed_job(envelope.id).await.unwrap().is_some());
        assert!(h.broker.find(envelope.id).unwrap().is_none());
        assert_eq!(h.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panics_are_caught_as_failed_attempts() {
        let h = harness(Behaviour::Panic);
        let envelope = enqueue(&h, "test.job").await;

        let report = h.runner.run_next("default").await.unwrap().unwrap();
        assert!(matches!(report, RunReport::Retrying { attempt: 1, .. }));
        let record = h.ledger.get(envelope.id).await.unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn attempts_time_out() {
        let h = harness(Behaviour::Sleep);
        enqueue(&h, "test.job").await;

        let report = h.runner.run_next("default").await.unwrap().unwrap();
        assert!(matches!(report, RunReport::Retrying { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_job_type_fails_without_retry() {
        let h = harness(Behaviour::Succeed);
        let envelope = enqueue(&h, "nobody.handles.this").await;

        let report = h.runner.run_next("default").await.unwrap().unwrap();
        assert!(matches!(report, RunReport::Failed { attempt: 1, .. }));
        assert!(h.ledger.failed_job(envelope.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_jobs_are_dropped_without_running() {
        let h = harness(Behaviour::Succeed);
        let envelope = enqueue(&h, "test.job").await;
        h.ledger
            .create(envelope.id, "test.job", "default", json!({}), 3)
            .await
            .unwrap();
        h.ledger.cancel(envelope.id).await.unwrap();

        let report = h.runner.run_next("default").await.unwrap().unwrap();
        assert_eq!(report, RunReport::Cancelled);
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
        assert!(h.broker.snapshot("default").unwrap().is_empty());
    }

    #[tokio::test]
    async fn pool_drains_queue_and_shuts_down() {
        let h = harness(Behaviour::Succeed);
        for _ in 0..3 {
            enqueue(&h, "test.job").await;
        }
        let queues = Arc::new(QueueTable::empty().with(
            crate::config::QueueConfig::new("default", 90, 3, 60)
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(5)),
        ));
        let Harness { runner, broker, runs, .. } = h;
        let handle = WorkerPool::new(Arc::new(runner), queues).spawn();
        assert_eq!(handle.worker_count(), 2);

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) == 3 && broker.snapshot("default").unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(broker.snapshot("default").unwrap().is_empty());
    }
}
