//! In-process broker for tests/dev and single-node deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::{Broker, BrokerError, EnqueueOutcome, JobEnvelope, Lease, QueueDepth, ReleaseKind};
use crate::config::QueueTable;
use crate::jobs::JobId;

/// Snapshot of one queued job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub envelope: JobEnvelope,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub reserved_until: Option<DateTime<Utc>>,
}

impl QueuedJob {
    fn is_reserved(&self, now: DateTime<Utc>) -> bool {
        self.reserved_until.is_some_and(|until| until > now)
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.is_reserved(now) && self.available_at <= now
    }
}

#[derive(Debug, Default)]
struct State {
    /// Insertion order is kept so equal `available_at` values lease FIFO.
    queues: HashMap<String, Vec<QueuedJob>>,
    unique: HashMap<String, JobId>,
}

#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Arc<QueueTable>,
    state: Mutex<State>,
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_default()
}

impl InMemoryBroker {
    pub fn new(queues: Arc<QueueTable>) -> Self {
        Self {
            queues,
            state: Mutex::new(State::default()),
        }
    }

    pub fn arc(queues: Arc<QueueTable>) -> Arc<Self> {
        Arc::new(Self::new(queues))
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker lock poisoned".to_string()))
    }

    pub fn enqueue_at(
        &self,
        envelope: JobEnvelope,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, BrokerError> {
        let mut state = self.state()?;
        if let Some(key) = &envelope.unique_id {
            if let Some(existing) = state.unique.get(key) {
                return Ok(EnqueueOutcome::Duplicate(*existing));
            }
            state.unique.insert(key.clone(), envelope.id);
        }
        let id = envelope.id;
        let queue = envelope.queue.clone();
        state.queues.entry(queue).or_default().push(QueuedJob {
            envelope,
            attempts: 0,
            available_at: now + to_chrono(delay),
            reserved_until: None,
        });
        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Lease as if the clock read `now`. Lets tests step past delays without sleeping.
    pub fn lease_at(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Lease>, BrokerError> {
        let retry_after = to_chrono(self.queues.get(queue).retry_after);
        let mut state = self.state()?;
        let Some(jobs) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        let next = jobs
            .iter_mut()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| job.available_at);
        let Some(job) = next else {
            return Ok(None);
        };
        job.attempts += 1;
        job.reserved_until = Some(now + retry_after);
        Ok(Some(Lease {
            envelope: job.envelope.clone(),
            attempt: job.attempts,
            leased_at: now,
        }))
    }

    pub fn release_at(
        &self,
        lease: &Lease,
        delay: Duration,
        kind: ReleaseKind,
        checkpoint: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let job = state
            .queues
            .get_mut(&lease.envelope.queue)
            .and_then(|jobs| jobs.iter_mut().find(|job| job.envelope.id == lease.envelope.id));
        let Some(job) = job else {
            tracing::warn!(job_id = %lease.envelope.id, "release of a job the broker no longer holds");
            return Ok(());
        };
        job.reserved_until = None;
        job.available_at = now + to_chrono(delay);
        if kind == ReleaseKind::Yield {
            job.attempts = lease.attempt.saturating_sub(1);
        }
        if checkpoint.is_some() {
            job.envelope.checkpoint = checkpoint;
        }
        Ok(())
    }

    pub fn depth_at(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueDepth, BrokerError> {
        let state = self.state()?;
        let mut depth = QueueDepth::default();
        for job in state.queues.get(queue).into_iter().flatten() {
            if job.is_reserved(now) {
                depth.reserved += 1;
            } else if job.available_at <= now {
                depth.ready += 1;
            } else {
                depth.delayed += 1;
            }
        }
        Ok(depth)
    }

    /// Everything held on `queue`, in insertion order.
    pub fn snapshot(&self, queue: &str) -> Result<Vec<QueuedJob>, BrokerError> {
        let state = self.state()?;
        Ok(state.queues.get(queue).cloned().unwrap_or_default())
    }

    pub fn find(&self, job_id: JobId) -> Result<Option<QueuedJob>, BrokerError> {
        let state = self.state()?;
        Ok(state
            .queues
            .values()
            .flatten()
            .find(|job| job.envelope.id == job_id)
            .cloned())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, envelope: JobEnvelope, delay: Duration) -> Result<EnqueueOutcome, BrokerError> {
        self.enqueue_at(envelope, delay, Utc::now())
    }

    async fn lease(&self, queue: &str) -> Result<Option<Lease>, BrokerError> {
        self.lease_at(queue, Utc::now())
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let id = lease.envelope.id;
        if let Some(jobs) = state.queues.get_mut(&lease.envelope.queue) {
            jobs.retain(|job| job.envelope.id != id);
        }
        if let Some(key) = &lease.envelope.unique_id {
            if state.unique.get(key) == Some(&id) {
                state.unique.remove(key);
            }
        }
        Ok(())
    }

    async fn release(
        &self,
        lease: &Lease,
        delay: Duration,
        kind: ReleaseKind,
        checkpoint: Option<JsonValue>,
    ) -> Result<(), BrokerError> {
        self.release_at(lease, delay, kind, checkpoint, Utc::now())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        self.depth_at(queue, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new(Arc::new(QueueTable::default()))
    }

    fn envelope(unique: Option<&str>) -> JobEnvelope {
        JobEnvelope::new("test.job", "notifications", json!({"n": 1}))
            .with_unique_id(unique.map(str::to_string))
    }

    #[tokio::test]
    async fn unique_key_is_held_until_ack() {
        let broker = broker();
        let first = broker.enqueue(envelope(Some("k")), Duration::ZERO).await.unwrap();
        assert!(first.is_enqueued());

        let second = broker.enqueue(envelope(Some("k")), Duration::ZERO).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate(first.job_id()));

        let lease = broker.lease("notifications").await.unwrap().unwrap();
        let while_running = broker.enqueue(envelope(Some("k")), Duration::ZERO).await.unwrap();
        assert!(!while_running.is_enqueued());

        broker.ack(&lease).await.unwrap();
        let after_ack = broker.enqueue(envelope(Some("k")), Duration::ZERO).await.unwrap();
        assert!(after_ack.is_enqueued());
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_their_time() {
        let broker = broker();
        let now = Utc::now();
        broker
            .enqueue_at(envelope(None), Duration::from_secs(60), now)
            .unwrap();

        assert!(broker.lease_at("notifications", now).unwrap().is_none());
        let depth = broker.depth_at("notifications", now).unwrap();
        assert_eq!(depth, QueueDepth { ready: 0, delayed: 1, reserved: 0 });

        let later = now + chrono::Duration::seconds(60);
        assert!(broker.lease_at("notifications", later).unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_with_next_attempt() {
        let broker = broker();
        let now = Utc::now();
        broker.enqueue_at(envelope(None), Duration::ZERO, now).unwrap();

        let first = broker.lease_at("notifications", now).unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(broker.lease_at("notifications", now + chrono::Duration::seconds(89)).unwrap().is_none());

        let second = broker
            .lease_at("notifications", now + chrono::Duration::seconds(90))
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.envelope.id, first.envelope.id);
    }

    #[tokio::test]
    async fn yield_release_gives_the_attempt_back_and_keeps_checkpoint() {
        let broker = broker();
        let now = Utc::now();
        broker.enqueue_at(envelope(None), Duration::ZERO, now).unwrap();

        let lease = broker.lease_at("notifications", now).unwrap().unwrap();
        broker
            .release_at(&lease, Duration::from_secs(60), ReleaseKind::Yield, Some(json!({"offset": 200})), now)
            .unwrap();

        let resumed = broker
            .lease_at("notifications", now + chrono::Duration::seconds(60))
            .unwrap()
            .unwrap();
        assert_eq!(resumed.attempt, 1);
        assert_eq!(resumed.envelope.checkpoint, Some(json!({"offset": 200})));

        broker
            .release_at(&resumed, Duration::ZERO, ReleaseKind::Retry, None, now)
            .unwrap();
        let retried = broker
            .lease_at("notifications", now + chrono::Duration::seconds(61))
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.envelope.checkpoint, Some(json!({"offset": 200})));
    }
}
