//! The notification delivery job.
//!
//! One job per due rule. Before sending it re-reads the rule, the task and
//! the user, and re-checks the dedup window against the delivery logs, so a
//! stale or duplicated enqueue never produces a second `sent` log.
//!
//! An attempt aborted by its timeout leaves its `pending` log behind. The
//! next attempt for the rule closes such logs as `failed` once they are
//! older than the delivery timeout, so no live attempt's log is touched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use taskpulse_core::{DomainError, RuleId};
use taskpulse_reminders::{DeliveryLog, DeliveryStatus};

use super::channels::{ChannelDispatcher, Delivery};
use super::store::{ReminderStore, ReminderStoreError};
use crate::broker::JobEnvelope;
use crate::config::NOTIFICATIONS_QUEUE;
use crate::jobs::{BackoffSchedule, Job, JobError, JobExecutionContext, JobOutcome, JobRegistry};

pub const DELIVERY_JOB_TYPE: &str = "notification.delivery";
pub const DELIVERY_MAX_ATTEMPTS: u32 = 3;
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DELIVERY_RETRY_DELAY: Duration = Duration::from_secs(60);

impl From<ReminderStoreError> for JobError {
    fn from(err: ReminderStoreError) -> Self {
        JobError::dependency(err)
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        JobError::dependency(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub rule_id: RuleId,
    pub idempotency_key: String,
}

/// Shared collaborators of every delivery job.
#[derive(Clone)]
pub struct DeliveryDeps {
    pub store: Arc<dyn ReminderStore>,
    pub channels: Arc<ChannelDispatcher>,
    pub dedup_window: chrono::Duration,
}

pub struct NotificationDeliveryJob {
    payload: DeliveryPayload,
    deps: Arc<DeliveryDeps>,
}

impl NotificationDeliveryJob {
    pub fn new(payload: DeliveryPayload, deps: Arc<DeliveryDeps>) -> Self {
        Self { payload, deps }
    }

    pub fn from_envelope(envelope: &JobEnvelope, deps: Arc<DeliveryDeps>) -> Result<Self, JobError> {
        let payload: DeliveryPayload = serde_json::from_value(envelope.payload.clone())?;
        Ok(Self::new(payload, deps))
    }

    pub fn register(registry: &mut JobRegistry, deps: Arc<DeliveryDeps>) {
        registry.register(DELIVERY_JOB_TYPE, move |envelope| {
            Ok(Arc::new(Self::from_envelope(envelope, deps.clone())?) as Arc<dyn Job>)
        });
    }

    pub fn rule_id(&self) -> RuleId {
        self.payload.rule_id
    }

    async fn close_abandoned_logs(&self, rule_id: RuleId, now: DateTime<Utc>) -> Result<(), JobError> {
        let cutoff = now - chrono::Duration::from_std(DELIVERY_TIMEOUT).unwrap_or_default();
        for mut stale in self.deps.store.logs_for_rule(rule_id).await? {
            if stale.status != DeliveryStatus::Pending || stale.created_at >= cutoff {
                continue;
            }
            stale.mark_failed("attempt abandoned before the send finished")?;
            self.deps.store.update_log(&stale).await?;
            warn!(rule_id = %rule_id, log_id = %stale.id, "closed abandoned pending delivery log");
        }
        Ok(())
    }
}

#[async_trait]
impl Job for NotificationDeliveryJob {
    fn job_type(&self) -> &'static str {
        DELIVERY_JOB_TYPE
    }

    fn queue(&self) -> &str {
        NOTIFICATIONS_QUEUE
    }

    fn payload(&self) -> JsonValue {
        json!(self.payload)
    }

    fn backoff_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::fixed(DELIVERY_RETRY_DELAY)
    }

    fn unique_id(&self) -> Option<String> {
        Some(self.payload.idempotency_key.clone())
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(DELIVERY_MAX_ATTEMPTS)
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DELIVERY_TIMEOUT)
    }

    async fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutcome, JobError> {
        let deps = &self.deps;
        let now = Utc::now();

        let Some(rule) = deps.store.rule(self.payload.rule_id).await? else {
            return Ok(JobOutcome::Skipped(format!("rule {} no longer exists", self.payload.rule_id)));
        };
        if !rule.enabled {
            return Ok(JobOutcome::Skipped(format!("rule {} is disabled", rule.id)));
        }
        let Some(task) = deps.store.task(rule.task_id).await? else {
            return Ok(JobOutcome::Skipped(format!("task {} no longer exists", rule.task_id)));
        };
        let Some(user) = deps.store.user(rule.user_id).await? else {
            return Ok(JobOutcome::Skipped(format!("user {} no longer exists", rule.user_id)));
        };
        if deps
            .store
            .has_sent_log_since(rule.id, now - deps.dedup_window)
            .await?
        {
            return Ok(JobOutcome::Skipped(format!(
                "rule {} already delivered within the dedup window",
                rule.id
            )));
        }

        self.close_abandoned_logs(rule.id, now).await?;

        let mut log = DeliveryLog::pending(
            &rule,
            json!({
                "job_id": ctx.job_id(),
                "attempt": ctx.attempt(),
                "idempotency_key": self.payload.idempotency_key,
            }),
            now,
        );
        deps.store.insert_log(&log).await?;
        ctx.update_progress(50).await;

        let Some(sender) = deps.channels.sender(rule.channel) else {
            log.mark_failed(format!("unsupported channel: {}", rule.channel))?;
            deps.store.update_log(&log).await?;
            warn!(rule_id = %rule.id, channel = %rule.channel, log_id = %log.id, "no sender for channel");
            return Ok(JobOutcome::Skipped(format!("unsupported channel: {}", rule.channel)));
        };

        let delivery = Delivery {
            rule: &rule,
            task: &task,
            user: &user,
        };
        match sender.send(&delivery).await {
            Ok(receipt) => {
                let sent_at = Utc::now();
                log.mark_sent(receipt.metadata, sent_at)?;
                deps.store.update_log(&log).await?;
                deps.store.set_last_sent_at(rule.id, sent_at).await?;
                info!(
                    rule_id = %rule.id,
                    task_id = %rule.task_id,
                    channel = %rule.channel,
                    log_id = %log.id,
                    "reminder delivered"
                );
                Ok(JobOutcome::Completed(Some(json!({
                    "status": "sent",
                    "log_id": log.id,
                    "channel": rule.channel,
                }))))
            }
            Err(err) => {
                log.mark_failed(err.to_string())?;
                deps.store.update_log(&log).await?;
                Err(JobError::failed(format!("{} delivery failed: {err}", rule.channel)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobLedger, JobId};
    use crate::reminders::channels::{EmailSender, LogMailTransport};
    use crate::reminders::store::InMemoryReminderStore;
    use taskpulse_core::{TaskId, UserId};
    use taskpulse_reminders::{
        Channel, NewRule, OffsetUnit, ReminderDefaults, ReminderRule, TaskSnapshot, UserSnapshot,
    };

    async fn seeded(channel: Channel) -> (Arc<InMemoryReminderStore>, Arc<DeliveryDeps>, ReminderRule) {
        let store = InMemoryReminderStore::arc();
        let user = UserSnapshot {
            id: UserId::new(),
            email: "lin@example.com".into(),
            name: "Lin".into(),
            reminder_defaults: ReminderDefaults::default(),
        };
        let task = TaskSnapshot {
            id: TaskId::new(),
            user_id: user.id,
            title: "Renew passport".into(),
            due_date: Some(Utc::now()),
        };
        store.upsert_user(user.clone()).unwrap();
        store.upsert_task(task.clone()).unwrap();
        let rule = ReminderRule::create(
            NewRule {
                user_id: user.id,
                task_id: task.id,
                channel,
                offset: 0,
                unit: OffsetUnit::Minutes,
                enabled: true,
            },
            Utc::now(),
        )
        .unwrap();
        store.insert_rule(&rule).await.unwrap();

        let channels = ChannelDispatcher::new().with(
            Channel::Email,
            Arc::new(EmailSender::new(Arc::new(LogMailTransport), "noreply@example.com")),
        );
        let deps = Arc::new(DeliveryDeps {
            store: store.clone(),
            channels: Arc::new(channels),
            dedup_window: chrono::Duration::hours(1),
        });
        (store, deps, rule)
    }

    fn job(rule: &ReminderRule, deps: &Arc<DeliveryDeps>) -> NotificationDeliveryJob {
        NotificationDeliveryJob::new(
            DeliveryPayload {
                rule_id: rule.id,
                idempotency_key: rule.idempotency_key(),
            },
            deps.clone(),
        )
    }

    fn context() -> JobExecutionContext {
        JobExecutionContext::new(
            InMemoryJobLedger::arc(),
            JobId::new(),
            DELIVERY_JOB_TYPE,
            NOTIFICATIONS_QUEUE,
            json!({}),
            None,
            1,
            DELIVERY_MAX_ATTEMPTS,
        )
    }

    #[tokio::test]
    async fn second_job_for_the_same_rule_is_suppressed() {
        let (store, deps, rule) = seeded(Channel::Email).await;
        // Both jobs were enqueued from the same rule state, as if the broker
        // lock had been bypassed.
        let first = job(&rule, &deps);
        let second = job(&rule, &deps);

        let outcome = first.execute(&context()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        let outcome = second.execute(&context()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));

        let logs = store.logs_for_rule(rule.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DeliveryStatus::Sent);
        assert!(store.rule(rule.id).await.unwrap().unwrap().last_sent_at.is_some());
    }

    #[tokio::test]
    async fn disabled_or_missing_rule_is_skipped_without_a_log() {
        let (store, deps, mut rule) = seeded(Channel::Email).await;
        rule.toggle(Utc::now());
        store.update_rule(&rule).await.unwrap();

        let outcome = job(&rule, &deps).execute(&context()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));

        store.delete_rule(rule.id).await.unwrap();
        let outcome = job(&rule, &deps).execute(&context()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert!(store.logs_for_rule(rule.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_channel_does_not_advance_last_sent() {
        let (store, deps, rule) = seeded(Channel::Sms).await;

        let outcome = job(&rule, &deps).execute(&context()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));

        let logs = store.logs_for_rule(rule.id).await.unwrap();
        assert_eq!(logs[0].status, DeliveryStatus::Failed);
        assert!(store.rule(rule.id).await.unwrap().unwrap().last_sent_at.is_none());
    }

    #[tokio::test]
    async fn pending_log_left_by_a_timed_out_attempt_is_closed() {
        let (store, deps, rule) = seeded(Channel::Email).await;
        let abandoned = DeliveryLog::pending(&rule, json!({}), Utc::now() - chrono::Duration::minutes(5));
        store.insert_log(&abandoned).await.unwrap();
        let in_flight = DeliveryLog::pending(&rule, json!({}), Utc::now());
        store.insert_log(&in_flight).await.unwrap();

        let outcome = job(&rule, &deps).execute(&context()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));

        let closed = store.log(abandoned.id).await.unwrap().unwrap();
        assert_eq!(closed.status, DeliveryStatus::Failed);
        assert_eq!(store.log(in_flight.id).await.unwrap().unwrap().status, DeliveryStatus::Pending);
        let sent = store
            .logs_for_rule(rule.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|log| log.status == DeliveryStatus::Sent)
            .count();
        assert_eq!(sent, 1);
    }
}
