//! Reminder rule engine: rule CRUD, due-rule selection and dispatch of
//! delivery jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use taskpulse_core::{DeliveryLogId, DomainError, RuleId, TaskId, UserId};
use taskpulse_reminders::{DeliveryLog, NewRule, ReminderRule, RuleUpdate, TaskSnapshot};

use super::delivery::{DELIVERY_JOB_TYPE, DeliveryPayload};
use super::store::{ReminderStore, ReminderStoreError};
use crate::broker::{Broker, BrokerError, EnqueueOutcome, JobEnvelope};
use crate::config::NOTIFICATIONS_QUEUE;
use crate::jobs::JobId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] ReminderStoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchSummary {
    pub dry_run: bool,
    pub due: usize,
    pub dispatched: usize,
    /// Due rules whose delivery job was already queued or running.
    pub duplicates: usize,
    pub rule_ids: Vec<RuleId>,
    pub job_ids: Vec<JobId>,
}

pub struct ReminderRuleEngine {
    store: Arc<dyn ReminderStore>,
    broker: Arc<dyn Broker>,
    dedup_window: chrono::Duration,
}

impl ReminderRuleEngine {
    pub fn new(store: Arc<dyn ReminderStore>, broker: Arc<dyn Broker>, dedup_window: chrono::Duration) -> Self {
        Self {
            store,
            broker,
            dedup_window,
        }
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        self.dedup_window
    }

    /// Create a rule on a task the acting user owns.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, task_id = %input.task_id), err)]
    pub async fn create_rule(&self, input: NewRule) -> Result<ReminderRule, EngineError> {
        let task = self
            .store
            .task(input.task_id)
            .await?
            .ok_or(DomainError::not_found("task"))?;
        if task.user_id != input.user_id {
            return Err(DomainError::ownership(format!(
                "task {} does not belong to user {}",
                task.id, input.user_id
            ))
            .into());
        }
        if self.store.user(input.user_id).await?.is_none() {
            return Err(DomainError::not_found("user").into());
        }

        let rule = ReminderRule::create(input, Utc::now())?;
        self.store.insert_rule(&rule).await?;
        info!(rule_id = %rule.id, channel = %rule.channel, offset = rule.offset, unit = rule.unit.as_str(), "reminder rule created");
        Ok(rule)
    }

    /// The stored rule, if `acting_user` owns it.
    pub async fn rule_for(&self, acting_user: UserId, rule_id: RuleId) -> Result<ReminderRule, EngineError> {
        let rule = self
            .store
            .rule(rule_id)
            .await?
            .ok_or(DomainError::not_found("reminder rule"))?;
        if rule.user_id != acting_user {
            return Err(DomainError::ownership(format!(
                "rule {} does not belong to user {}",
                rule.id, acting_user
            ))
            .into());
        }
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        acting_user: UserId,
        rule_id: RuleId,
        update: RuleUpdate,
    ) -> Result<ReminderRule, EngineError> {
        let mut rule = self.rule_for(acting_user, rule_id).await?;
        rule.apply(update, Utc::now())?;
        self.store.update_rule(&rule).await?;
        debug!(rule_id = %rule.id, "reminder rule updated");
        Ok(rule)
    }

    pub async fn toggle_rule(&self, acting_user: UserId, rule_id: RuleId) -> Result<ReminderRule, EngineError> {
        let mut rule = self.rule_for(acting_user, rule_id).await?;
        let enabled = rule.toggle(Utc::now());
        self.store.update_rule(&rule).await?;
        info!(rule_id = %rule.id, enabled, "reminder rule toggled");
        Ok(rule)
    }

    pub async fn delete_rule(&self, acting_user: UserId, rule_id: RuleId) -> Result<(), EngineError> {
        let rule = self.rule_for(acting_user, rule_id).await?;
        self.store.delete_rule(rule.id).await?;
        info!(rule_id = %rule.id, "reminder rule deleted");
        Ok(())
    }

    /// Create the owner's default rule for a newly created task. `None` when
    /// the owner opted out or the task already has rules.
    pub async fn create_default_rule(&self, task: &TaskSnapshot) -> Result<Option<ReminderRule>, EngineError> {
        let user = self
            .store
            .user(task.user_id)
            .await?
            .ok_or(DomainError::not_found("user"))?;
        let Some(input) = user.reminder_defaults.rule_for(task) else {
            return Ok(None);
        };
        if !self.store.rules_for_task(task.id).await?.is_empty() {
            return Ok(None);
        }
        self.create_rule(input).await.map(Some)
    }

    /// Drop every rule of a deleted task.
    pub async fn delete_task_rules(&self, task_id: TaskId) -> Result<u64, EngineError> {
        let removed = self.store.delete_rules_for_task(task_id).await?;
        if removed > 0 {
            info!(task_id = %task_id, removed, "reminder rules removed with task");
        }
        Ok(removed)
    }

    pub async fn get_due_rules(&self) -> Result<Vec<ReminderRule>, EngineError> {
        self.get_due_rules_at(Utc::now()).await
    }

    /// Rules due at `now`, ordered by id.
    pub async fn get_due_rules_at(&self, now: DateTime<Utc>) -> Result<Vec<ReminderRule>, EngineError> {
        let candidates = self.store.due_candidates(now, self.dedup_window).await?;
        Ok(candidates
            .into_iter()
            .filter(|c| c.rule.is_due(&c.task, now, self.dedup_window))
            .map(|c| c.rule)
            .collect())
    }

    pub async fn dispatch_due_notifications(&self, dry_run: bool) -> Result<DispatchSummary, EngineError> {
        self.dispatch_due_notifications_at(Utc::now(), dry_run).await
    }

    /// Enqueue one delivery job per due rule. A dry run only reports what is due.
    #[instrument(skip(self), err)]
    pub async fn dispatch_due_notifications_at(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<DispatchSummary, EngineError> {
        let due = self.get_due_rules_at(now).await?;
        let mut summary = DispatchSummary {
            dry_run,
            due: due.len(),
            rule_ids: due.iter().map(|r| r.id).collect(),
            ..Default::default()
        };

        if dry_run {
            info!(due = summary.due, "dry run: due reminders not dispatched");
            return Ok(summary);
        }

        for rule in &due {
            match self.enqueue_delivery(rule).await? {
                EnqueueOutcome::Enqueued(job_id) => {
                    summary.dispatched += 1;
                    summary.job_ids.push(job_id);
                }
                EnqueueOutcome::Duplicate(job_id) => {
                    debug!(rule_id = %rule.id, job_id = %job_id, "delivery already queued");
                    summary.duplicates += 1;
                }
            }
        }

        info!(
            due = summary.due,
            dispatched = summary.dispatched,
            duplicates = summary.duplicates,
            "due reminders dispatched"
        );
        Ok(summary)
    }

    /// Enqueue the delivery job for `rule`, deduplicated by its idempotency key.
    pub async fn enqueue_delivery(&self, rule: &ReminderRule) -> Result<EnqueueOutcome, EngineError> {
        let payload = DeliveryPayload {
            rule_id: rule.id,
            idempotency_key: rule.idempotency_key(),
        };
        let envelope = JobEnvelope::new(
            DELIVERY_JOB_TYPE,
            NOTIFICATIONS_QUEUE,
            serde_json::to_value(&payload).map_err(BrokerError::from)?,
        )
        .with_unique_id(Some(payload.idempotency_key));
        Ok(self.broker.enqueue(envelope, Duration::ZERO).await?)
    }

    /// Set the read marker on a delivery log the acting user received.
    pub async fn mark_delivery_read(&self, acting_user: UserId, log_id: DeliveryLogId) -> Result<DeliveryLog, EngineError> {
        let mut log = self
            .store
            .log(log_id)
            .await?
            .ok_or(DomainError::not_found("delivery log"))?;
        if log.user_id != acting_user {
            return Err(DomainError::ownership(format!(
                "delivery log {} does not belong to user {}",
                log.id, acting_user
            ))
            .into());
        }
        if log.read_at.is_none() {
            log.mark_read(Utc::now());
            self.store.update_log(&log).await?;
        }
        Ok(log)
    }
}
