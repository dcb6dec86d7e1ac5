//! Reminder storage: rules, delivery logs, in-app notifications, and
//! read access to the task/user records owned by the CRUD layer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use taskpulse_core::{DeliveryLogId, DomainError, RuleId, TaskId, UserId};
use taskpulse_reminders::{DeliveryLog, DeliveryStatus, InAppNotification, ReminderRule, TaskSnapshot, UserSnapshot};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReminderStoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A rule together with the task it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct DueCandidate {
    pub rule: ReminderRule,
    pub task: TaskSnapshot,
}

#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn task(&self, id: TaskId) -> Result<Option<TaskSnapshot>, ReminderStoreError>;

    async fn user(&self, id: UserId) -> Result<Option<UserSnapshot>, ReminderStoreError>;

    async fn count_tasks_with_due_date(&self) -> Result<u64, ReminderStoreError>;

    /// Tasks with a due date, ordered by id.
    async fn tasks_with_due_date(&self, offset: u64, limit: usize) -> Result<Vec<TaskSnapshot>, ReminderStoreError>;

    async fn insert_rule(&self, rule: &ReminderRule) -> Result<(), ReminderStoreError>;

    /// Replace a stored rule; `NotFound` when it does not exist.
    async fn update_rule(&self, rule: &ReminderRule) -> Result<(), ReminderStoreError>;

    async fn delete_rule(&self, id: RuleId) -> Result<bool, ReminderStoreError>;

    async fn delete_rules_for_task(&self, task_id: TaskId) -> Result<u64, ReminderStoreError>;

    async fn rule(&self, id: RuleId) -> Result<Option<ReminderRule>, ReminderStoreError>;

    async fn rules_for_task(&self, task_id: TaskId) -> Result<Vec<ReminderRule>, ReminderStoreError>;

    /// Enabled rules whose task and user exist, whose task has a due date,
    /// and which have not been sent within `window` of `now`. The exact
    /// due-time comparison is the caller's.
    async fn due_candidates(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<DueCandidate>, ReminderStoreError>;

    async fn set_last_sent_at(&self, id: RuleId, at: DateTime<Utc>) -> Result<(), ReminderStoreError>;

    async fn insert_log(&self, log: &DeliveryLog) -> Result<(), ReminderStoreError>;

    async fn update_log(&self, log: &DeliveryLog) -> Result<(), ReminderStoreError>;

    async fn log(&self, id: DeliveryLogId) -> Result<Option<DeliveryLog>, ReminderStoreError>;

    async fn logs_for_rule(&self, rule_id: RuleId) -> Result<Vec<DeliveryLog>, ReminderStoreError>;

    /// Whether a `sent` log exists for `rule_id` with `sent_at` after `since`.
    async fn has_sent_log_since(&self, rule_id: RuleId, since: DateTime<Utc>) -> Result<bool, ReminderStoreError>;

    async fn insert_in_app(&self, notification: &InAppNotification) -> Result<(), ReminderStoreError>;

    /// Newest first.
    async fn in_app_for_user(&self, user_id: UserId) -> Result<Vec<InAppNotification>, ReminderStoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskSnapshot>,
    users: HashMap<UserId, UserSnapshot>,
    rules: HashMap<RuleId, ReminderRule>,
    logs: HashMap<DeliveryLogId, DeliveryLog>,
    in_app: Vec<InAppNotification>,
}

/// In-memory store for tests/dev. Also stands in for the task/user tables.
#[derive(Debug, Default)]
pub struct InMemoryReminderStore {
    inner: RwLock<Inner>,
}

fn poisoned<T>(_: T) -> ReminderStoreError {
    ReminderStoreError::Storage("reminder store lock poisoned".to_string())
}

impl InMemoryReminderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn upsert_task(&self, task: TaskSnapshot) -> Result<(), ReminderStoreError> {
        self.inner.write().map_err(poisoned)?.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn upsert_user(&self, user: UserSnapshot) -> Result<(), ReminderStoreError> {
        self.inner.write().map_err(poisoned)?.users.insert(user.id, user);
        Ok(())
    }

    /// Remove a task and, like the foreign key in the schema, its rules.
    pub fn remove_task(&self, id: TaskId) -> Result<(), ReminderStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.tasks.remove(&id);
        inner.rules.retain(|_, rule| rule.task_id != id);
        Ok(())
    }

    pub fn remove_user(&self, id: UserId) -> Result<(), ReminderStoreError> {
        self.inner.write().map_err(poisoned)?.users.remove(&id);
        Ok(())
    }

    pub fn all_logs(&self) -> Result<Vec<DeliveryLog>, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut logs: Vec<_> = inner.logs.values().cloned().collect();
        logs.sort_by_key(|log| (log.created_at, log.id));
        Ok(logs)
    }
}

#[async_trait]
impl ReminderStore for InMemoryReminderStore {
    async fn task(&self, id: TaskId) -> Result<Option<TaskSnapshot>, ReminderStoreError> {
        Ok(self.inner.read().map_err(poisoned)?.tasks.get(&id).cloned())
    }

    async fn user(&self, id: UserId) -> Result<Option<UserSnapshot>, ReminderStoreError> {
        Ok(self.inner.read().map_err(poisoned)?.users.get(&id).cloned())
    }

    async fn count_tasks_with_due_date(&self) -> Result<u64, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.tasks.values().filter(|t| t.due_date.is_some()).count() as u64)
    }

    async fn tasks_with_due_date(&self, offset: u64, limit: usize) -> Result<Vec<TaskSnapshot>, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut tasks: Vec<_> = inner.tasks.values().filter(|t| t.due_date.is_some()).cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit)
            .collect())
    }

    async fn insert_rule(&self, rule: &ReminderRule) -> Result<(), ReminderStoreError> {
        self.inner.write().map_err(poisoned)?.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &ReminderRule) -> Result<(), ReminderStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        match inner.rules.get_mut(&rule.id) {
            Some(stored) => {
                *stored = rule.clone();
                Ok(())
            }
            None => Err(ReminderStoreError::NotFound("reminder rule")),
        }
    }

    async fn delete_rule(&self, id: RuleId) -> Result<bool, ReminderStoreError> {
        Ok(self.inner.write().map_err(poisoned)?.rules.remove(&id).is_some())
    }

    async fn delete_rules_for_task(&self, task_id: TaskId) -> Result<u64, ReminderStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let before = inner.rules.len();
        inner.rules.retain(|_, rule| rule.task_id != task_id);
        Ok((before - inner.rules.len()) as u64)
    }

    async fn rule(&self, id: RuleId) -> Result<Option<ReminderRule>, ReminderStoreError> {
        Ok(self.inner.read().map_err(poisoned)?.rules.get(&id).cloned())
    }

    async fn rules_for_task(&self, task_id: TaskId) -> Result<Vec<ReminderRule>, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut rules: Vec<_> = inner.rules.values().filter(|r| r.task_id == task_id).cloned().collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    async fn due_candidates(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<DueCandidate>, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let since = now - window;
        let mut candidates: Vec<_> = inner
            .rules
            .values()
            .filter(|rule| rule.enabled && !rule.sent_within(now, window))
            .filter(|rule| inner.users.contains_key(&rule.user_id))
            .filter(|rule| {
                !inner.logs.values().any(|log| {
                    log.rule_id == rule.id
                        && log.status == DeliveryStatus::Sent
                        && log.sent_at.is_some_and(|at| at > since)
                })
            })
            .filter_map(|rule| {
                let task = inner.tasks.get(&rule.task_id)?;
                task.due_date?;
                Some(DueCandidate {
                    rule: rule.clone(),
                    task: task.clone(),
                })
            })
            .collect();
        candidates.sort_by_key(|c| c.rule.id);
        Ok(candidates)
    }

    async fn set_last_sent_at(&self, id: RuleId, at: DateTime<Utc>) -> Result<(), ReminderStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let rule = inner
            .rules
            .get_mut(&id)
            .ok_or(ReminderStoreError::NotFound("reminder rule"))?;
        rule.record_sent(at);
        Ok(())
    }

    async fn insert_log(&self, log: &DeliveryLog) -> Result<(), ReminderStoreError> {
        self.inner.write().map_err(poisoned)?.logs.insert(log.id, log.clone());
        Ok(())
    }

    async fn update_log(&self, log: &DeliveryLog) -> Result<(), ReminderStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        match inner.logs.get_mut(&log.id) {
            Some(stored) => {
                *stored = log.clone();
                Ok(())
            }
            None => Err(ReminderStoreError::NotFound("delivery log")),
        }
    }

    async fn log(&self, id: DeliveryLogId) -> Result<Option<DeliveryLog>, ReminderStoreError> {
        Ok(self.inner.read().map_err(poisoned)?.logs.get(&id).cloned())
    }

    async fn logs_for_rule(&self, rule_id: RuleId) -> Result<Vec<DeliveryLog>, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut logs: Vec<_> = inner.logs.values().filter(|l| l.rule_id == rule_id).cloned().collect();
        logs.sort_by_key(|log| (log.created_at, log.id));
        Ok(logs)
    }

    async fn has_sent_log_since(&self, rule_id: RuleId, since: DateTime<Utc>) -> Result<bool, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.logs.values().any(|log| {
            log.rule_id == rule_id
                && log.status == DeliveryStatus::Sent
                && log.sent_at.is_some_and(|at| at > since)
        }))
    }

    async fn insert_in_app(&self, notification: &InAppNotification) -> Result<(), ReminderStoreError> {
        self.inner.write().map_err(poisoned)?.in_app.push(notification.clone());
        Ok(())
    }

    async fn in_app_for_user(&self, user_id: UserId) -> Result<Vec<InAppNotification>, ReminderStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut items: Vec<_> = inner.in_app.iter().filter(|n| n.user_id == user_id).cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }
}
