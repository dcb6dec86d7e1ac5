//! Heavy job that gives every dated task without rules its owner's default
//! reminder rule.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use taskpulse_core::{RuleId, TaskId};
use taskpulse_reminders::{ReminderRule, TaskSnapshot};

use super::store::ReminderStore;
use crate::jobs::{ChunkedExecutor, ChunkedJob, ChunkedProcessor, Job, JobError, JobRegistry};

pub const BACKFILL_JOB_TYPE: &str = "reminders.backfill_default_rules";
pub const BACKFILL_UNIQUE_ID: &str = "reminders.backfill_default_rules";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillOutcome {
    pub task_id: TaskId,
    /// The created rule, or `None` when the task was left alone.
    pub rule_id: Option<RuleId>,
}

pub struct ReminderBackfillProcessor {
    store: Arc<dyn ReminderStore>,
}

impl ReminderBackfillProcessor {
    pub fn new(store: Arc<dyn ReminderStore>) -> Self {
        Self { store }
    }

    /// The backfill as a heavy-queue job. One backfill runs at a time.
    pub fn job(store: Arc<dyn ReminderStore>, executor: Arc<ChunkedExecutor>) -> ChunkedJob<Self> {
        ChunkedJob::new(BACKFILL_JOB_TYPE, json!({}), Self::new(store), executor).with_unique_id(BACKFILL_UNIQUE_ID)
    }

    pub fn register(registry: &mut JobRegistry, store: Arc<dyn ReminderStore>, executor: Arc<ChunkedExecutor>) {
        registry.register(BACKFILL_JOB_TYPE, move |_| {
            Ok(Arc::new(Self::job(store.clone(), executor.clone())) as Arc<dyn Job>)
        });
    }

    async fn backfill_task(&self, task: &TaskSnapshot) -> Result<Option<RuleId>, JobError> {
        if !self.store.rules_for_task(task.id).await?.is_empty() {
            return Ok(None);
        }
        let Some(user) = self.store.user(task.user_id).await? else {
            return Ok(None);
        };
        let Some(input) = user.reminder_defaults.rule_for(task) else {
            return Ok(None);
        };
        let rule = ReminderRule::create(input, Utc::now())?;
        self.store.insert_rule(&rule).await?;
        debug!(task_id = %task.id, rule_id = %rule.id, "default reminder rule backfilled");
        Ok(Some(rule.id))
    }
}

#[async_trait]
impl ChunkedProcessor for ReminderBackfillProcessor {
    type Item = TaskSnapshot;
    type Output = BackfillOutcome;

    async fn total_item_count(&self) -> Result<u64, JobError> {
        Ok(self.store.count_tasks_with_due_date().await?)
    }

    async fn fetch_items(&self, offset: u64, limit: usize) -> Result<Vec<TaskSnapshot>, JobError> {
        Ok(self.store.tasks_with_due_date(offset, limit).await?)
    }

    async fn process_chunk(&self, items: Vec<TaskSnapshot>) -> Result<Vec<BackfillOutcome>, JobError> {
        let mut outcomes = Vec::with_capacity(items.len());
        for task in items {
            let rule_id = self.backfill_task(&task).await?;
            outcomes.push(BackfillOutcome {
                task_id: task.id,
                rule_id,
            });
        }
        Ok(outcomes)
    }
}
