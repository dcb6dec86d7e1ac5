//! Read-only views of records owned by the external task/user layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskpulse_core::{TaskId, UserId};

use crate::rule::{Channel, NewRule, OffsetUnit};

/// The parts of a task the reminder subsystem needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub due_date: Option<DateTime<Utc>>,
}

/// Per-user defaults used when a task is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderDefaults {
    pub enabled: bool,
    pub offset: i64,
    pub unit: OffsetUnit,
    pub channel: Channel,
}

impl Default for ReminderDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            offset: 30,
            unit: OffsetUnit::Minutes,
            channel: Channel::Email,
        }
    }
}

impl ReminderDefaults {
    /// The default rule input for `task`, or `None` when the user opted out.
    pub fn rule_for(&self, task: &TaskSnapshot) -> Option<NewRule> {
        if !self.enabled {
            return None;
        }
        Some(NewRule {
            user_id: task.user_id,
            task_id: task.id,
            channel: self.channel,
            offset: self.offset,
            unit: self.unit,
            enabled: true,
        })
    }
}

/// The parts of a user the reminder subsystem needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub reminder_defaults: ReminderDefaults,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opted_out_user_gets_no_default_rule() {
        let task = TaskSnapshot {
            id: TaskId::new(),
            user_id: UserId::new(),
            title: "Renew passport".to_string(),
            due_date: None,
        };
        let defaults = ReminderDefaults {
            enabled: false,
            ..Default::default()
        };
        assert!(defaults.rule_for(&task).is_none());

        let rule = ReminderDefaults::default().rule_for(&task).unwrap();
        assert_eq!(rule.task_id, task.id);
        assert_eq!(rule.user_id, task.user_id);
        assert_eq!(rule.offset, 30);
        assert_eq!(rule.unit, OffsetUnit::Minutes);
    }
}
