//! Delivery audit log and in-app notification records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use taskpulse_core::{DeliveryLogId, DomainError, DomainResult, RuleId, TaskId, UserId};

use crate::rule::{Channel, ReminderRule};

/// Delivery attempt status. Only `pending -> sent` and `pending -> failed` exist.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(DomainError::invalid_id(format!("unknown delivery status: {other}"))),
        }
    }
}

/// One row per delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: DeliveryLogId,
    pub rule_id: RuleId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: JsonValue,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryLog {
    /// A fresh `pending` log for a delivery of `rule`.
    pub fn pending(rule: &ReminderRule, metadata: JsonValue, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryLogId::new(),
            rule_id: rule.id,
            task_id: rule.task_id,
            user_id: rule.user_id,
            channel: rule.channel,
            status: DeliveryStatus::Pending,
            sent_at: None,
            error_message: None,
            metadata,
            read_at: None,
            created_at: now,
        }
    }

    fn ensure_pending(&self, target: DeliveryStatus) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::transition(format!(
                "delivery log {} is {} and cannot become {}",
                self.id,
                self.status.as_str(),
                target.as_str()
            )));
        }
        Ok(())
    }

    /// `pending -> sent`. Sender metadata is merged into the log's metadata.
    pub fn mark_sent(&mut self, extra: JsonValue, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_pending(DeliveryStatus::Sent)?;
        merge_metadata(&mut self.metadata, extra);
        self.status = DeliveryStatus::Sent;
        self.sent_at = Some(now);
        Ok(())
    }

    /// `pending -> failed`.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.ensure_pending(DeliveryStatus::Failed)?;
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Set the read marker. The first read wins; later calls are no-ops.
    pub fn mark_read(&mut self, now: DateTime<Utc>) {
        if self.read_at.is_none() {
            self.read_at = Some(now);
        }
    }
}

fn merge_metadata(target: &mut JsonValue, extra: JsonValue) {
    match (target, extra) {
        (JsonValue::Object(base), JsonValue::Object(more)) => base.extend(more),
        (_, JsonValue::Null) => {}
        (slot, other) => *slot = other,
    }
}

/// A notification written by the in-app channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InAppNotification {
    pub id: Uuid,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub rule_id: RuleId,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl InAppNotification {
    pub fn new(
        rule: &ReminderRule,
        title: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: rule.user_id,
            task_id: rule.task_id,
            rule_id: rule.id,
            title: title.into(),
            body: body.into(),
            created_at: now,
            read_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{NewRule, OffsetUnit};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn test_rule() -> ReminderRule {
        ReminderRule::create(
            NewRule {
                user_id: UserId::new(),
                task_id: TaskId::new(),
                channel: Channel::Email,
                offset: 15,
                unit: OffsetUnit::Minutes,
                enabled: true,
            },
            test_time(),
        )
        .unwrap()
    }

    #[test]
    fn pending_to_sent_merges_metadata() {
        let mut log = DeliveryLog::pending(&test_rule(), json!({"job_id": "abc"}), test_time());
        log.mark_sent(json!({"message_id": "m-1"}), test_time()).unwrap();

        assert_eq!(log.status, DeliveryStatus::Sent);
        assert_eq!(log.sent_at, Some(test_time()));
        assert_eq!(log.metadata, json!({"job_id": "abc", "message_id": "m-1"}));
    }

    #[test]
    fn terminal_logs_reject_further_transitions() {
        let mut log = DeliveryLog::pending(&test_rule(), JsonValue::Null, test_time());
        log.mark_failed("smtp timeout").unwrap();

        assert!(matches!(
            log.mark_sent(JsonValue::Null, test_time()),
            Err(DomainError::InvalidTransition(_))
        ));
        assert!(log.mark_failed("again").is_err());
        assert_eq!(log.error_message.as_deref(), Some("smtp timeout"));
    }

    #[test]
    fn read_marker_is_allowed_after_terminal_state() {
        let mut log = DeliveryLog::pending(&test_rule(), JsonValue::Null, test_time());
        log.mark_sent(JsonValue::Null, test_time()).unwrap();
        log.mark_read(test_time());
        log.mark_read(test_time() + chrono::Duration::hours(1));
        assert_eq!(log.read_at, Some(test_time()));
        assert_eq!(log.status, DeliveryStatus::Sent);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Sent,
        Failed,
        Read,
    }

    proptest! {
        /// Property: whatever sequence of operations is attempted, the status
        /// leaves `pending` at most once and never returns to it.
        #[test]
        fn status_transitions_are_monotonic(
            ops in prop::collection::vec(prop_oneof![Just(Op::Sent), Just(Op::Failed), Just(Op::Read)], 0..20)
        ) {
            let mut log = DeliveryLog::pending(&test_rule(), JsonValue::Null, test_time());
            let mut first_terminal: Option<DeliveryStatus> = None;

            for op in ops {
                let _ = match op {
                    Op::Sent => log.mark_sent(JsonValue::Null, test_time()),
                    Op::Failed => log.mark_failed("boom"),
                    Op::Read => {
                        log.mark_read(test_time());
                        Ok(())
                    }
                };

                if let Some(terminal) = first_terminal {
                    prop_assert_eq!(log.status, terminal);
                } else if log.status.is_terminal() {
                    first_terminal = Some(log.status);
                }
            }
        }
    }
}
