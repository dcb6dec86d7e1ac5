use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use taskpulse_core::{DomainError, DomainResult, RuleId, TaskId, UserId};

use crate::snapshot::TaskSnapshot;

/// Default dedup window: a rule counts as "already notified" for one hour after a send.
pub const DEFAULT_DEDUP_WINDOW_SECS: i64 = 3600;

/// Upper bound for a reminder offset (365 days), regardless of unit.
pub const MAX_OFFSET_MINUTES: i64 = 365 * 24 * 60;

/// Delivery medium for a reminder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    InApp,
    Push,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::InApp => "in_app",
            Channel::Push => "push",
            Channel::Sms => "sms",
        }
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "in_app" => Ok(Channel::InApp),
            "push" => Ok(Channel::Push),
            "sms" => Ok(Channel::Sms),
            other => Err(DomainError::invalid_id(format!("unknown channel: {other}"))),
        }
    }
}

/// Unit of a reminder offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetUnit {
    Minutes,
    Hours,
    Days,
}

impl OffsetUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetUnit::Minutes => "minutes",
            OffsetUnit::Hours => "hours",
            OffsetUnit::Days => "days",
        }
    }

    fn minutes_per_unit(&self) -> i64 {
        match self {
            OffsetUnit::Minutes => 1,
            OffsetUnit::Hours => 60,
            OffsetUnit::Days => 24 * 60,
        }
    }

    /// Length of `offset` units. Callers validate the offset first.
    pub fn duration(&self, offset: i64) -> Duration {
        Duration::minutes(offset.saturating_mul(self.minutes_per_unit()))
    }
}

impl FromStr for OffsetUnit {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(OffsetUnit::Minutes),
            "hours" => Ok(OffsetUnit::Hours),
            "days" => Ok(OffsetUnit::Days),
            other => Err(DomainError::invalid_id(format!("unknown offset unit: {other}"))),
        }
    }
}

fn validate_offset(offset: i64, unit: OffsetUnit) -> DomainResult<()> {
    if offset < 0 {
        return Err(DomainError::validation("reminder offset must not be negative"));
    }
    if offset.saturating_mul(unit.minutes_per_unit()) > MAX_OFFSET_MINUTES {
        return Err(DomainError::validation(format!(
            "reminder offset {offset} {} exceeds 365 days",
            unit.as_str()
        )));
    }
    Ok(())
}

/// Input for creating a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    pub user_id: UserId,
    pub task_id: TaskId,
    pub channel: Channel,
    pub offset: i64,
    pub unit: OffsetUnit,
    pub enabled: bool,
}

/// Partial update of a rule; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub channel: Option<Channel>,
    pub offset: Option<i64>,
    pub unit: Option<OffsetUnit>,
    pub enabled: Option<bool>,
}

/// A configured reminder bound to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRule {
    pub id: RuleId,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub channel: Channel,
    pub offset: i64,
    pub unit: OffsetUnit,
    pub enabled: bool,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReminderRule {
    pub fn create(input: NewRule, now: DateTime<Utc>) -> DomainResult<Self> {
        validate_offset(input.offset, input.unit)?;
        Ok(Self {
            id: RuleId::new(),
            user_id: input.user_id,
            task_id: input.task_id,
            channel: input.channel,
            offset: input.offset,
            unit: input.unit,
            enabled: input.enabled,
            last_sent_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a partial update. The combined offset/unit is validated before anything changes.
    pub fn apply(&mut self, update: RuleUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        let offset = update.offset.unwrap_or(self.offset);
        let unit = update.unit.unwrap_or(self.unit);
        validate_offset(offset, unit)?;

        self.offset = offset;
        self.unit = unit;
        if let Some(channel) = update.channel {
            self.channel = channel;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Flip the enabled flag and return the new value.
    pub fn toggle(&mut self, now: DateTime<Utc>) -> bool {
        self.enabled = !self.enabled;
        self.updated_at = now;
        self.enabled
    }

    pub fn offset_duration(&self) -> Duration {
        self.unit.duration(self.offset)
    }

    /// `task_due - offset(unit)`.
    pub fn reminder_due_at(&self, task_due: DateTime<Utc>) -> DateTime<Utc> {
        task_due - self.offset_duration()
    }

    /// True while `last_sent_at` falls inside the dedup window ending at `now`.
    pub fn sent_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_sent_at.is_some_and(|sent| now - sent < window)
    }

    /// Whether the rule is due against its task at `now`.
    ///
    /// Existence of the task's user is the caller's concern; a task that does not
    /// belong to this rule or has no due date is never due.
    pub fn is_due(&self, task: &TaskSnapshot, now: DateTime<Utc>, window: Duration) -> bool {
        if !self.enabled || task.id != self.task_id {
            return false;
        }
        let Some(due_date) = task.due_date else {
            return false;
        };
        !self.sent_within(now, window) && now >= self.reminder_due_at(due_date)
    }

    /// Key used to deduplicate delivery jobs in the broker.
    ///
    /// Changes only when `last_sent_at` changes, so repeated scheduler ticks for
    /// the same due window map to the same key.
    pub fn idempotency_key(&self) -> String {
        match self.last_sent_at {
            Some(sent) => format!("reminder:{}:{}", self.id, sent.timestamp()),
            None => format!("reminder:{}:never", self.id),
        }
    }

    pub fn record_sent(&mut self, at: DateTime<Utc>) {
        self.last_sent_at = Some(at);
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
    }

    fn window() -> Duration {
        Duration::seconds(DEFAULT_DEDUP_WINDOW_SECS)
    }

    fn rule_for(task: &TaskSnapshot, offset: i64, unit: OffsetUnit) -> ReminderRule {
        ReminderRule::create(
            NewRule {
                user_id: task.user_id,
                task_id: task.id,
                channel: Channel::Email,
                offset,
                unit,
                enabled: true,
            },
            test_time() - Duration::days(2),
        )
        .unwrap()
    }

    fn task_due_at(due: DateTime<Utc>) -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(),
            user_id: UserId::new(),
            title: "Quarterly report".to_string(),
            due_date: Some(due),
        }
    }

    #[test]
    fn due_exactly_at_reminder_time_not_a_minute_before() {
        let due = test_time();
        let task = task_due_at(due);
        let rule = rule_for(&task, 30, OffsetUnit::Minutes);

        assert_eq!(rule.reminder_due_at(due), due - Duration::minutes(30));
        assert!(rule.is_due(&task, due - Duration::minutes(30), window()));
        assert!(!rule.is_due(&task, due - Duration::minutes(31), window()));
    }

    #[test]
    fn disabled_rule_is_never_due() {
        let task = task_due_at(test_time());
        let mut rule = rule_for(&task, 0, OffsetUnit::Minutes);
        assert!(!rule.toggle(test_time()));
        assert!(!rule.is_due(&task, test_time() + Duration::hours(1), window()));
    }

    #[test]
    fn task_without_due_date_is_never_due() {
        let mut task = task_due_at(test_time());
        let rule = rule_for(&task, 1, OffsetUnit::Hours);
        task.due_date = None;
        assert!(!rule.is_due(&task, test_time(), window()));
    }

    #[test]
    fn recent_send_suppresses_until_window_elapses() {
        let task = task_due_at(test_time());
        let mut rule = rule_for(&task, 1, OffsetUnit::Days);
        let now = test_time();

        rule.record_sent(now - Duration::minutes(10));
        assert!(!rule.is_due(&task, now, window()));

        rule.record_sent(now - Duration::minutes(61));
        assert!(rule.is_due(&task, now, window()));
    }

    #[test]
    fn idempotency_key_changes_only_with_last_sent() {
        let task = task_due_at(test_time());
        let mut rule = rule_for(&task, 1, OffsetUnit::Hours);
        let first = rule.idempotency_key();
        assert!(first.ends_with(":never"));
        assert_eq!(first, rule.idempotency_key());

        rule.record_sent(test_time());
        let second = rule.idempotency_key();
        assert_ne!(first, second);
        assert!(second.ends_with(&test_time().timestamp().to_string()));
    }

    #[test]
    fn negative_or_oversized_offsets_are_rejected() {
        let task = task_due_at(test_time());
        let mut input = NewRule {
            user_id: task.user_id,
            task_id: task.id,
            channel: Channel::InApp,
            offset: -5,
            unit: OffsetUnit::Minutes,
            enabled: true,
        };
        assert!(matches!(
            ReminderRule::create(input.clone(), test_time()),
            Err(DomainError::Validation(_))
        ));

        input.offset = 366;
        input.unit = OffsetUnit::Days;
        assert!(ReminderRule::create(input, test_time()).is_err());
    }

    #[test]
    fn update_validates_combined_offset_and_unit() {
        let task = task_due_at(test_time());
        let mut rule = rule_for(&task, 300, OffsetUnit::Minutes);

        // 400 days is over the cap; the rule must stay untouched.
        let err = rule
            .apply(
                RuleUpdate {
                    unit: Some(OffsetUnit::Days),
                    offset: Some(400),
                    ..Default::default()
                },
                test_time(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(rule.unit, OffsetUnit::Minutes);

        rule.apply(
            RuleUpdate {
                unit: Some(OffsetUnit::Hours),
                offset: Some(2),
                channel: Some(Channel::Push),
                enabled: None,
            },
            test_time(),
        )
        .unwrap();
        assert_eq!(rule.offset_duration(), Duration::hours(2));
        assert_eq!(rule.channel, Channel::Push);
    }

    #[test]
    fn channel_strings_round_trip() {
        for channel in [Channel::Email, Channel::InApp, Channel::Push, Channel::Sms] {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("carrier_pigeon".parse::<Channel>().is_err());
    }

    fn unit_strategy() -> impl Strategy<Value = OffsetUnit> {
        prop_oneof![
            Just(OffsetUnit::Minutes),
            Just(OffsetUnit::Hours),
            Just(OffsetUnit::Days),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a never-sent enabled rule flips from "not due" to "due"
        /// exactly at `due_date - offset`.
        #[test]
        fn due_boundary_is_exact(offset in 0i64..=365, unit in unit_strategy(), skew in 1i64..10_000) {
            let due = test_time();
            let task = task_due_at(due);
            let rule = rule_for(&task, offset, unit);
            let at = rule.reminder_due_at(due);

            prop_assert_eq!(at, due - unit.duration(offset));
            prop_assert!(rule.is_due(&task, at, window()));
            prop_assert!(rule.is_due(&task, at + Duration::seconds(skew), window()));
            prop_assert!(!rule.is_due(&task, at - Duration::seconds(skew), window()));
        }
    }
}
