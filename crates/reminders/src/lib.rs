//! Reminder domain module.
//!
//! Business rules for reminder rules and delivery logs, implemented as
//! deterministic domain logic (no IO, no queue, no storage). Every time-dependent
//! decision takes `now` explicitly.

pub mod delivery;
pub mod rule;
pub mod snapshot;

pub use delivery::{DeliveryLog, DeliveryStatus, InAppNotification};
pub use rule::{
    Channel, DEFAULT_DEDUP_WINDOW_SECS, MAX_OFFSET_MINUTES, NewRule, OffsetUnit, ReminderRule,
    RuleUpdate,
};
pub use snapshot::{ReminderDefaults, TaskSnapshot, UserSnapshot};
