//! Reminder subsystem infrastructure: storage, the rule engine, channel
//! senders and the jobs that deliver and backfill reminders.

pub mod backfill;
pub mod channels;
pub mod delivery;
pub mod engine;
pub mod postgres;
pub mod store;

pub use backfill::{BACKFILL_JOB_TYPE, BackfillOutcome, ReminderBackfillProcessor};
pub use channels::{
    ChannelDispatcher, ChannelSender, Delivery, EmailSender, InAppSender, LogMailTransport, MailMessage,
    MailTransport, SendError, SendReceipt,
};
pub use delivery::{DELIVERY_JOB_TYPE, DeliveryDeps, DeliveryPayload, NotificationDeliveryJob};
pub use engine::{DispatchSummary, EngineError, ReminderRuleEngine};
pub use postgres::PostgresReminderStore;
pub use store::{DueCandidate, InMemoryReminderStore, ReminderStore, ReminderStoreError};
