//! Infrastructure layer: configuration, job execution, brokers, reminder
//! storage and delivery, queue monitoring.

/// Environment configuration and the named queue table.
pub mod config;

/// Job contract, ledger, worker pool and chunked heavy jobs.
pub mod jobs;

/// Message brokers (in-memory, Redis behind the `redis` feature).
pub mod broker;

/// Reminder rules, delivery channels and the reminder jobs.
pub mod reminders;

/// Queue health snapshots, alerts and operator retry.
pub mod monitor;
