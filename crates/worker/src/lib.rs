//! The taskpulse worker process: backend wiring, the reminder scheduler,
//! queue monitoring and the `JobService` facade.

pub mod app;
pub mod scheduler;
pub mod service;

pub use app::{App, AppBuilder, AppError, Backends, RunningApp};
pub use service::{BackfillDeps, JobService, RetryFilter, ServiceError};
