//! Background job system: job contract, status ledger, retry with per-job
//! backoff, failed-job store, chunked heavy jobs and the worker pool.
//!
//! ## Components
//!
//! - `Job`: what a job implements (type, queue, backoff, unique key, execute)
//! - `JobExecutionContext`: ledger-backed lifecycle and progress reporting
//! - `JobLedger` / `FailedJobStore`: durable job status and failures
//! - `JobRunner` / `WorkerPool`: lease, run, retry or fail
//! - `ChunkedExecutor`: memory-aware chunking with checkpointed yields

pub mod chunked;
pub mod context;
pub mod contract;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod types;

pub use chunked::{ChunkCheckpoint, ChunkedExecutor, ChunkedJob, ChunkedProcessor, heavy_backoff};
pub use context::JobExecutionContext;
pub use contract::{Job, JobError, JobOutcome};
pub use executor::{JobRegistry, JobRunner, RunReport, WorkerPool, WorkerPoolHandle};
pub use ledger::{FailedJob, FailedJobStore, InMemoryJobLedger, JobLedger, LedgerError, StatusCounts};
pub use memory::{MemoryProbe, ProcessMemoryProbe, ScriptedMemoryProbe};
pub use postgres::PostgresJobLedger;
pub use types::{BackoffSchedule, JobId, JobRecord, JobStatus};
