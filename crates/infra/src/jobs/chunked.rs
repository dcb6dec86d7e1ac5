//! Chunked execution for heavy jobs.
//!
//! A heavy job walks its items in fixed-size chunks. Before each chunk the
//! executor samples memory; over the threshold it asks the probe to reclaim
//! and samples again, and if usage is still too high the job yields with a
//! checkpoint so the next lease resumes at the same offset without using up
//! an attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::context::JobExecutionContext;
use super::contract::{Job, JobError, JobOutcome};
use super::memory::MemoryProbe;
use super::types::BackoffSchedule;
use crate::config::{HEAVY_QUEUE, HeavyJobConfig};

/// Delay before a yielded heavy job is leased again.
pub const MEMORY_YIELD_DELAY: Duration = Duration::from_secs(60);

/// Retry delays for heavy jobs: 5, 15, 30 minutes.
pub fn heavy_backoff() -> BackoffSchedule {
    BackoffSchedule::from_secs(&[300, 900, 1800])
}

/// Work that can be processed in chunks.
///
/// `fetch_items` must page deterministically so a resumed run picks up
/// exactly where the checkpoint left off. Chunks after the last checkpoint
/// can be processed twice when an attempt fails, so `process_chunk` should
/// be idempotent.
#[async_trait]
pub trait ChunkedProcessor: Send + Sync + 'static {
    type Item: Send;
    type Output: Serialize + Send;

    async fn total_item_count(&self) -> Result<u64, JobError>;

    async fn fetch_items(&self, offset: u64, limit: usize) -> Result<Vec<Self::Item>, JobError>;

    async fn process_chunk(&self, items: Vec<Self::Item>) -> Result<Vec<Self::Output>, JobError>;
}

/// Resume state carried on the broker envelope between yields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub next_offset: u64,
    pub processed: u64,
    pub results: Vec<JsonValue>,
    pub peak_memory_bytes: u64,
    pub yields: u32,
}

fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed.saturating_mul(100) / total).min(100) as u8
}

pub struct ChunkedExecutor {
    chunk_size: usize,
    memory_threshold_bytes: u64,
    yield_delay: Duration,
    probe: Arc<dyn MemoryProbe>,
}

impl std::fmt::Debug for ChunkedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedExecutor")
            .field("chunk_size", &self.chunk_size)
            .field("memory_threshold_bytes", &self.memory_threshold_bytes)
            .field("yield_delay", &self.yield_delay)
            .finish_non_exhaustive()
    }
}

impl ChunkedExecutor {
    pub fn new(config: HeavyJobConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            memory_threshold_bytes: config.memory_threshold_bytes,
            yield_delay: MEMORY_YIELD_DELAY,
            probe,
        }
    }

    pub fn with_yield_delay(mut self, delay: Duration) -> Self {
        self.yield_delay = delay;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn run<P: ChunkedProcessor>(
        &self,
        processor: &P,
        ctx: &JobExecutionContext,
    ) -> Result<JobOutcome, JobError> {
        let started = Instant::now();
        let mut checkpoint: ChunkCheckpoint = match ctx.checkpoint() {
            Some(saved) => serde_json::from_value(saved.clone())
                .map_err(|e| JobError::Payload(format!("corrupt checkpoint: {e}")))?,
            None => ChunkCheckpoint::default(),
        };

        let total = processor.total_item_count().await?;
        info!(
            job_id = %ctx.job_id(),
            job_type = %ctx.job_type(),
            total_items = total,
            resume_offset = checkpoint.next_offset,
            chunk_size = self.chunk_size,
            "heavy job running"
        );
        if checkpoint.processed > 0 {
            ctx.update_progress(percent(checkpoint.processed, total)).await;
        }

        while checkpoint.next_offset < total {
            let mut usage = self.probe.sample();
            checkpoint.peak_memory_bytes = checkpoint.peak_memory_bytes.max(usage);

            if usage >= self.memory_threshold_bytes {
                warn!(
                    job_id = %ctx.job_id(),
                    memory_bytes = usage,
                    threshold_bytes = self.memory_threshold_bytes,
                    "memory threshold reached, reclaiming"
                );
                self.probe.reclaim();
                usage = self.probe.sample();
                checkpoint.peak_memory_bytes = checkpoint.peak_memory_bytes.max(usage);

                if usage >= self.memory_threshold_bytes {
                    checkpoint.yields += 1;
                    warn!(
                        job_id = %ctx.job_id(),
                        memory_bytes = usage,
                        processed = checkpoint.processed,
                        total_items = total,
                        delay_secs = self.yield_delay.as_secs(),
                        "memory still over threshold, yielding"
                    );
                    return Ok(JobOutcome::Yield {
                        delay: self.yield_delay,
                        reason: format!(
                            "memory usage {usage} bytes at or above threshold {} bytes",
                            self.memory_threshold_bytes
                        ),
                        checkpoint: Some(serde_json::to_value(&checkpoint)?),
                    });
                }
            }

            let items = processor
                .fetch_items(checkpoint.next_offset, self.chunk_size)
                .await?;
            if items.is_empty() {
                // Source shrank under us.
                break;
            }
            let fetched = items.len() as u64;
            for output in processor.process_chunk(items).await? {
                checkpoint.results.push(serde_json::to_value(output)?);
            }
            checkpoint.next_offset += fetched;
            checkpoint.processed += fetched;

            let progress = percent(checkpoint.processed, total);
            ctx.update_progress(progress).await;
            info!(
                job_id = %ctx.job_id(),
                chunk_items = fetched,
                processed = checkpoint.processed,
                total_items = total,
                progress,
                memory_bytes = usage,
                "chunk processed"
            );
        }

        Ok(JobOutcome::Completed(Some(json!({
            "total_items": total,
            "processed_items": checkpoint.processed,
            "results": checkpoint.results,
            "peak_memory_bytes": checkpoint.peak_memory_bytes,
            "yields": checkpoint.yields,
            "duration_ms": started.elapsed().as_millis() as u64,
        }))))
    }
}

/// Adapts a `ChunkedProcessor` into a `Job` on the heavy queue.
pub struct ChunkedJob<P> {
    job_type: &'static str,
    payload: JsonValue,
    unique_id: Option<String>,
    processor: P,
    executor: Arc<ChunkedExecutor>,
}

impl<P: ChunkedProcessor> ChunkedJob<P> {
    pub fn new(job_type: &'static str, payload: JsonValue, processor: P, executor: Arc<ChunkedExecutor>) -> Self {
        Self {
            job_type,
            payload,
            unique_id: None,
            processor,
            executor,
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }
}

#[async_trait]
impl<P: ChunkedProcessor> Job for ChunkedJob<P> {
    fn job_type(&self) -> &'static str {
        self.job_type
    }

    fn queue(&self) -> &str {
        HEAVY_QUEUE
    }

    fn payload(&self) -> JsonValue {
        self.payload.clone()
    }

    fn backoff_schedule(&self) -> BackoffSchedule {
        heavy_backoff()
    }

    fn unique_id(&self) -> Option<String> {
        self.unique_id.clone()
    }

    async fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutcome, JobError> {
        self.executor.run(&self.processor, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ledger::{InMemoryJobLedger, JobLedger};
    use crate::jobs::memory::ScriptedMemoryProbe;
    use crate::jobs::types::JobId;
    use std::sync::Mutex;

    const MB: u64 = 1024 * 1024;

    /// Doubles numbers 0..n and remembers which offsets it saw.
    struct Doubler {
        n: u64,
        fetched: Mutex<Vec<u64>>,
    }

    impl Doubler {
        fn new(n: u64) -> Self {
            Self {
                n,
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChunkedProcessor for Doubler {
        type Item = u64;
        type Output = u64;

        async fn total_item_count(&self) -> Result<u64, JobError> {
            Ok(self.n)
        }

        async fn fetch_items(&self, offset: u64, limit: usize) -> Result<Vec<u64>, JobError> {
            self.fetched.lock().unwrap().push(offset);
            Ok((offset..self.n).take(limit).collect())
        }

        async fn process_chunk(&self, items: Vec<u64>) -> Result<Vec<u64>, JobError> {
            Ok(items.into_iter().map(|i| i * 2).collect())
        }
    }

    fn executor(probe: Arc<ScriptedMemoryProbe>) -> ChunkedExecutor {
        ChunkedExecutor::new(
            HeavyJobConfig {
                chunk_size: 100,
                memory_threshold_bytes: 512 * MB,
            },
            probe,
        )
    }

    async fn context(ledger: Arc<InMemoryJobLedger>, checkpoint: Option<JsonValue>) -> JobExecutionContext {
        let ctx = JobExecutionContext::new(ledger, JobId::new(), "heavy.test", HEAVY_QUEUE, json!({}), checkpoint, 1, 3);
        ctx.start().await;
        ctx
    }

    #[tokio::test]
    async fn processes_every_chunk_and_reports_progress() {
        let ledger = InMemoryJobLedger::arc();
        let ctx = context(ledger.clone(), None).await;
        let processor = Doubler::new(250);

        let outcome = executor(Arc::new(ScriptedMemoryProbe::constant(100 * MB)))
            .run(&processor, &ctx)
            .await
            .unwrap();

        let JobOutcome::Completed(Some(result)) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(result["total_items"], 250);
        assert_eq!(result["processed_items"], 250);
        assert_eq!(result["results"].as_array().unwrap().len(), 250);
        assert_eq!(result["results"][249], 498);
        assert_eq!(*processor.fetched.lock().unwrap(), vec![0, 100, 200]);
        assert_eq!(ledger.get(ctx.job_id()).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn reclaim_that_frees_enough_memory_keeps_going() {
        let ledger = InMemoryJobLedger::arc();
        let ctx = context(ledger, None).await;
        let probe = Arc::new(ScriptedMemoryProbe::new(vec![600 * MB, 200 * MB]));

        let outcome = executor(probe.clone()).run(&Doubler::new(50), &ctx).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(probe.reclaim_count(), 1);
    }

    #[tokio::test]
    async fn memory_pressure_yields_and_resumes_from_checkpoint() {
        let ledger = InMemoryJobLedger::arc();
        let ctx = context(ledger.clone(), None).await;
        // Two chunks fit, then usage stays at 600MB through the reclaim.
        let probe = Arc::new(ScriptedMemoryProbe::new(vec![100 * MB, 100 * MB, 600 * MB, 600 * MB]));
        let processor = Doubler::new(1000);

        let outcome = executor(probe.clone()).run(&processor, &ctx).await.unwrap();
        let JobOutcome::Yield { delay, checkpoint, .. } = outcome else {
            panic!("expected a yield, got {outcome:?}");
        };
        assert_eq!(delay, MEMORY_YIELD_DELAY);
        let saved: ChunkCheckpoint = serde_json::from_value(checkpoint.clone().unwrap()).unwrap();
        assert_eq!(saved.next_offset, 200);
        assert_eq!(saved.processed, 200);
        assert_eq!(saved.peak_memory_bytes, 600 * MB);
        assert_eq!(ledger.get(ctx.job_id()).await.unwrap().unwrap().progress, 20);

        let resumed_ctx = context(ledger, checkpoint).await;
        let resumed = Doubler::new(1000);
        let outcome = executor(Arc::new(ScriptedMemoryProbe::constant(100 * MB)))
            .run(&resumed, &resumed_ctx)
            .await
            .unwrap();
        let JobOutcome::Completed(Some(result)) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(resumed.fetched.lock().unwrap()[0], 200);
        assert_eq!(result["processed_items"], 1000);
        assert_eq!(result["results"].as_array().unwrap().len(), 1000);
        assert_eq!(result["yields"], 1);
    }

    #[test]
    fn heavy_jobs_back_off_five_fifteen_thirty_minutes() {
        let schedule = heavy_backoff();
        let delays: Vec<u64> = (1..=4).map(|a| schedule.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![300, 900, 1800, 1800]);
    }

    #[tokio::test]
    async fn empty_source_completes_immediately() {
        let ledger = InMemoryJobLedger::arc();
        let ctx = context(ledger, None).await;
        let outcome = executor(Arc::new(ScriptedMemoryProbe::constant(0)))
            .run(&Doubler::new(0), &ctx)
            .await
            .unwrap();
        let JobOutcome::Completed(Some(result)) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result["total_items"], 0);
    }
}
