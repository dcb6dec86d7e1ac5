//! Process memory sampling for heavy jobs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Samples the worker's memory usage.
pub trait MemoryProbe: Send + Sync {
    /// Current usage in bytes.
    fn sample(&self) -> u64;

    /// Ask the process to give memory back before re-sampling.
    fn reclaim(&self) {}
}

/// Reads the resident set size from the `VmRSS` line of `/proc/self/status`.
/// The kernel reports it in kB, so the host page size does not matter.
/// Reports 0 where that file does not exist.
///
/// `reclaim` keeps the default no-op: Rust has no collector to force, and
/// memory freed by the processor is already returned when its chunk drops.
/// A reading that stays over the threshold therefore always yields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self
    }

    fn parse_status(contents: &str) -> Option<u64> {
        let line = contents.lines().find(|line| line.starts_with("VmRSS:"))?;
        let mut fields = line["VmRSS:".len()..].split_whitespace();
        let value: u64 = fields.next()?.parse().ok()?;
        match fields.next() {
            Some("kB") | None => Some(value.saturating_mul(1024)),
            Some(_) => None,
        }
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|contents| Self::parse_status(&contents))
            .unwrap_or(0)
    }
}

/// Probe that replays a fixed sequence of readings; the last reading repeats.
#[derive(Debug, Default)]
pub struct ScriptedMemoryProbe {
    readings: Vec<u64>,
    cursor: AtomicU64,
    reclaims: AtomicU64,
}

impl ScriptedMemoryProbe {
    pub fn new(readings: Vec<u64>) -> Self {
        Self {
            readings,
            cursor: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    /// Constant reading.
    pub fn constant(bytes: u64) -> Self {
        Self::new(vec![bytes])
    }

    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for ScriptedMemoryProbe {
    fn sample(&self) -> u64 {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        self.readings
            .get(idx)
            .or_else(|| self.readings.last())
            .copied()
            .unwrap_or(0)
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}
