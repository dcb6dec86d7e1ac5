//! Configuration loading and representation.
//!
//! Everything comes from environment variables with production defaults.
//! `from_lookup` takes any key lookup so tests never touch the process env.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::monitor::MonitorConfig;

pub const DEFAULT_QUEUE: &str = "default";
pub const NOTIFICATIONS_QUEUE: &str = "notifications";
pub const HEAVY_QUEUE: &str = "heavy";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

/// Per-queue broker and worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// Visibility timeout of a leased job; an unacknowledged lease becomes leasable again after this.
    pub retry_after: Duration,
    pub max_attempts: u32,
    /// Per-attempt execution limit.
    pub timeout: Duration,
    pub workers: usize,
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, retry_after_secs: u64, max_attempts: u32, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            retry_after: Duration::from_secs(retry_after_secs),
            max_attempts,
            timeout: Duration::from_secs(timeout_secs),
            workers: 1,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Named queue table. Lookups of unknown queues fall back to `default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTable {
    queues: BTreeMap<String, QueueConfig>,
}

impl QueueTable {
    pub fn empty() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, queue: QueueConfig) {
        self.queues.insert(queue.name.clone(), queue);
    }

    pub fn with(mut self, queue: QueueConfig) -> Self {
        self.insert(queue);
        self
    }

    pub fn get(&self, name: &str) -> QueueConfig {
        self.queues
            .get(name)
            .or_else(|| self.queues.get(DEFAULT_QUEUE))
            .cloned()
            .unwrap_or_else(|| QueueConfig::new(name, 90, 3, 60))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueConfig> {
        self.queues.values()
    }
}

impl Default for QueueTable {
    fn default() -> Self {
        Self::empty()
            .with(QueueConfig::new(DEFAULT_QUEUE, 90, 3, 60))
            .with(QueueConfig::new(NOTIFICATIONS_QUEUE, 90, 3, 60).with_workers(2))
            .with(QueueConfig::new(HEAVY_QUEUE, 600, 3, 300))
    }
}

/// Chunking and memory limits for heavy jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeavyJobConfig {
    pub chunk_size: usize,
    pub memory_threshold_bytes: u64,
}

impl Default for HeavyJobConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            memory_threshold_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Where state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    InMemory,
    Durable {
        database_url: String,
        /// Without a Redis URL the in-process broker is used.
        redis_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub persistence: Persistence,
    pub dedup_window: chrono::Duration,
    pub scheduler_tick: Duration,
    pub monitor_interval: Duration,
    pub heavy: HeavyJobConfig,
    pub monitor: MonitorConfig,
    pub mail_from: String,
    pub queues: QueueTable,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let persistent = env.parse_or("USE_PERSISTENT_STORES", false)?;
        let persistence = if persistent {
            Persistence::Durable {
                database_url: env.get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                redis_url: env.get("REDIS_URL"),
            }
        } else {
            Persistence::InMemory
        };

        let mut queues = QueueTable::default();
        for name in [DEFAULT_QUEUE, NOTIFICATIONS_QUEUE, HEAVY_QUEUE] {
            let mut queue = queues.get(name);
            let prefix = name.to_ascii_uppercase();
            queue.workers = env.parse_or(&format!("QUEUE_{prefix}_WORKERS"), queue.workers)?.max(1);
            queue.max_attempts = env
                .parse_or(&format!("QUEUE_{prefix}_MAX_ATTEMPTS"), queue.max_attempts)?
                .max(1);
            queues.insert(queue);
        }

        let monitor_defaults = MonitorConfig::default();
        Ok(Self {
            persistence,
            dedup_window: chrono::Duration::seconds(env.parse_or(
                "REMINDER_DEDUP_WINDOW_SECS",
                taskpulse_reminders::DEFAULT_DEDUP_WINDOW_SECS,
            )?),
            scheduler_tick: Duration::from_secs(env.parse_or("SCHEDULER_TICK_SECS", 60)?),
            monitor_interval: Duration::from_secs(env.parse_or("MONITOR_INTERVAL_SECS", 300)?),
            heavy: HeavyJobConfig {
                chunk_size: env.parse_or("HEAVY_CHUNK_SIZE", 100usize)?.max(1),
                memory_threshold_bytes: env.parse_or("HEAVY_MEMORY_THRESHOLD_MB", 512u64)? * 1024 * 1024,
            },
            monitor: MonitorConfig {
                stuck_after: chrono::Duration::seconds(env.parse_or("STUCK_JOB_THRESHOLD_SECS", 3600)?),
                failure_threshold: env
                    .parse_or("FAILURE_ALERT_THRESHOLD", monitor_defaults.failure_threshold)?,
                pending_threshold: env
                    .parse_or("PENDING_ALERT_THRESHOLD", monitor_defaults.pending_threshold)?,
            },
            mail_from: env
                .get("MAIL_FROM")
                .unwrap_or_else(|| "reminders@taskpulse.local".to_string()),
            queues,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            persistence: Persistence::InMemory,
            dedup_window: chrono::Duration::seconds(taskpulse_reminders::DEFAULT_DEDUP_WINDOW_SECS),
            scheduler_tick: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(300),
            heavy: HeavyJobConfig::default(),
            monitor: MonitorConfig::default(),
            mail_from: "reminders@taskpulse.local".to_string(),
            queues: QueueTable::default(),
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: key.to_string(),
                value: raw,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_queue_table() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.persistence, Persistence::InMemory);
        assert_eq!(config.dedup_window, chrono::Duration::hours(1));

        let heavy = config.queues.get(HEAVY_QUEUE);
        assert_eq!(heavy.retry_after, Duration::from_secs(600));
        assert_eq!(heavy.timeout, Duration::from_secs(300));
        assert_eq!(heavy.max_attempts, 3);

        let notifications = config.queues.get(NOTIFICATIONS_QUEUE);
        assert_eq!(notifications.retry_after, Duration::from_secs(90));
        assert_eq!(notifications.timeout, Duration::from_secs(60));
        assert_eq!(config.heavy.memory_threshold_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn unknown_queue_falls_back_to_default() {
        let table = QueueTable::default();
        assert_eq!(table.get("reports").retry_after, Duration::from_secs(90));
    }

    #[test]
    fn persistent_mode_requires_database_url() {
        let err = AppConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let config = AppConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/taskpulse"),
        ]))
        .unwrap();
        assert!(matches!(config.persistence, Persistence::Durable { redis_url: None, .. }));
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = AppConfig::from_lookup(lookup(&[
            ("HEAVY_MEMORY_THRESHOLD_MB", "64"),
            ("QUEUE_HEAVY_WORKERS", "4"),
            ("FAILURE_ALERT_THRESHOLD", "5"),
        ]))
        .unwrap();
        assert_eq!(config.heavy.memory_threshold_bytes, 64 * 1024 * 1024);
        assert_eq!(config.queues.get(HEAVY_QUEUE).workers, 4);
        assert_eq!(config.monitor.failure_threshold, 5);

        let err = AppConfig::from_lookup(lookup(&[("SCHEDULER_TICK_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
