//! Process wiring: backends, job registry, worker pool and periodic loops.
//!
//! `App::connect` picks backends from `AppConfig::persistence`:
//! - `InMemory`: in-process stores and broker (dev/test)
//! - `Durable`: Postgres stores and ledger; Redis broker when a Redis URL is
//!   set and the `redis` feature is enabled, otherwise the in-process broker

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskpulse_infra::broker::{Broker, BrokerError, InMemoryBroker};
use taskpulse_infra::config::{AppConfig, Persistence, QueueTable};
use taskpulse_infra::jobs::{
    ChunkedExecutor, FailedJobStore, InMemoryJobLedger, JobLedger, JobRegistry, JobRunner, MemoryProbe,
    PostgresJobLedger, ProcessMemoryProbe, WorkerPool, WorkerPoolHandle,
};
use taskpulse_infra::monitor::{AlertSink, LogAlertSink, QueueHealthMonitor};
use taskpulse_infra::reminders::{
    ChannelDispatcher, DeliveryDeps, EmailSender, InAppSender, InMemoryReminderStore, LogMailTransport, MailTransport,
    NotificationDeliveryJob, PostgresReminderStore, ReminderBackfillProcessor, ReminderRuleEngine, ReminderStore,
};
use taskpulse_reminders::Channel;

use crate::scheduler;
use crate::service::{BackfillDeps, JobService};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Storage and queue backends.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ReminderStore>,
    pub broker: Arc<dyn Broker>,
    pub ledger: Arc<dyn JobLedger>,
    pub failed: Arc<dyn FailedJobStore>,
}

impl Backends {
    pub fn in_memory(queues: Arc<QueueTable>) -> Self {
        let ledger = InMemoryJobLedger::arc();
        Self {
            store: InMemoryReminderStore::arc(),
            broker: InMemoryBroker::arc(queues),
            ledger: ledger.clone(),
            failed: ledger,
        }
    }

    pub async fn connect(config: &AppConfig, queues: Arc<QueueTable>) -> Result<Self, AppError> {
        let (database_url, redis_url) = match &config.persistence {
            Persistence::InMemory => return Ok(Self::in_memory(queues)),
            Persistence::Durable {
                database_url,
                redis_url,
            } => (database_url, redis_url),
        };

        let pool = sqlx::PgPool::connect(database_url).await?;
        let ledger = Arc::new(PostgresJobLedger::new(pool.clone()));
        let store = Arc::new(PostgresReminderStore::new(pool));
        let broker = connect_broker(redis_url.as_deref(), queues).await?;
        info!("durable backends connected");

        Ok(Self {
            store,
            broker,
            ledger: ledger.clone(),
            failed: ledger,
        })
    }
}

#[cfg(feature = "redis")]
async fn connect_broker(redis_url: Option<&str>, queues: Arc<QueueTable>) -> Result<Arc<dyn Broker>, AppError> {
    match redis_url {
        Some(url) => Ok(Arc::new(taskpulse_infra::broker::RedisBroker::connect(url, queues).await?)),
        None => {
            warn!("REDIS_URL not set; using the in-process broker");
            Ok(InMemoryBroker::arc(queues))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(redis_url: Option<&str>, queues: Arc<QueueTable>) -> Result<Arc<dyn Broker>, AppError> {
    if redis_url.is_some() {
        warn!("REDIS_URL set but redis feature not enabled, falling back to the in-process broker");
    }
    Ok(InMemoryBroker::arc(queues))
}

/// Builds an `App` with replaceable mail, memory and alert collaborators.
///
/// There is no SMTP client in this workspace. Deployments that send email
/// must inject their transport with `with_mail_transport`; without one the
/// email channel falls back to `LogMailTransport`, which only logs the mail.
pub struct AppBuilder {
    config: AppConfig,
    backends: Backends,
    mail: Option<Arc<dyn MailTransport>>,
    probe: Arc<dyn MemoryProbe>,
    alerts: Arc<dyn AlertSink>,
}

impl AppBuilder {
    pub fn with_mail_transport(mut self, mail: Arc<dyn MailTransport>) -> Self {
        self.mail = Some(mail);
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn build(self) -> App {
        let Self {
            config,
            backends,
            mail,
            probe,
            alerts,
        } = self;
        let queues = Arc::new(config.queues.clone());
        let mail_configured = mail.is_some();
        let mail = mail.unwrap_or_else(|| {
            warn!("no mail transport configured, email reminders are only logged");
            Arc::new(LogMailTransport) as Arc<dyn MailTransport>
        });

        let channels = ChannelDispatcher::new()
            .with(Channel::Email, Arc::new(EmailSender::new(mail, config.mail_from.clone())))
            .with(Channel::InApp, Arc::new(InAppSender::new(backends.store.clone())));
        let deps = Arc::new(DeliveryDeps {
            store: backends.store.clone(),
            channels: Arc::new(channels),
            dedup_window: config.dedup_window,
        });
        let executor = Arc::new(ChunkedExecutor::new(config.heavy, probe));

        let mut registry = JobRegistry::new();
        NotificationDeliveryJob::register(&mut registry, deps);
        ReminderBackfillProcessor::register(&mut registry, backends.store.clone(), executor.clone());
        info!(job_types = ?registry.job_types(), "job registry ready");

        let runner = Arc::new(JobRunner::new(
            backends.broker.clone(),
            backends.ledger.clone(),
            backends.failed.clone(),
            Arc::new(registry),
            queues.clone(),
        ));
        let engine = Arc::new(ReminderRuleEngine::new(
            backends.store.clone(),
            backends.broker.clone(),
            config.dedup_window,
        ));
        let monitor = Arc::new(
            QueueHealthMonitor::new(
                backends.broker.clone(),
                backends.ledger.clone(),
                backends.failed.clone(),
                queues.clone(),
                config.monitor.clone(),
            )
            .with_sink(alerts),
        );

        App {
            config,
            mail_configured,
            queues,
            backends,
            executor,
            runner,
            engine,
            monitor,
        }
    }
}

pub struct App {
    config: AppConfig,
    mail_configured: bool,
    queues: Arc<QueueTable>,
    backends: Backends,
    executor: Arc<ChunkedExecutor>,
    runner: Arc<JobRunner>,
    engine: Arc<ReminderRuleEngine>,
    monitor: Arc<QueueHealthMonitor>,
}

impl App {
    pub fn builder(config: AppConfig, backends: Backends) -> AppBuilder {
        AppBuilder {
            config,
            backends,
            mail: None,
            probe: Arc::new(ProcessMemoryProbe::new()),
            alerts: Arc::new(LogAlertSink),
        }
    }

    /// Connect the backends named by the configuration and wire everything.
    pub async fn connect(config: AppConfig) -> Result<Self, AppError> {
        let queues = Arc::new(config.queues.clone());
        let backends = Backends::connect(&config, queues).await?;
        Ok(Self::builder(config, backends).build())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// False when email falls back to `LogMailTransport`.
    pub fn sends_mail(&self) -> bool {
        self.mail_configured
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn engine(&self) -> &Arc<ReminderRuleEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<QueueHealthMonitor> {
        &self.monitor
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn executor(&self) -> &Arc<ChunkedExecutor> {
        &self.executor
    }

    pub fn job_service(&self) -> JobService {
        JobService::new(
            self.engine.clone(),
            self.backends.ledger.clone(),
            self.monitor.clone(),
            BackfillDeps {
                broker: self.backends.broker.clone(),
                store: self.backends.store.clone(),
                executor: self.executor.clone(),
            },
        )
    }

    /// Spawn the worker pool, the reminder scheduler and the health monitor.
    pub fn start(&self) -> RunningApp {
        let pool = WorkerPool::new(self.runner.clone(), self.queues.clone()).spawn();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loops = vec![
            scheduler::spawn_scheduler(self.engine.clone(), self.config.scheduler_tick, shutdown_rx.clone()),
            scheduler::spawn_monitor(self.monitor.clone(), self.config.monitor_interval, shutdown_rx),
        ];
        info!(
            workers = pool.worker_count(),
            scheduler_tick_secs = self.config.scheduler_tick.as_secs(),
            monitor_interval_secs = self.config.monitor_interval.as_secs(),
            "taskpulse worker running"
        );
        RunningApp {
            pool,
            shutdown: shutdown_tx,
            loops,
        }
    }
}

/// Handle to a started `App`.
pub struct RunningApp {
    pool: WorkerPoolHandle,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl RunningApp {
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Stop the periodic loops, then drain the workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            if let Err(err) = handle.await {
                warn!(error = %err, "periodic task ended abnormally");
            }
        }
        self.pool.shutdown().await;
    }
}
