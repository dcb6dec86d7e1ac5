//! Periodic loops: the reminder scheduler tick and the health monitor cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use taskpulse_infra::monitor::QueueHealthMonitor;
use taskpulse_infra::reminders::ReminderRuleEngine;

/// Run `dispatch_due_notifications` every `tick` until shutdown.
pub fn spawn_scheduler(
    engine: Arc<ReminderRuleEngine>,
    tick: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("reminder-scheduler", tick, shutdown, move || {
        let engine = engine.clone();
        async move {
            if let Err(err) = engine.dispatch_due_notifications(false).await {
                error!(error = %err, "reminder dispatch failed");
            }
        }
    })
}

/// Run `monitor_and_alert` every `interval` until shutdown.
pub fn spawn_monitor(
    monitor: Arc<QueueHealthMonitor>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("queue-monitor", interval, shutdown, move || {
        let monitor = monitor.clone();
        async move {
            if let Err(err) = monitor.monitor_and_alert().await {
                error!(error = %err, "queue health check failed");
            }
        }
    })
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(task = name, period_ms = period.as_millis() as u64, "periodic task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(task = name, "periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_each_period_until_shutdown() {
        let runs = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let counter = runs.clone();
        let handle = spawn_periodic("test", Duration::from_secs(10), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // First tick fires immediately, then one per period.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
