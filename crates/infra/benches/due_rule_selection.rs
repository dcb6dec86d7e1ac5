use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use chrono::{Duration, Utc};
use taskpulse_core::{TaskId, UserId};
use taskpulse_infra::broker::InMemoryBroker;
use taskpulse_infra::config::QueueTable;
use taskpulse_infra::reminders::{InMemoryReminderStore, ReminderRuleEngine, ReminderStore};
use taskpulse_reminders::{
    Channel, NewRule, OffsetUnit, ReminderDefaults, ReminderRule, TaskSnapshot, UserSnapshot,
};

/// `n` users with one task and one rule each; every third rule is due.
fn seed(n: usize) -> (Arc<InMemoryReminderStore>, Vec<(ReminderRule, TaskSnapshot)>) {
    let store = InMemoryReminderStore::arc();
    let now = Utc::now();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut pairs = Vec::with_capacity(n);

    for i in 0..n {
        let user = UserSnapshot {
            id: UserId::new(),
            email: format!("user{i}@example.com"),
            name: format!("User {i}"),
            reminder_defaults: ReminderDefaults::default(),
        };
        let due = if i % 3 == 0 {
            now + Duration::minutes(10)
        } else {
            now + Duration::days(2)
        };
        let task = TaskSnapshot {
            id: TaskId::new(),
            user_id: user.id,
            title: format!("task {i}"),
            due_date: Some(due),
        };
        let rule = ReminderRule::create(
            NewRule {
                user_id: user.id,
                task_id: task.id,
                channel: Channel::Email,
                offset: 30,
                unit: OffsetUnit::Minutes,
                enabled: true,
            },
            now,
        )
        .unwrap();
        store.upsert_user(user).unwrap();
        store.upsert_task(task.clone()).unwrap();
        rt.block_on(store.insert_rule(&rule)).unwrap();
        pairs.push((rule, task));
    }
    (store, pairs)
}

fn bench_is_due_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("is_due_filter");
    let window = Duration::hours(1);

    for size in [100, 1_000, 10_000].iter() {
        let (_, pairs) = seed(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let now = Utc::now();
            b.iter(|| {
                black_box(
                    pairs
                        .iter()
                        .filter(|(rule, task)| rule.is_due(task, now, window))
                        .count(),
                )
            });
        });
    }
    group.finish();
}

fn bench_engine_due_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_get_due_rules");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for size in [100, 1_000, 10_000].iter() {
        let (store, _) = seed(*size);
        let broker = InMemoryBroker::arc(Arc::new(QueueTable::default()));
        let engine = ReminderRuleEngine::new(store, broker, Duration::hours(1));
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(rt.block_on(engine.get_due_rules()).unwrap().len()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_is_due_filter, bench_engine_due_rules);
criterion_main!(benches);
