//! Benchmarks for timer state transitions

use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;
use veda_dispatch::prelude::*;

fn bench_suspend_resume(c: &mut Criterion) {
    let timer = RecurringTimer::new(&ExecutionContext::global(Tier::Background));
    timer
        .set_timer(Duration::from_secs(3600), Duration::ZERO)
        .unwrap();

    c.bench_function("timer_resume_suspend", |b| {
        b.iter(|| {
            timer.resume().unwrap();
            timer.suspend().unwrap();
        });
    });

    c.bench_function("timer_idempotent_suspend", |b| {
        b.iter(|| timer.suspend().unwrap());
    });

    timer.cancel();
}

fn bench_rearm(c: &mut Criterion) {
    let timer = RecurringTimer::new(&ExecutionContext::global(Tier::Background));

    c.bench_function("timer_set_interval", |b| {
        b.iter(|| {
            timer
                .set_interval(Duration::from_secs(3600), Duration::from_millis(10))
                .unwrap()
        });
    });
}

fn bench_create_cancel(c: &mut Criterion) {
    let context = ExecutionContext::serial("bench-timers");

    c.bench_function("timer_create_cancel", |b| {
        b.iter(|| {
            let timer = RecurringTimer::new(&context);
            timer.cancel();
        });
    });
}

criterion_group!(benches, bench_suspend_resume, bench_rearm, bench_create_cancel);
criterion_main!(benches);
