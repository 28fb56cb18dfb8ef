//! Stress tests for the dispatch layer

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use veda_dispatch::prelude::*;

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_many_small_jobs() {
    let context = ExecutionContext::concurrent("stress-small");
    let barrier = JoinBarrier::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..100_000 {
        let counter = counter.clone();
        barrier.async_into(&context, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    barrier.wait();
    assert_eq!(counter.load(Ordering::Relaxed), 100_000);
}

#[test]
#[ignore]
fn stress_test_nested_fan_out() {
    let outer = ExecutionContext::concurrent("stress-outer");
    let inner = ExecutionContext::serial("stress-inner");
    let barrier = JoinBarrier::new();
    let counter = Arc::new(Mutex::new(0));

    for _ in 0..100 {
        let inner = inner.clone();
        let nested = barrier.clone();
        let counter = counter.clone();
        barrier.async_into(&outer, move || {
            for _ in 0..100 {
                let counter = counter.clone();
                nested.async_into(&inner, move || *counter.lock() += 1);
            }
        });
    }

    barrier.wait();
    assert_eq!(*counter.lock(), 10_000);
}

#[test]
#[ignore]
fn stress_test_timer_suspend_resume_storm() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    let timer = RecurringTimer::start(
        &ExecutionContext::global(Tier::Default),
        Duration::from_micros(500),
        Duration::ZERO,
        move || {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        },
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let timer = timer.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    if i % 2 == 0 {
                        timer.resume().unwrap();
                    } else {
                        timer.suspend().unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let expected = if timer.is_suspended() { 1 } else { 0 };
    assert_eq!(timer.raw().suspend_count(), expected);
    timer.cancel();
    assert!(fired.load(Ordering::Relaxed) > 0);
}

#[test]
#[ignore]
fn stress_test_many_timers() {
    let fired = Arc::new(AtomicUsize::new(0));
    let timers: Vec<_> = (0..500)
        .map(|i| {
            let fired = fired.clone();
            RecurringTimer::start(
                &ExecutionContext::global(Tier::Utility),
                Duration::from_millis(1 + (i % 10)),
                Duration::from_millis(1),
                move || {
                    fired.fetch_add(1, Ordering::Relaxed);
                },
            )
        })
        .collect();

    thread::sleep(Duration::from_millis(200));
    drop(timers);

    let frozen = fired.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(50));
    assert!(frozen >= 500);
    assert!(fired.load(Ordering::Relaxed) - frozen < 500);
}

#[test]
#[ignore]
fn stress_test_semaphore_fairness() {
    let semaphore = CountingSemaphore::new(4);
    let barrier = JoinBarrier::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let context = ExecutionContext::concurrent("stress-semaphore");

    for _ in 0..2_000 {
        let semaphore = semaphore.clone();
        let active = active.clone();
        let peak = peak.clone();
        barrier.async_into(&context, move || {
            semaphore.wait();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            active.fetch_sub(1, Ordering::SeqCst);
            semaphore.signal();
        });
    }

    barrier.wait();
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(semaphore.available(), 4);
}
