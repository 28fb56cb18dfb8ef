//! Fan-out on a host whose workers are all busy
//!
//! Lives in its own test binary so the global host can be initialised with a
//! small pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use veda_dispatch::dispatch::probe;
use veda_dispatch::prelude::*;

#[test]
fn test_apply_concurrently_completes_when_every_worker_is_busy() {
    init_with_config(HostConfig::builder().num_threads(2).build().unwrap()).unwrap();

    let barrier = JoinBarrier::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let on_context = Arc::new(AtomicUsize::new(0));

    // Both workers block inside apply_concurrently, so no helper job can
    // start and the callers must run every invocation themselves.
    for _ in 0..2 {
        let hits = hits.clone();
        let on_context = on_context.clone();
        barrier.async_into(&ExecutionContext::global(Tier::Default), move || {
            let fan = ExecutionContext::concurrent("fan");
            let current = fan.clone();
            fan.apply_concurrently(4, move |_| {
                if probe::is_current(&current) {
                    on_context.fetch_add(1, Ordering::SeqCst);
                }
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });
    }

    assert_eq!(barrier.wait_timeout(Duration::from_secs(10)), WaitResult::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 8);
    assert_eq!(on_context.load(Ordering::SeqCst), 8);
}
