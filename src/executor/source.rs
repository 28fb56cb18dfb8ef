//! Periodic trigger primitive.
//!
//! `RawTimer` behaves like a kernel timer source: it is created suspended
//! (suspend count 1), every `resume` must match an earlier `suspend`, and it
//! must be running when it is cancelled. Breaking any of these rules is a
//! fatal misuse and panics. Higher layers that need idempotent transitions
//! keep their own state in front of it (see
//! [`RecurringTimer`](crate::dispatch::RecurringTimer)).

use super::clock::{Deadline, Wake};
use super::job::Job;
use super::{HostShared, Target};
use crate::util::ScopeGuard;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Handler = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy)]
struct Schedule {
    next: Deadline,
    interval: Duration,
    leeway: Duration,
}

struct SourceState {
    suspend_count: usize,
    cancelled: bool,
    handler: Option<Handler>,
    schedule: Option<Schedule>,
    /// Bumped on every re-arm so stale clock entries are ignored.
    generation: u64,
    armed: bool,
    /// A deadline passed while suspended or while the handler was running.
    pending: bool,
    firing: bool,
    fire_count: u64,
}

pub(crate) struct SourceInner {
    host: Arc<HostShared>,
    target: Target,
    state: Mutex<SourceState>,
    /// Mirror of `SourceState::generation` the clock reads without locking.
    epoch: Arc<AtomicU64>,
}

impl SourceInner {
    /// Called by the clock thread when a deadline for `generation` passes.
    pub(crate) fn on_due(self: &Arc<Self>, generation: u64) {
        let launch = {
            let mut state = self.state.lock();
            if state.cancelled || state.generation != generation {
                return;
            }
            state.armed = false;

            state.schedule = state.schedule.and_then(|schedule| {
                if schedule.interval.is_zero() {
                    None
                } else {
                    Some(Schedule {
                        next: schedule.next.next_after(schedule.interval),
                        ..schedule
                    })
                }
            });

            if state.suspend_count > 0 {
                state.pending = true;
                return;
            }

            self.arm(&mut state);
            Self::deliver(&mut state)
        };

        if launch {
            self.launch();
        }
    }

    fn arm(self: &Arc<Self>, state: &mut SourceState) {
        if let Some(schedule) = state.schedule {
            self.host.clock.schedule(
                schedule.next,
                schedule.leeway,
                Wake::Source {
                    source: Arc::downgrade(self),
                    generation: state.generation,
                    epoch: self.epoch.clone(),
                },
            );
            state.armed = true;
        }
    }

    /// Returns whether a fire job must be launched; a firing already in
    /// progress picks the delivery up when its handler returns.
    fn deliver(state: &mut SourceState) -> bool {
        if state.firing {
            state.pending = true;
            false
        } else {
            state.firing = true;
            true
        }
    }

    fn launch(self: &Arc<Self>) {
        let source = self.clone();
        self.target
            .submit(&self.host, Job::new(move || source.fire()));
    }

    fn fire(&self) {
        loop {
            let handler = {
                let mut state = self.state.lock();
                if state.cancelled {
                    state.firing = false;
                    return;
                }
                if state.suspend_count > 0 {
                    state.pending = true;
                    state.firing = false;
                    return;
                }
                state.fire_count += 1;
                state.handler.clone()
            };

            let mut reset = ScopeGuard::new(|| self.state.lock().firing = false);
            if let Some(handler) = handler {
                handler();
            }
            reset.disarm();

            let mut state = self.state.lock();
            if state.pending && !state.cancelled && state.suspend_count == 0 {
                state.pending = false;
                continue;
            }
            state.firing = false;
            return;
        }
    }
}

/// Handle to a periodic trigger bound to a target.
#[derive(Clone)]
pub struct RawTimer {
    inner: Arc<SourceInner>,
}

impl RawTimer {
    pub(crate) fn new(host: Arc<HostShared>, target: Target) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                host,
                target,
                state: Mutex::new(SourceState {
                    suspend_count: 1,
                    cancelled: false,
                    handler: None,
                    schedule: None,
                    generation: 0,
                    armed: false,
                    pending: false,
                    firing: false,
                    fire_count: 0,
                }),
                epoch: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn set_event_handler(&self, handler: Option<Handler>) {
        self.inner.state.lock().handler = handler;
    }

    /// Re-arms the trigger: first deadline `start`, then every `interval`.
    /// A zero interval fires once. Suspension state is untouched.
    pub fn set_timer(&self, start: Deadline, interval: Duration, leeway: Duration) {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return;
        }

        state.generation += 1;
        self.inner.epoch.store(state.generation, Ordering::Release);
        state.armed = false;
        state.pending = false;
        state.schedule = Some(Schedule {
            next: start,
            interval,
            leeway,
        });

        if state.suspend_count == 0 {
            self.inner.arm(&mut state);
        }
    }

    pub fn suspend(&self) {
        let mut state = self.inner.state.lock();
        state.suspend_count += 1;
        tracing::trace!(count = state.suspend_count, "timer source suspended");
    }

    /// # Panics
    ///
    /// Panics if the source is not suspended.
    pub fn resume(&self) {
        let launch = {
            let mut state = self.inner.state.lock();
            assert!(
                state.suspend_count > 0,
                "timer source resumed more times than it was suspended"
            );
            state.suspend_count -= 1;
            tracing::trace!(count = state.suspend_count, "timer source resumed");

            if state.suspend_count > 0 || state.cancelled {
                return;
            }

            let mut launch = false;
            if state.pending {
                state.pending = false;
                if let Some(schedule) = state.schedule.as_mut() {
                    if schedule.next.is_due() && !schedule.interval.is_zero() {
                        schedule.next = schedule.next.next_after(schedule.interval);
                    }
                }
                launch = SourceInner::deliver(&mut state);
            }
            if !state.armed {
                self.inner.arm(&mut state);
            }
            launch
        };

        if launch {
            self.inner.launch();
        }
    }

    /// Stops the trigger for good. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the source is suspended.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        assert!(
            state.suspend_count == 0,
            "timer source cancelled while suspended"
        );
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.handler = None;
        state.schedule = None;
        state.generation += 1;
        self.inner.epoch.store(state.generation, Ordering::Release);
        tracing::trace!("timer source cancelled");
    }

    pub fn suspend_count(&self) -> usize {
        self.inner.state.lock().suspend_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Handler invocations started so far.
    pub fn fire_count(&self) -> u64 {
        self.inner.state.lock().fire_count
    }
}

impl fmt::Debug for RawTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RawTimer")
            .field("target", &self.inner.target)
            .field("suspend_count", &state.suspend_count)
            .field("cancelled", &state.cancelled)
            .field("schedule", &state.schedule)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::executor::{Host, Tier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn host() -> Host {
        Host::new(HostConfig::builder().num_threads(2).build().unwrap()).unwrap()
    }

    fn counting(timer: &RawTimer) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        timer.set_event_handler(Some(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })));
        count
    }

    #[test]
    fn test_created_suspended() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::Default));
        assert_eq!(timer.suspend_count(), 1);

        let count = counting(&timer);
        timer.set_timer(Deadline::after(Duration::ZERO), Duration::from_millis(5), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        timer.resume();
        std::thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) >= 1);

        timer.cancel();
    }

    #[test]
    #[should_panic(expected = "resumed more times")]
    fn test_over_resume_panics() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::Default));
        timer.resume();
        timer.resume();
    }

    #[test]
    #[should_panic(expected = "cancelled while suspended")]
    fn test_cancel_while_suspended_panics() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::Default));
        timer.cancel();
    }

    #[test]
    fn test_zero_interval_fires_once() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::Default));
        let count = counting(&timer);

        timer.set_timer(Deadline::after(Duration::from_millis(5)), Duration::ZERO, Duration::ZERO);
        timer.resume();
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        timer.cancel();
    }

    #[test]
    fn test_never_fires_early() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::UserInitiated));
        let (tx, rx) = crossbeam_channel::unbounded();
        timer.set_event_handler(Some(Arc::new(move || {
            let _ = tx.send(Instant::now());
        })));

        let armed = Instant::now();
        timer.set_timer(Deadline::after(Duration::from_millis(40)), Duration::from_secs(60), Duration::ZERO);
        timer.resume();

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired - armed >= Duration::from_millis(40));
        timer.cancel();
    }

    #[test]
    fn test_missed_deadlines_coalesce_while_suspended() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::Default));
        let count = counting(&timer);

        timer.set_timer(Deadline::after(Duration::ZERO), Duration::from_millis(20), Duration::ZERO);
        timer.resume();
        std::thread::sleep(Duration::from_millis(30));
        timer.suspend();
        std::thread::sleep(Duration::from_millis(20));
        let before = count.load(Ordering::SeqCst);

        // ten periods elapse while suspended
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), before);

        timer.resume();
        let deadline = Instant::now() + Duration::from_secs(1);
        while count.load(Ordering::SeqCst) == before && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let after = count.load(Ordering::SeqCst);
        assert!(after > before);
        assert!(after - before <= 3, "missed periods were replayed: {}", after - before);

        timer.cancel();
    }

    #[test]
    fn test_cancel_stops_firing() {
        let host = host();
        let timer = host.timer(Target::Tier(Tier::Default));
        let count = counting(&timer);

        timer.set_timer(Deadline::after(Duration::ZERO), Duration::from_millis(2), Duration::ZERO);
        timer.resume();
        std::thread::sleep(Duration::from_millis(20));
        timer.cancel();
        std::thread::sleep(Duration::from_millis(10));

        let frozen = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), frozen);
        assert!(timer.is_cancelled());

        // idempotent
        timer.cancel();
    }
}
