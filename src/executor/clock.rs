//! The host clock thread: delayed jobs and timer source deadlines.
//!
//! Entries carry a due time and a leeway. The thread sleeps until the
//! earliest `due + leeway` among all entries, then fires every entry that is
//! due. Nothing fires early, and deadlines close together wake the thread
//! once. Entries of re-armed timer sources are dropped lazily.

use super::job::Job;
use super::source::SourceInner;
use super::{HostShared, Target};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

/// A point in time on either the monotonic or the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Monotonic(Instant),
    /// Follows system clock adjustments.
    Wall(SystemTime),
}

// furthest any deadline or leeway reaches; later means never
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `at + by`, capped at [`FAR_FUTURE`] and below the platform's limit.
fn saturating_add<T: Copy>(at: T, by: Duration, add: impl Fn(T, Duration) -> Option<T>) -> T {
    let mut by = by.min(FAR_FUTURE);
    loop {
        if let Some(sum) = add(at, by) {
            return sum;
        }
        by /= 2;
    }
}

fn instant_after(at: Instant, by: Duration) -> Instant {
    saturating_add(at, by, |at, by| at.checked_add(by))
}

fn wall_after(at: SystemTime, by: Duration) -> SystemTime {
    saturating_add(at, by, |at, by| at.checked_add(by))
}

impl Deadline {
    /// `delay` from now. Delays past a century are treated as a century.
    pub fn after(delay: Duration) -> Self {
        Deadline::Monotonic(instant_after(Instant::now(), delay))
    }

    pub fn is_due(&self) -> bool {
        match *self {
            Deadline::Monotonic(at) => at <= Instant::now(),
            Deadline::Wall(at) => at <= SystemTime::now(),
        }
    }

    /// The first `self + k * interval` (k >= 1) strictly in the future.
    pub(crate) fn next_after(self, interval: Duration) -> Self {
        match self {
            Deadline::Monotonic(at) => {
                let now = Instant::now();
                let behind = now.saturating_duration_since(at);
                Deadline::Monotonic(instant_after(at, skip(behind, interval)))
            }
            Deadline::Wall(at) => {
                let behind = SystemTime::now()
                    .duration_since(at)
                    .unwrap_or(Duration::ZERO);
                Deadline::Wall(wall_after(at, skip(behind, interval)))
            }
        }
    }
}

fn skip(behind: Duration, interval: Duration) -> Duration {
    let periods = behind.as_nanos() / interval.as_nanos() + 1;
    let nanos = interval.as_nanos().saturating_mul(periods);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

pub(crate) enum Wake {
    Job {
        target: Target,
        job: Job,
    },
    Source {
        source: Weak<SourceInner>,
        generation: u64,
        epoch: Arc<AtomicU64>,
    },
}

impl Wake {
    /// False once the source was re-armed, cancelled or dropped.
    fn is_live(&self) -> bool {
        match self {
            Wake::Job { .. } => true,
            Wake::Source {
                source,
                generation,
                epoch,
            } => source.strong_count() > 0 && epoch.load(AtomicOrdering::Acquire) == *generation,
        }
    }
}

// heap size below which stale timer entries are left to expire on their own
const COMPACT_THRESHOLD: usize = 256;

struct Entry<T> {
    due: T,
    latest: T,
    seq: u64,
    wake: Wake,
}

// min-heap on (due, seq)
impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T: Ord> Eq for Entry<T> {}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct ClockState {
    monotonic: BinaryHeap<Entry<Instant>>,
    wall: BinaryHeap<Entry<SystemTime>>,
    seq: u64,
    compact_at: usize,
    shutdown: bool,
}

pub(crate) struct Clock {
    state: Mutex<ClockState>,
    cvar: Condvar,
    wall_resolution: Duration,
}

impl Clock {
    pub(crate) fn new(wall_resolution: Duration) -> Self {
        Self {
            state: Mutex::new(ClockState::default()),
            cvar: Condvar::new(),
            wall_resolution,
        }
    }

    pub(crate) fn schedule(&self, deadline: Deadline, leeway: Duration, wake: Wake) {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        match deadline {
            Deadline::Monotonic(due) => state.monotonic.push(Entry {
                due,
                latest: instant_after(due, leeway),
                seq,
                wake,
            }),
            Deadline::Wall(due) => state.wall.push(Entry {
                due,
                latest: wall_after(due, leeway),
                seq,
                wake,
            }),
        }

        let len = state.monotonic.len() + state.wall.len();
        if len > state.compact_at.max(COMPACT_THRESHOLD) {
            state.monotonic.retain(|e| e.wake.is_live());
            state.wall.retain(|e| e.wake.is_live());
            state.compact_at = 2 * (state.monotonic.len() + state.wall.len());
        }
        self.cvar.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock();
        state.monotonic.len() + state.wall.len()
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cvar.notify_all();
    }

    /// Drops every pending entry. Only called once the clock thread is gone.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.monotonic.clear();
        state.wall.clear();
    }

    /// Clock thread body.
    pub(crate) fn run(&self, host: &HostShared) {
        loop {
            let due = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }

                    let due = Self::take_due(&mut state);
                    if !due.is_empty() {
                        break due;
                    }

                    match self.wake_time(&state) {
                        Some(at) => {
                            self.cvar.wait_until(&mut state, at);
                        }
                        None => self.cvar.wait(&mut state),
                    }
                }
            };

            for wake in due {
                fire(host, wake);
            }
        }
    }

    fn take_due(state: &mut ClockState) -> Vec<Wake> {
        let mut due = Vec::new();

        let now = Instant::now();
        while state.monotonic.peek().is_some_and(|e| e.due <= now) {
            if let Some(entry) = state.monotonic.pop() {
                due.push(entry.wake);
            }
        }

        let wall_now = SystemTime::now();
        while state.wall.peek().is_some_and(|e| e.due <= wall_now) {
            if let Some(entry) = state.wall.pop() {
                due.push(entry.wake);
            }
        }

        due
    }

    fn wake_time(&self, state: &ClockState) -> Option<Instant> {
        let monotonic = state.monotonic.iter().map(|e| e.latest).min();

        let wall = state.wall.iter().map(|e| e.latest).min().map(|latest| {
            let wait = latest
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            Instant::now() + wait.min(self.wall_resolution)
        });

        match (monotonic, wall) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn fire(host: &HostShared, wake: Wake) {
    match wake {
        Wake::Job { target, job } => target.submit(host, job),
        Wake::Source {
            source, generation, ..
        } => {
            if let Some(source) = source.upgrade() {
                source.on_due(generation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Tier;

    fn noop() -> Wake {
        Wake::Job {
            target: Target::Tier(Tier::Default),
            job: Job::new(|| {}),
        }
    }

    #[test]
    fn test_take_due_only_pops_expired() {
        let clock = Clock::new(Duration::from_millis(50));
        let now = Instant::now();
        clock.schedule(Deadline::Monotonic(now - Duration::from_millis(1)), Duration::ZERO, noop());
        clock.schedule(Deadline::Monotonic(now + Duration::from_secs(60)), Duration::ZERO, noop());

        let mut state = clock.state.lock();
        assert_eq!(Clock::take_due(&mut state).len(), 1);
        assert_eq!(state.monotonic.len(), 1);
    }

    #[test]
    fn test_wake_time_honours_leeway_of_every_entry() {
        let clock = Clock::new(Duration::from_millis(50));
        let now = Instant::now();
        // earliest due but generous leeway
        clock.schedule(
            Deadline::Monotonic(now + Duration::from_millis(10)),
            Duration::from_millis(100),
            noop(),
        );
        // later due, no leeway
        clock.schedule(
            Deadline::Monotonic(now + Duration::from_millis(30)),
            Duration::ZERO,
            noop(),
        );

        let state = clock.state.lock();
        assert_eq!(
            clock.wake_time(&state),
            Some(now + Duration::from_millis(30))
        );
    }

    #[test]
    fn test_wall_wake_time_is_capped_by_resolution() {
        let clock = Clock::new(Duration::from_millis(20));
        clock.schedule(
            Deadline::Wall(SystemTime::now() + Duration::from_secs(3600)),
            Duration::ZERO,
            noop(),
        );

        let before = Instant::now();
        let state = clock.state.lock();
        let at = clock.wake_time(&state).unwrap();
        assert!(at <= Instant::now() + Duration::from_millis(20));
        assert!(at >= before);
    }

    #[test]
    fn test_next_after_skips_missed_periods() {
        let start = Instant::now() - Duration::from_millis(350);
        let next = Deadline::Monotonic(start).next_after(Duration::from_millis(100));

        match next {
            Deadline::Monotonic(at) => {
                assert_eq!(at - start, Duration::from_millis(400));
                assert!(at > Instant::now());
            }
            Deadline::Wall(_) => unreachable!(),
        }
    }

    #[test]
    fn test_next_after_future_deadline_adds_one_interval() {
        let start = Instant::now() + Duration::from_secs(10);
        let next = Deadline::Monotonic(start).next_after(Duration::from_secs(1));
        assert_eq!(next, Deadline::Monotonic(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_huge_delay_and_leeway_saturate() {
        let clock = Clock::new(Duration::from_millis(50));
        let never = Deadline::after(Duration::MAX);
        assert!(!never.is_due());

        clock.schedule(never, Duration::MAX, noop());
        clock.schedule(
            Deadline::Wall(SystemTime::now()).next_after(Duration::MAX),
            Duration::MAX,
            noop(),
        );
        assert_eq!(clock.len(), 2);

        let mut state = clock.state.lock();
        assert!(Clock::take_due(&mut state).is_empty());
    }

    #[test]
    fn test_stale_source_entries_are_compacted() {
        let clock = Clock::new(Duration::from_millis(50));
        let far = Deadline::after(Duration::from_secs(3600));
        let epoch = Arc::new(AtomicU64::new(0));

        for generation in 0..COMPACT_THRESHOLD as u64 {
            let wake = Wake::Source {
                source: Weak::new(),
                generation,
                epoch: epoch.clone(),
            };
            clock.schedule(far, Duration::ZERO, wake);
        }
        assert_eq!(clock.len(), COMPACT_THRESHOLD);

        clock.schedule(far, Duration::ZERO, noop());
        assert_eq!(clock.len(), 1);
    }
}
