//! Serial and concurrent queues layered over the tier pool.
//!
//! A queue never owns a thread. Whenever it may start an item it wraps the
//! item in a drain job and submits that to its target (a tier or another
//! queue); the drain job reports back when the item finishes so the next
//! one can start.

use super::job::Job;
use super::specific::{self, SpecificKey, SpecificValue};
use super::{run_blocking, HostShared, Target};
use crate::util::ScopeGuard;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// One item at a time, in submission order.
    Serial,
    /// Items may overlap; barrier items run alone.
    Concurrent,
}

struct Item {
    job: Job,
    barrier: bool,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Item>,
    running: usize,
    exclusive_running: bool,
    suspend_count: usize,
}

pub(crate) struct QueueInner {
    label: String,
    kind: QueueKind,
    target: Target,
    host: Arc<HostShared>,
    state: Mutex<QueueState>,
    specifics: RwLock<HashMap<u64, SpecificValue>>,
}

impl QueueInner {
    pub(crate) fn specific_value(&self, key: u64) -> Option<SpecificValue> {
        self.specifics.read().get(&key).cloned()
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        tracing::debug!(label = %self.label, "queue released");
    }
}

/// Handle to a host queue. Clones share the queue; it is torn down once the
/// last handle and the last queued item are gone.
#[derive(Clone)]
pub struct RawQueue {
    inner: Arc<QueueInner>,
}

impl RawQueue {
    pub(crate) fn new(
        host: Arc<HostShared>,
        label: String,
        kind: QueueKind,
        target: Target,
    ) -> Self {
        tracing::debug!(label = %label, ?kind, "queue created");
        Self {
            inner: Arc::new(QueueInner {
                label,
                kind,
                target,
                host,
                state: Mutex::new(QueueState::default()),
                specifics: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn host(&self) -> &Arc<HostShared> {
        &self.inner.host
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn ptr_eq(&self, other: &RawQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks this queue and every queue it targets as executing on the
    /// calling thread until the guard drops, so probes and specifics see the
    /// caller as running on the queue.
    pub(crate) fn enter_chain(&self) -> ScopeGuard<impl FnOnce()> {
        let mut chain = Vec::new();
        let mut next = Some(self.clone());
        while let Some(queue) = next {
            next = match queue.target() {
                Target::Queue(parent) => Some(parent.clone()),
                Target::Tier(_) => None,
            };
            chain.push(queue.inner);
        }
        specific::enter_all(chain.into_iter().rev())
    }

    pub fn enqueue(&self, job: Job) {
        self.push(job, false);
    }

    pub fn enqueue_barrier(&self, job: Job) {
        self.push(job, true);
    }

    /// Runs `f` on this queue and blocks until it returns.
    ///
    /// Calling this from a job already running on the same serial queue (or
    /// on a queue targeting it) deadlocks.
    pub fn sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        run_blocking(|job| self.push(job, false), f)
    }

    /// Like [`sync`](Self::sync) but as a barrier item.
    pub fn sync_barrier<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        run_blocking(|job| self.push(job, true), f)
    }

    /// Stops new items from starting. Items already running continue.
    pub fn suspend(&self) {
        self.inner.state.lock().suspend_count += 1;
    }

    /// # Panics
    ///
    /// Panics if the queue is not suspended.
    pub fn resume(&self) {
        let launches = {
            let mut state = self.inner.state.lock();
            assert!(
                state.suspend_count > 0,
                "queue '{}' resumed more times than it was suspended",
                self.inner.label
            );
            state.suspend_count -= 1;
            self.pump(&mut state)
        };
        self.launch_all(launches);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspend_count > 0
    }

    /// Items waiting to start (not counting running ones).
    pub fn queued(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn set_specific<T>(&self, key: &SpecificKey<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.inner.specifics.write().insert(key.id(), Arc::new(value));
    }

    pub fn clear_specific<T>(&self, key: &SpecificKey<T>) {
        self.inner.specifics.write().remove(&key.id());
    }

    /// Value attached to this queue itself, ignoring targets.
    pub fn specific<T>(&self, key: &SpecificKey<T>) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.inner
            .specific_value(key.id())
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    fn push(&self, job: Job, barrier: bool) {
        let launches = {
            let mut state = self.inner.state.lock();
            state.items.push_back(Item { job, barrier });
            self.pump(&mut state)
        };
        self.launch_all(launches);
    }

    /// Pops every item allowed to start now. Launching happens after the
    /// lock is released since the target may be another queue.
    fn pump(&self, state: &mut QueueState) -> Vec<Item> {
        let mut launches = Vec::new();

        while state.suspend_count == 0 && !state.exclusive_running {
            let Some(front) = state.items.front() else {
                break;
            };

            let exclusive = front.barrier || self.inner.kind == QueueKind::Serial;
            if exclusive && state.running > 0 {
                break;
            }

            let Some(item) = state.items.pop_front() else {
                break;
            };
            state.running += 1;
            if exclusive {
                state.exclusive_running = true;
            }
            launches.push(item);

            if exclusive {
                break;
            }
        }

        launches
    }

    fn launch_all(&self, launches: Vec<Item>) {
        for item in launches {
            self.launch(item);
        }
    }

    fn launch(&self, item: Item) {
        let queue = self.clone();
        let Item { job, barrier } = item;
        let exclusive = barrier || self.inner.kind == QueueKind::Serial;

        let drain = Job::new(move || {
            let done = queue.clone();
            let _complete = ScopeGuard::new(move || done.complete(exclusive));
            let _executing = specific::enter(&queue.inner);
            job.run();
        });

        self.inner.target.submit(&self.inner.host, drain);
    }

    fn complete(&self, exclusive: bool) {
        let launches = {
            let mut state = self.inner.state.lock();
            state.running -= 1;
            if exclusive {
                state.exclusive_running = false;
            }
            self.pump(&mut state)
        };
        self.launch_all(launches);
    }
}

impl fmt::Debug for RawQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawQueue")
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .field("target", &self.inner.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::executor::{Host, Tier};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn host() -> Host {
        Host::new(HostConfig::builder().num_threads(4).build().unwrap()).unwrap()
    }

    #[test]
    fn test_serial_queue_preserves_order() {
        let host = host();
        let queue = host.queue("serial", QueueKind::Serial, None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            queue.enqueue(Job::new(move || seen.lock().push(i)));
        }
        queue.sync(|| {});

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_queue_overlaps() {
        let host = host();
        let queue = host.queue("concurrent", QueueKind::Concurrent, None);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let active = active.clone();
            let peak = peak.clone();
            queue.enqueue(Job::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        queue.sync_barrier(|| {});

        assert!(peak.load(Ordering::SeqCst) > 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_suspended_queue_holds_items() {
        let host = host();
        let queue = host.queue("held", QueueKind::Serial, None);
        let ran = Arc::new(AtomicUsize::new(0));

        queue.suspend();
        let ran_clone = ran.clone();
        queue.enqueue(Job::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.queued(), 1);

        queue.resume();
        queue.sync(|| {});
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "resumed more times")]
    fn test_unbalanced_resume_panics() {
        let host = host();
        let queue = host.queue("unbalanced", QueueKind::Serial, None);
        queue.resume();
    }

    #[test]
    fn test_specific_visible_through_target() {
        let host = host();
        let outer = host.queue("outer", QueueKind::Serial, None);
        let inner = host.queue(
            "inner",
            QueueKind::Serial,
            Some(Target::Queue(outer.clone())),
        );

        let key = SpecificKey::<u32>::new();
        outer.set_specific(&key, 7);

        assert_eq!(inner.sync(|| specific::get_specific(&key)), Some(7));
        assert_eq!(inner.specific(&key), None);
        assert_eq!(specific::get_specific(&key), None);
    }

    #[test]
    fn test_sync_propagates_panic() {
        let host = host();
        let queue = host.queue("panicky", QueueKind::Serial, Some(Target::Tier(Tier::Utility)));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.sync(|| panic!("inside sync"));
        }));
        assert!(result.is_err());

        // the queue keeps working after the unwind
        assert_eq!(queue.sync(|| 5), 5);
    }
}
