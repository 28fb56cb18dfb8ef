//! Queue-specific values and the per-thread record of executing queues.
//!
//! Before a queue runs a job body it pushes itself onto a thread-local
//! stack and pops itself afterwards. A job submitted to queue B that targets
//! queue A executes inside A's drain job, so the stack holds `[.., A, B]`
//! while the body runs. [`get_specific`] walks that stack from the innermost
//! entry outwards, which makes values attached to A visible to work running
//! on B.

use super::queue::{QueueInner, RawQueue};
use crate::util::ScopeGuard;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static EXECUTING: RefCell<Vec<Arc<QueueInner>>> = const { RefCell::new(Vec::new()) };
}

/// Typed key for [`RawQueue::set_specific`].
pub struct SpecificKey<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SpecificKey<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Default for SpecificKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SpecificKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SpecificKey<T> {}

impl<T> fmt::Debug for SpecificKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpecificKey").field(&self.id).finish()
    }
}

pub(crate) type SpecificValue = Arc<dyn Any + Send + Sync>;

/// Marks `queue` as executing on this thread until the guard drops.
pub(crate) fn enter(queue: &Arc<QueueInner>) -> ScopeGuard<impl FnOnce()> {
    enter_all(std::iter::once(queue.clone()))
}

/// Pushes `frames` outermost first; the guard pops all of them.
pub(crate) fn enter_all<I>(frames: I) -> ScopeGuard<impl FnOnce()>
where
    I: IntoIterator<Item = Arc<QueueInner>>,
{
    let pushed = EXECUTING.with(|stack| {
        let mut stack = stack.borrow_mut();
        let before = stack.len();
        stack.extend(frames);
        stack.len() - before
    });
    ScopeGuard::new(move || {
        EXECUTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            let len = stack.len();
            stack.truncate(len - pushed);
        });
    })
}

/// Looks `key` up on the queues executing the calling code, innermost first.
pub fn get_specific<T>(key: &SpecificKey<T>) -> Option<T>
where
    T: Clone + 'static,
{
    EXECUTING.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|queue| queue.specific_value(key.id()))
    })
    .and_then(|value| value.downcast_ref::<T>().cloned())
}

/// The innermost queue executing the calling code, if any.
pub fn current_queue() -> Option<RawQueue> {
    EXECUTING.with(|stack| stack.borrow().last().cloned().map(RawQueue::from_inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth() -> usize {
        EXECUTING.with(|stack| stack.borrow().len())
    }
    use crate::config::HostConfig;
    use crate::executor::{Host, QueueKind, Target};

    fn host() -> Host {
        Host::new(HostConfig::builder().num_threads(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_stack_is_empty_outside_queues() {
        assert_eq!(depth(), 0);
        assert!(current_queue().is_none());
    }

    #[test]
    fn test_nested_queues_stack_up() {
        let host = host();
        let outer = host.queue("outer", QueueKind::Concurrent, None);
        let inner = host.queue("inner", QueueKind::Serial, Some(Target::Queue(outer.clone())));

        let (nested, innermost) = inner.sync(|| (depth(), current_queue()));
        assert_eq!(nested, 2);
        assert!(innermost.is_some_and(|q| q.ptr_eq(&inner)));
        assert_eq!(outer.sync(depth), 1);
    }

    #[test]
    fn test_innermost_value_wins() {
        let host = host();
        let outer = host.queue("outer", QueueKind::Serial, None);
        let inner = host.queue("inner", QueueKind::Serial, Some(Target::Queue(outer.clone())));

        let key = SpecificKey::<&'static str>::new();
        outer.set_specific(&key, "outer");
        inner.set_specific(&key, "inner");
        assert_eq!(inner.sync(|| get_specific(&key)), Some("inner"));

        inner.clear_specific(&key);
        assert_eq!(inner.sync(|| get_specific(&key)), Some("outer"));
    }

    #[test]
    fn test_stack_unwinds_after_panic() {
        let host = host();
        let queue = host.queue("unwind", QueueKind::Serial, None);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.sync(|| panic!("inside"));
        }));
        assert_eq!(queue.sync(depth), 1);
    }
}
