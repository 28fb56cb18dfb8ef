use super::context::ExecutionContext;
use super::task::Task;
use crate::error::WaitResult;
use crate::executor::{Job, RawGroup};
use crate::runtime;
use crate::util::ScopeGuard;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracks a set of outstanding work items and runs continuations once all of
/// them have left.
///
/// Every transition of the outstanding count to zero wakes the waiters and
/// submits every notification registered so far. Members may join again
/// afterwards, which starts a new round.
#[derive(Clone)]
pub struct JoinBarrier {
    raw: RawGroup,
}

impl JoinBarrier {
    pub fn new() -> Self {
        Self {
            raw: runtime::host().group(),
        }
    }

    pub fn enter(&self) {
        self.raw.enter();
    }

    /// # Panics
    ///
    /// Panics if nothing is outstanding.
    pub fn leave(&self) {
        self.raw.leave();
    }

    /// Enters once and returns a token whose first [`LeaveToken::leave`]
    /// leaves. Useful when several code paths race to report completion.
    pub fn enter_once(&self) -> LeaveToken {
        self.enter();
        LeaveToken {
            inner: Arc::new(TokenInner {
                barrier: self.clone(),
                left: AtomicBool::new(false),
            }),
        }
    }

    /// Runs `f` on `context` as a member. The member leaves when `f` returns
    /// or unwinds.
    pub fn async_into<F>(&self, context: &ExecutionContext, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enter();
        let barrier = self.clone();
        context.dispatch_async(move || {
            let _leave = ScopeGuard::new(|| barrier.leave());
            f();
        });
    }

    /// Submits `task` to `context` as a member.
    ///
    /// A task cancelled before it starts still leaves when its turn comes.
    pub fn submit_into(&self, context: &ExecutionContext, task: &Task) {
        let task = task.clone();
        self.async_into(context, move || {
            task.perform();
        });
    }

    /// Runs `f` on `context` once nothing is outstanding.
    pub fn notify<F>(&self, context: &ExecutionContext, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.raw.notify(context.host_target(), Job::new(f));
    }

    pub fn notify_task(&self, context: &ExecutionContext, task: &Task) {
        self.raw.notify(context.host_target(), task.to_job());
    }

    pub fn wait(&self) {
        self.raw.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.raw.wait_timeout(timeout)
    }

    /// Members entered and not yet left.
    pub fn outstanding(&self) -> usize {
        self.raw.count()
    }

    pub fn raw(&self) -> &RawGroup {
        &self.raw
    }
}

impl Default for JoinBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JoinBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinBarrier")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

struct TokenInner {
    barrier: JoinBarrier,
    left: AtomicBool,
}

/// One membership of a [`JoinBarrier`] that can be given up at most once.
/// Clones share the membership.
#[derive(Clone)]
pub struct LeaveToken {
    inner: Arc<TokenInner>,
}

impl LeaveToken {
    /// Leaves the barrier if no clone of this token has yet. Returns whether
    /// this call did.
    pub fn leave(&self) -> bool {
        let first = self
            .inner
            .left
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.barrier.leave();
        }
        first
    }

    pub fn has_left(&self) -> bool {
        self.inner.left.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LeaveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaveToken")
            .field("has_left", &self.has_left())
            .finish()
    }
}
