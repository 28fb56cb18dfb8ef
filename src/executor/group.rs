use super::job::Job;
use super::{HostShared, Target};
use crate::error::WaitResult;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct GroupState {
    count: usize,
    /// Incremented on every transition to zero.
    generation: u64,
    notify: Vec<(Target, Job)>,
}

struct GroupInner {
    host: Arc<HostShared>,
    state: Mutex<GroupState>,
    cvar: Condvar,
}

/// Host join-barrier primitive: a counter of outstanding members plus
/// continuations to submit when it drops to zero.
#[derive(Clone)]
pub struct RawGroup {
    inner: Arc<GroupInner>,
}

impl RawGroup {
    pub(crate) fn new(host: Arc<HostShared>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                host,
                state: Mutex::new(GroupState::default()),
                cvar: Condvar::new(),
            }),
        }
    }

    pub fn enter(&self) {
        self.inner.state.lock().count += 1;
    }

    /// # Panics
    ///
    /// Panics if there is no outstanding member to leave.
    pub fn leave(&self) {
        let ready = {
            let mut state = self.inner.state.lock();
            assert!(state.count > 0, "group left more times than it was entered");
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            state.generation += 1;
            self.inner.cvar.notify_all();
            std::mem::take(&mut state.notify)
        };

        for (target, job) in ready {
            target.submit(&self.inner.host, job);
        }
    }

    /// Submits `job` to `target` at the next transition to zero, or right
    /// away if nothing is outstanding.
    pub fn notify(&self, target: Target, job: Job) {
        {
            let mut state = self.inner.state.lock();
            if state.count > 0 {
                state.notify.push((target, job));
                return;
            }
        }
        target.submit(&self.inner.host, job);
    }

    pub fn wait(&self) {
        let _ = self.wait_deadline(None);
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_deadline(Instant::now().checked_add(timeout))
    }

    fn wait_deadline(&self, deadline: Option<Instant>) -> WaitResult {
        let mut state = self.inner.state.lock();
        if state.count == 0 {
            return WaitResult::Success;
        }

        let generation = state.generation;
        while state.count > 0 && state.generation == generation {
            match deadline {
                Some(deadline) => {
                    if self.inner.cvar.wait_until(&mut state, deadline).timed_out() {
                        if state.count == 0 || state.generation != generation {
                            break;
                        }
                        return WaitResult::TimedOut;
                    }
                }
                None => self.inner.cvar.wait(&mut state),
            }
        }
        WaitResult::Success
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }
}

impl fmt::Debug for RawGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RawGroup")
            .field("count", &state.count)
            .field("pending_notify", &state.notify.len())
            .finish()
    }
}
