use crate::error::WaitResult;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SemaphoreState {
    value: usize,
    waiters: usize,
    // notified waiters that have not yet re-checked `value`
    woken: usize,
}

struct SemaphoreInner {
    state: Mutex<SemaphoreState>,
    cvar: Condvar,
}

/// Host counting semaphore.
#[derive(Clone)]
pub struct RawSemaphore {
    inner: Arc<SemaphoreInner>,
}

impl RawSemaphore {
    pub fn new(value: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                state: Mutex::new(SemaphoreState {
                    value,
                    waiters: 0,
                    woken: 0,
                }),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Adds one permit. Returns `true` if a blocked waiter was woken.
    pub fn signal(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.value += 1;
        if state.waiters > state.woken {
            state.woken += 1;
            self.inner.cvar.notify_one();
            true
        } else {
            false
        }
    }

    pub fn wait(&self) {
        let _ = self.wait_deadline(None);
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_deadline(Instant::now().checked_add(timeout))
    }

    pub fn try_wait(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            false
        }
    }

    fn wait_deadline(&self, deadline: Option<Instant>) -> WaitResult {
        let mut state = self.inner.state.lock();
        state.waiters += 1;

        while state.value == 0 {
            let timed_out = match deadline {
                Some(deadline) => self.inner.cvar.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.inner.cvar.wait(&mut state);
                    false
                }
            };

            if !timed_out {
                state.woken = state.woken.saturating_sub(1);
            } else if state.value == 0 {
                Self::leave(&mut state);
                return WaitResult::TimedOut;
            }
        }

        Self::leave(&mut state);
        state.value -= 1;
        WaitResult::Success
    }

    fn leave(state: &mut SemaphoreState) {
        state.waiters -= 1;
        state.woken = state.woken.min(state.waiters);
    }

    pub fn value(&self) -> usize {
        self.inner.state.lock().value
    }

    pub fn waiters(&self) -> usize {
        self.inner.state.lock().waiters
    }
}

impl fmt::Debug for RawSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RawSemaphore")
            .field("value", &state.value)
            .field("waiters", &state.waiters)
            .finish()
    }
}
