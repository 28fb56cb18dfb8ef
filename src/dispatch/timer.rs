//! Periodic timers with idempotent suspend and resume.
//!
//! The host's [`RawTimer`] counts suspensions strictly: one resume too many
//! or a cancel while suspended is a fatal error. [`RecurringTimer`] keeps a
//! plain suspended flag in front of it. The flag, the cancelled flag and
//! every call into the raw timer that changes its suspend count are handled
//! inside one critical section, and a raw call is made only when the flag
//! actually flips, so the two can never disagree no matter how many threads
//! call `resume` or `suspend` at once.

use super::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{Deadline, RawTimer};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

struct TimerState {
    suspended: bool,
    cancelled: bool,
    interval: Duration,
    leeway: Duration,
}

struct TimerInner {
    context: ExecutionContext,
    raw: RawTimer,
    state: Mutex<TimerState>,
}

impl TimerInner {
    fn cancel(&self) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;

        self.raw.set_event_handler(None);
        if state.suspended {
            state.suspended = false;
            self.raw.resume();
        }
        self.raw.cancel();
        tracing::trace!(context = %self.context.label(), "timer cancelled");
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A repeating trigger that runs its handler on a bound context.
///
/// Timers start suspended; arm one with [`set_timer`](Self::set_timer) and
/// start it with [`resume`](Self::resume). Clones share the timer, and
/// dropping the last clone cancels it. A handler that needs to reach its own
/// timer should capture a [`WeakRecurringTimer`], since a strong clone would
/// keep the timer alive forever.
///
/// ```no_run
/// use std::time::Duration;
/// use veda_dispatch::{ExecutionContext, RecurringTimer};
///
/// let timer = RecurringTimer::new(&ExecutionContext::serial("ticks"));
/// timer.set_event_handler(|| println!("tick")).unwrap();
/// timer.set_timer(Duration::from_secs(1), Duration::from_millis(100)).unwrap();
/// timer.resume().unwrap();
/// ```
#[derive(Clone)]
pub struct RecurringTimer {
    inner: Arc<TimerInner>,
}

impl RecurringTimer {
    pub fn new(context: &ExecutionContext) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                context: context.clone(),
                raw: RawTimer::new(context.host().clone(), context.host_target()),
                state: Mutex::new(TimerState {
                    suspended: true,
                    cancelled: false,
                    interval: Duration::ZERO,
                    leeway: Duration::ZERO,
                }),
            }),
        }
    }

    /// Creates, arms and starts a timer in one go.
    pub fn start<F>(
        context: &ExecutionContext,
        interval: Duration,
        leeway: Duration,
        handler: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = Self::new(context);
        let mut state = timer.inner.state.lock();
        timer.inner.raw.set_event_handler(Some(Arc::new(handler)));
        timer.arm(&mut state, Deadline::after(interval), interval, leeway);
        state.suspended = false;
        timer.inner.raw.resume();
        drop(state);
        timer
    }

    /// Replaces the handler. A firing already in progress finishes with the
    /// previous one.
    pub fn set_event_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let state = self.inner.state.lock();
        if state.cancelled {
            return Err(Error::TimerCancelled);
        }
        self.inner.raw.set_event_handler(Some(Arc::new(handler)));
        Ok(())
    }

    /// Arms the timer to fire `interval` from now and every `interval` after
    /// that, each firing at most `leeway` late. A zero interval fires once.
    ///
    /// The suspended state is left alone. Calling this from the handler
    /// reschedules the next firing relative to the current one.
    pub fn set_timer(&self, interval: Duration, leeway: Duration) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return Err(Error::TimerCancelled);
        }
        self.arm(&mut state, Deadline::after(interval), interval, leeway);
        Ok(())
    }

    /// Same as [`set_timer`](Self::set_timer).
    pub fn set_interval(&self, interval: Duration, leeway: Duration) -> Result<()> {
        self.set_timer(interval, leeway)
    }

    /// Arms the timer against the system clock: first at `start`, then every
    /// `interval`. Clock adjustments move the firings with them.
    pub fn set_wall_timer(
        &self,
        start: SystemTime,
        interval: Duration,
        leeway: Duration,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return Err(Error::TimerCancelled);
        }
        self.arm(&mut state, Deadline::Wall(start), interval, leeway);
        Ok(())
    }

    /// Starts delivering firings. Returns `Ok(false)` if already running.
    pub fn resume(&self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return Err(Error::TimerCancelled);
        }
        if !state.suspended {
            return Ok(false);
        }
        state.suspended = false;
        self.inner.raw.resume();
        tracing::trace!(context = %self.inner.context.label(), "timer resumed");
        Ok(true)
    }

    /// Stops delivering firings. Returns `Ok(false)` if already suspended.
    pub fn suspend(&self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return Err(Error::TimerCancelled);
        }
        if state.suspended {
            return Ok(false);
        }
        state.suspended = true;
        self.inner.raw.suspend();
        tracing::trace!(context = %self.inner.context.label(), "timer suspended");
        Ok(true)
    }

    /// Stops the timer for good. No firing starts afterwards; one already
    /// running completes. Calling it again does nothing.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    pub fn leeway(&self) -> Duration {
        self.inner.state.lock().leeway
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    pub fn downgrade(&self) -> WeakRecurringTimer {
        WeakRecurringTimer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn raw(&self) -> &RawTimer {
        &self.inner.raw
    }

    fn arm(&self, state: &mut TimerState, start: Deadline, interval: Duration, leeway: Duration) {
        state.interval = interval;
        state.leeway = leeway;
        self.inner.raw.set_timer(start, interval, leeway);
    }
}

impl fmt::Debug for RecurringTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RecurringTimer")
            .field("context", &self.inner.context.label())
            .field("suspended", &state.suspended)
            .field("cancelled", &state.cancelled)
            .field("interval", &state.interval)
            .field("leeway", &state.leeway)
            .finish()
    }
}

/// Non-owning handle to a [`RecurringTimer`].
#[derive(Clone)]
pub struct WeakRecurringTimer {
    inner: Weak<TimerInner>,
}

impl WeakRecurringTimer {
    pub fn upgrade(&self) -> Option<RecurringTimer> {
        self.inner.upgrade().map(|inner| RecurringTimer { inner })
    }
}

impl fmt::Debug for WeakRecurringTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRecurringTimer")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
