//! Single-shot units of deferred work.

use super::context::ExecutionContext;
use crate::error::WaitResult;
use crate::executor::Job;
use crate::util::ScopeGuard;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// serialises continuation registration so the cycle check sees a stable chain
static REGISTRATION: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a [`Task`]. `Completed` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TaskFlags {
    /// Run with the scheduling class of the submitting context rather than
    /// the one the task was created with.
    pub inherit_class: bool,
}

impl TaskFlags {
    pub const NONE: TaskFlags = TaskFlags {
        inherit_class: false,
    };

    pub const INHERIT_CLASS: TaskFlags = TaskFlags {
        inherit_class: true,
    };
}

struct TaskCore {
    state: TaskState,
    action: Option<Box<dyn FnOnce() + Send + 'static>>,
    continuation: Option<(ExecutionContext, Task)>,
    notified: bool,
}

struct TaskInner {
    id: TaskId,
    flags: TaskFlags,
    core: Mutex<TaskCore>,
    done: Condvar,
}

/// An action that runs at most once, wherever it is submitted.
///
/// Clones share the same task: submitting a clone to two contexts still runs
/// the action once, and a task cancelled through one clone is cancelled for
/// all of them.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_flags(TaskFlags::NONE, f)
    }

    pub fn with_flags<F>(flags: TaskFlags, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                flags,
                core: Mutex::new(TaskCore {
                    state: TaskState::Pending,
                    action: Some(Box::new(f)),
                    continuation: None,
                    notified: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn flags(&self) -> TaskFlags {
        self.inner.flags
    }

    pub fn state(&self) -> TaskState {
        self.inner.core.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Runs the action on the calling thread if it has not started yet.
    /// Returns whether this call ran it.
    pub fn perform(&self) -> bool {
        self.run()
    }

    /// Prevents the action from starting. No effect once it is running or
    /// finished. Returns whether this call cancelled the task.
    pub fn cancel(&self) -> bool {
        let continuation = {
            let mut core = self.inner.core.lock();
            if core.state != TaskState::Pending {
                return false;
            }
            core.state = TaskState::Cancelled;
            core.action = None;
            self.inner.done.notify_all();
            core.continuation.take()
        };

        Self::dispatch_continuation(continuation);
        true
    }

    /// Blocks until the task completes or is cancelled.
    pub fn wait(&self) {
        let mut core = self.inner.core.lock();
        while !core.state.is_terminal() {
            self.inner.done.wait(&mut core);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now().checked_add(timeout);
        let mut core = self.inner.core.lock();
        while !core.state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut core, deadline).timed_out()
                        && !core.state.is_terminal()
                    {
                        return WaitResult::TimedOut;
                    }
                }
                None => self.inner.done.wait(&mut core),
            }
        }
        WaitResult::Success
    }

    /// Submits `next` to `context` once this task completes or is cancelled
    /// (immediately if it already has).
    ///
    /// # Panics
    ///
    /// Panics if a continuation was registered before, even one that has
    /// already been submitted, or if `next` would lead back to this task.
    pub fn notify(&self, context: &ExecutionContext, next: &Task) {
        let _registration = REGISTRATION.lock();

        let mut cursor = Some(next.clone());
        while let Some(task) = cursor {
            assert!(
                !Arc::ptr_eq(&task.inner, &self.inner),
                "task continuation would form a cycle"
            );
            cursor = task.inner.core.lock().continuation.as_ref().map(|(_, t)| t.clone());
        }

        {
            let mut core = self.inner.core.lock();
            assert!(
                !core.notified,
                "task {:?} already has a completion continuation",
                self.inner.id
            );
            core.notified = true;
            if !core.state.is_terminal() {
                core.continuation = Some((context.clone(), next.clone()));
                return;
            }
        }

        context.submit_async(next);
    }

    pub(crate) fn to_job(&self) -> Job {
        let task = self.clone();
        Job::new(move || {
            task.run();
        })
    }

    fn run(&self) -> bool {
        let action = {
            let mut core = self.inner.core.lock();
            if core.state != TaskState::Pending {
                if core.state != TaskState::Cancelled {
                    tracing::warn!(task = ?self.inner.id, state = ?core.state, "task already ran");
                }
                return false;
            }
            core.state = TaskState::Running;
            core.action.take()
        };

        let _finish = ScopeGuard::new(|| self.finish());
        if let Some(action) = action {
            action();
        }
        true
    }

    fn finish(&self) {
        let continuation = {
            let mut core = self.inner.core.lock();
            core.state = TaskState::Completed;
            self.inner.done.notify_all();
            core.continuation.take()
        };

        Self::dispatch_continuation(continuation);
    }

    fn dispatch_continuation(continuation: Option<(ExecutionContext, Task)>) {
        if let Some((context, next)) = continuation {
            context.submit_async(&next);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("flags", &self.inner.flags)
            .field("state", &self.state())
            .finish()
    }
}
