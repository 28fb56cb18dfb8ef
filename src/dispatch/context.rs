//! Execution contexts: the fixed priority tiers and user-created queues.

use super::probe;
use super::task::Task;
use crate::executor::{
    run_blocking, Deadline, HostShared, Job, QueueKind, RawQueue, SpecificKey, Target, Tier,
};
use crate::runtime;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Process-unique identity of a custom context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContextMode {
    #[default]
    Serial,
    Concurrent,
}

impl From<ContextMode> for QueueKind {
    fn from(mode: ContextMode) -> Self {
        match mode {
            ContextMode::Serial => QueueKind::Serial,
            ContextMode::Concurrent => QueueKind::Concurrent,
        }
    }
}

struct CustomInner {
    id: ContextId,
    key: SpecificKey<ContextId>,
    mode: ContextMode,
    target: Option<ExecutionContext>,
    queue: RawQueue,
}

/// Shared handle to a user-created context. Clones refer to the same queue.
#[derive(Clone)]
pub struct CustomContext {
    inner: Arc<CustomInner>,
}

impl CustomContext {
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        self.inner.queue.label()
    }

    pub fn mode(&self) -> ContextMode {
        self.inner.mode
    }

    pub fn target(&self) -> Option<&ExecutionContext> {
        self.inner.target.as_ref()
    }

    pub fn raw(&self) -> &RawQueue {
        &self.inner.queue
    }

    pub(crate) fn key(&self) -> &SpecificKey<ContextId> {
        &self.inner.key
    }

    pub fn ptr_eq(&self, other: &CustomContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CustomContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomContext")
            .field("id", &self.inner.id)
            .field("label", &self.label())
            .field("mode", &self.inner.mode)
            .field("target", &self.inner.target)
            .finish()
    }
}

/// A place to run work.
///
/// `Fixed` contexts are the process-wide priority tiers of the global host;
/// they always exist and cannot be suspended. `Custom` contexts are queues
/// created through [`ExecutionContext::builder`], optionally redirected onto
/// another context.
///
/// ```no_run
/// use veda_dispatch::{ExecutionContext, Tier};
///
/// let io = ExecutionContext::serial("io");
/// io.dispatch_async(|| println!("runs on io"));
///
/// let sum = ExecutionContext::global(Tier::Utility).dispatch_sync(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
#[derive(Clone, Debug)]
pub enum ExecutionContext {
    Fixed(Tier),
    Custom(CustomContext),
}

impl ExecutionContext {
    pub fn main() -> Self {
        ExecutionContext::Fixed(Tier::Main)
    }

    pub fn global(tier: Tier) -> Self {
        ExecutionContext::Fixed(tier)
    }

    pub fn serial(label: impl Into<String>) -> Self {
        Self::builder(label).build()
    }

    pub fn concurrent(label: impl Into<String>) -> Self {
        Self::builder(label).concurrent().build()
    }

    pub fn builder(label: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(label)
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            ExecutionContext::Fixed(tier) => Some(*tier),
            ExecutionContext::Custom(_) => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ExecutionContext::Fixed(tier) => tier.label(),
            ExecutionContext::Custom(custom) => custom.label(),
        }
    }

    /// The main tier runs one job at a time; the other tiers run jobs
    /// concurrently.
    pub fn mode(&self) -> ContextMode {
        match self {
            ExecutionContext::Fixed(Tier::Main) => ContextMode::Serial,
            ExecutionContext::Fixed(_) => ContextMode::Concurrent,
            ExecutionContext::Custom(custom) => custom.mode(),
        }
    }

    pub fn target(&self) -> Option<&ExecutionContext> {
        match self {
            ExecutionContext::Fixed(_) => None,
            ExecutionContext::Custom(custom) => custom.target(),
        }
    }

    pub fn id(&self) -> Option<ContextId> {
        match self {
            ExecutionContext::Fixed(_) => None,
            ExecutionContext::Custom(custom) => Some(custom.id()),
        }
    }

    /// The host queue behind a custom context.
    pub fn raw(&self) -> Option<&RawQueue> {
        match self {
            ExecutionContext::Fixed(_) => None,
            ExecutionContext::Custom(custom) => Some(custom.raw()),
        }
    }

    /// Whether the calling code is running on this context. See
    /// [`probe::is_current`].
    pub fn is_current(&self) -> bool {
        probe::is_current(self)
    }

    pub fn dispatch_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_job(Job::new(f));
    }

    pub fn submit_async(&self, task: &Task) {
        self.submit_job(task.to_job());
    }

    /// Runs `f` on this context and blocks until it returns. Panics in `f`
    /// resume on the caller.
    ///
    /// Calling this from code already running on the same serial context (or
    /// on `Fixed(Main)` from the main thread) deadlocks.
    pub fn dispatch_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match self {
            ExecutionContext::Fixed(tier) => {
                let host = self.host();
                run_blocking(|job| host.pool.push(*tier, job), f)
            }
            ExecutionContext::Custom(custom) => custom.raw().sync(f),
        }
    }

    pub fn submit_sync(&self, task: &Task) {
        self.dispatch_sync(|| {
            task.perform();
        });
    }

    /// Runs `f` on this context once `delay` has elapsed.
    pub fn schedule_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.host()
            .submit_at(Deadline::after(delay), self.host_target(), Job::new(f));
    }

    pub fn submit_after(&self, delay: Duration, task: &Task) {
        self.host()
            .submit_at(Deadline::after(delay), self.host_target(), task.to_job());
    }

    /// Runs `f` on this context once the system clock reaches `at`.
    pub fn schedule_at_wall<F>(&self, at: SystemTime, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.host()
            .submit_at(Deadline::Wall(at), self.host_target(), Job::new(f));
    }

    /// On a concurrent custom context `f` runs alone: after everything
    /// submitted earlier and before anything submitted later. On serial
    /// contexts and fixed tiers this is plain [`dispatch_async`](Self::dispatch_async).
    pub fn barrier_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            ExecutionContext::Fixed(_) => self.dispatch_async(f),
            ExecutionContext::Custom(custom) => custom.raw().enqueue_barrier(Job::new(f)),
        }
    }

    pub fn barrier_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match self {
            ExecutionContext::Fixed(_) => self.dispatch_sync(f),
            ExecutionContext::Custom(custom) => custom.raw().sync_barrier(f),
        }
    }

    /// Invokes `f(0..iterations)` and returns once every invocation has
    /// finished.
    ///
    /// Serial contexts run the invocations in index order inside one
    /// synchronous job. Concurrent contexts fan them out and the calling
    /// thread takes indices too, so a saturated pool only slows the call
    /// down. On a custom context the caller's invocations run with the
    /// context marked current. A panicking invocation does not stop the others;
    /// the first panic resumes on the caller once all have finished.
    pub fn apply_concurrently<F>(&self, iterations: usize, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if iterations == 0 {
            return;
        }

        if self.mode() == ContextMode::Serial {
            self.dispatch_sync(|| (0..iterations).for_each(&f));
            return;
        }

        let apply = Arc::new(Apply::new(iterations, f));
        let helpers = iterations.min(self.host().pool.num_threads());
        for _ in 0..helpers {
            let apply = apply.clone();
            self.dispatch_async(move || apply.work());
        }

        match self {
            ExecutionContext::Fixed(_) => apply.work(),
            ExecutionContext::Custom(custom) => {
                let _frames = custom.raw().enter_chain();
                apply.work();
            }
        }
        apply.wait();
    }

    /// # Panics
    ///
    /// Panics on a fixed tier.
    pub fn suspend(&self) {
        match self {
            ExecutionContext::Fixed(tier) => panic!("fixed tier '{}' cannot be suspended", tier),
            ExecutionContext::Custom(custom) => custom.raw().suspend(),
        }
    }

    /// # Panics
    ///
    /// Panics on a fixed tier, or if the context is not suspended.
    pub fn resume(&self) {
        match self {
            ExecutionContext::Fixed(tier) => panic!("fixed tier '{}' cannot be resumed", tier),
            ExecutionContext::Custom(custom) => custom.raw().resume(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        match self {
            ExecutionContext::Fixed(_) => false,
            ExecutionContext::Custom(custom) => custom.raw().is_suspended(),
        }
    }

    pub(crate) fn host(&self) -> &Arc<HostShared> {
        match self {
            ExecutionContext::Fixed(_) => runtime::host().shared(),
            ExecutionContext::Custom(custom) => custom.raw().host(),
        }
    }

    pub(crate) fn host_target(&self) -> Target {
        match self {
            ExecutionContext::Fixed(tier) => Target::Tier(*tier),
            ExecutionContext::Custom(custom) => Target::Queue(custom.raw().clone()),
        }
    }

    fn submit_job(&self, job: Job) {
        match self {
            ExecutionContext::Fixed(tier) => self.host().pool.push(*tier, job),
            ExecutionContext::Custom(custom) => custom.raw().enqueue(job),
        }
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExecutionContext::Fixed(a), ExecutionContext::Fixed(b)) => a == b,
            (ExecutionContext::Custom(a), ExecutionContext::Custom(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for ExecutionContext {}

impl From<Tier> for ExecutionContext {
    fn from(tier: Tier) -> Self {
        ExecutionContext::Fixed(tier)
    }
}

impl From<CustomContext> for ExecutionContext {
    fn from(custom: CustomContext) -> Self {
        ExecutionContext::Custom(custom)
    }
}

/// Builder for custom contexts. Serial and targeting `Tier::Default` unless
/// told otherwise.
#[derive(Debug)]
pub struct ContextBuilder {
    label: String,
    mode: ContextMode,
    target: Option<ExecutionContext>,
}

impl ContextBuilder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            mode: ContextMode::Serial,
            target: None,
        }
    }

    pub fn mode(mut self, mode: ContextMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn serial(self) -> Self {
        self.mode(ContextMode::Serial)
    }

    pub fn concurrent(self) -> Self {
        self.mode(ContextMode::Concurrent)
    }

    /// Redirects the new context's work onto `target`.
    pub fn target(mut self, target: &ExecutionContext) -> Self {
        self.target = Some(target.clone());
        self
    }

    pub fn build(self) -> ExecutionContext {
        let host = match &self.target {
            Some(target) => target.host().clone(),
            None => runtime::host().shared().clone(),
        };
        let queue = host.queue(
            &self.label,
            self.mode.into(),
            self.target.as_ref().map(ExecutionContext::host_target),
        );

        let key = SpecificKey::new();
        let id = ContextId(key.id());
        queue.set_specific(&key, id);
        queue.set_specific(probe::innermost_key(), id);

        ExecutionContext::Custom(CustomContext {
            inner: Arc::new(CustomInner {
                id,
                key,
                mode: self.mode,
                target: self.target,
                queue,
            }),
        })
    }
}

struct Apply<F> {
    f: F,
    iterations: usize,
    next: AtomicUsize,
    done: Mutex<usize>,
    all_done: Condvar,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<F: Fn(usize)> Apply<F> {
    fn new(iterations: usize, f: F) -> Self {
        Self {
            f,
            iterations,
            next: AtomicUsize::new(0),
            done: Mutex::new(0),
            all_done: Condvar::new(),
            panic: Mutex::new(None),
        }
    }

    fn work(&self) {
        loop {
            let index = self.next.fetch_add(1, Ordering::Relaxed);
            if index >= self.iterations {
                return;
            }

            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.f)(index))) {
                self.panic.lock().get_or_insert(payload);
            }

            let mut done = self.done.lock();
            *done += 1;
            if *done == self.iterations {
                self.all_done.notify_all();
            }
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while *done < self.iterations {
            self.all_done.wait(&mut done);
        }
        drop(done);

        if let Some(payload) = self.panic.lock().take() {
            resume_unwind(payload);
        }
    }
}
