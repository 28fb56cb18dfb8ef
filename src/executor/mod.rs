//! The host scheduler.
//!
//! Everything the dispatch layer needs from a scheduler lives here behind a
//! narrow surface: tier submission, queues with targets, delayed submission,
//! groups, semaphores and timer sources. Worker threads, the main-tier thread
//! and the clock thread all belong to a [`Host`].

pub mod clock;
pub mod group;
pub mod job;
pub mod panic_handler;
pub(crate) mod pool;
pub mod queue;
pub mod semaphore;
pub mod source;
pub mod specific;
pub(crate) mod worker;

pub use clock::Deadline;
pub use group::RawGroup;
pub use job::{Job, JobId};
pub use panic_handler::{JobPanic, PanicHandler, PanicStrategy};
pub use queue::{QueueKind, RawQueue};
pub use semaphore::RawSemaphore;
pub use source::{Handler, RawTimer};
pub use specific::{current_queue, get_specific, SpecificKey};

use crate::config::HostConfig;
use crate::error::{Error, Result};
use clock::{Clock, Wake};
use parking_lot::Mutex;
use pool::Pool;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// Well-known priority tiers. `Main` is served by one dedicated thread; the
/// rest share the worker pool and are drained highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Main,
    UserInteractive,
    UserInitiated,
    Default,
    Utility,
    Background,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Main,
        Tier::UserInteractive,
        Tier::UserInitiated,
        Tier::Default,
        Tier::Utility,
        Tier::Background,
    ];

    pub(crate) const POOLED_COUNT: usize = 5;

    pub(crate) fn pool_index(self) -> Option<usize> {
        match self {
            Tier::Main => None,
            Tier::UserInteractive => Some(0),
            Tier::UserInitiated => Some(1),
            Tier::Default => Some(2),
            Tier::Utility => Some(3),
            Tier::Background => Some(4),
        }
    }

    pub fn is_main(self) -> bool {
        self == Tier::Main
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::Main => "main",
            Tier::UserInteractive => "user-interactive",
            Tier::UserInitiated => "user-initiated",
            Tier::Default => "default",
            Tier::Utility => "utility",
            Tier::Background => "background",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a queue, timer source or delayed job sends its work.
#[derive(Debug, Clone)]
pub enum Target {
    Tier(Tier),
    Queue(RawQueue),
}

impl Target {
    pub(crate) fn submit(&self, host: &HostShared, job: Job) {
        match self {
            Target::Tier(tier) => host.pool.push(*tier, job),
            Target::Queue(queue) => queue.enqueue(job),
        }
    }
}

impl From<Tier> for Target {
    fn from(tier: Tier) -> Self {
        Target::Tier(tier)
    }
}

impl From<RawQueue> for Target {
    fn from(queue: RawQueue) -> Self {
        Target::Queue(queue)
    }
}

/// State reachable from every host thread and every primitive.
pub(crate) struct HostShared {
    pub(crate) config: HostConfig,
    pub(crate) pool: Pool,
    pub(crate) clock: Clock,
    pub(crate) panic_handler: PanicHandler,
}

/// A running scheduler: worker pool, main-tier thread and clock thread.
///
/// Dropping a `Host` stops its threads; work still queued is discarded.
pub struct Host {
    shared: Arc<HostShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(HostShared {
            pool: Pool::new(config.worker_threads()),
            clock: Clock::new(config.wall_clock_resolution),
            panic_handler: PanicHandler::new(config.panic_strategy),
            config,
        });

        let host = Self {
            shared: shared.clone(),
            threads: Mutex::new(Vec::new()),
        };

        // on failure `host` drops here and stops whatever did start
        let mut handles = pool::spawn_threads(&shared)?;
        host.threads.lock().append(&mut handles);

        let clock_shared = shared.clone();
        let clock = thread::Builder::new()
            .name(format!("{}-clock", shared.config.thread_name_prefix))
            .spawn(move || clock_shared.clock.run(&clock_shared))
            .map_err(|e| Error::spawn(format!("clock thread: {}", e)))?;
        host.threads.lock().push(clock);

        tracing::debug!(
            workers = shared.pool.num_threads(),
            prefix = %shared.config.thread_name_prefix,
            "host started"
        );

        Ok(host)
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub fn num_threads(&self) -> usize {
        self.shared.pool.num_threads()
    }

    /// Jobs queued on pooled tiers and not yet picked up.
    pub fn pending_jobs(&self) -> usize {
        self.shared.pool.pending()
    }

    /// Clock entries (delayed jobs and armed timer deadlines) not yet due.
    pub fn pending_deadlines(&self) -> usize {
        self.shared.clock.len()
    }

    pub fn panic_count(&self) -> usize {
        self.shared.panic_handler.panic_count()
    }

    /// Whether the caller runs on this host's main-tier thread.
    pub fn is_main_thread(&self) -> bool {
        self.shared.pool.is_main_thread()
    }

    pub fn submit(&self, tier: Tier, job: Job) {
        self.shared.pool.push(tier, job);
    }

    /// Runs `f` on `tier` and blocks until it returns. Calling this for
    /// `Tier::Main` from the main thread deadlocks.
    pub fn sync<F, R>(&self, tier: Tier, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        run_blocking(|job| self.shared.pool.push(tier, job), f)
    }

    pub fn submit_after(&self, delay: Duration, target: Target, job: Job) {
        self.shared.submit_at(Deadline::after(delay), target, job);
    }

    pub fn submit_at_wall(&self, at: SystemTime, target: Target, job: Job) {
        self.shared.submit_at(Deadline::Wall(at), target, job);
    }

    pub fn queue(&self, label: &str, kind: QueueKind, target: Option<Target>) -> RawQueue {
        self.shared.queue(label, kind, target)
    }

    pub fn group(&self) -> RawGroup {
        RawGroup::new(self.shared.clone())
    }

    pub fn semaphore(&self, value: usize) -> RawSemaphore {
        RawSemaphore::new(value)
    }

    /// A new timer source, suspended, bound to `target`.
    pub fn timer(&self, target: Target) -> RawTimer {
        RawTimer::new(self.shared.clone(), target)
    }

    pub(crate) fn shared(&self) -> &Arc<HostShared> {
        &self.shared
    }
}

impl HostShared {
    pub(crate) fn queue(
        self: &Arc<Self>,
        label: &str,
        kind: QueueKind,
        target: Option<Target>,
    ) -> RawQueue {
        let target = target.unwrap_or(Target::Tier(Tier::Default));
        RawQueue::new(self.clone(), label.to_string(), kind, target)
    }

    pub(crate) fn submit_at(&self, deadline: Deadline, target: Target, job: Job) {
        self.clock
            .schedule(deadline, Duration::ZERO, Wake::Job { target, job });
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shared.pool.begin_shutdown();
        self.shared.clock.shutdown();

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            // a job dropping the last handle cannot join its own thread
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        // queued jobs may hold primitives that point back at `shared`
        self.shared.clock.clear();
        self.shared.pool.clear();

        tracing::debug!(prefix = %self.shared.config.thread_name_prefix, "host stopped");
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("num_threads", &self.num_threads())
            .field("pending_jobs", &self.pending_jobs())
            .field("pending_deadlines", &self.pending_deadlines())
            .finish()
    }
}

/// Hands a job running `f` to `submit` and blocks until it has run.
///
/// `f` may borrow from the caller: the caller does not return before the job
/// has either finished or been dropped unrun. Panics inside `f` resume on the
/// caller.
pub(crate) fn run_blocking<S, F, R>(submit: S, f: F) -> R
where
    S: FnOnce(Job),
    F: FnOnce() -> R + Send,
    R: Send,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    let body: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
        let _ = tx.send(catch_unwind(AssertUnwindSafe(f)));
    });

    // SAFETY: `rx.recv()` below returns only after the closure has sent its
    // result or has been dropped (disconnecting the channel), so nothing it
    // borrows is used after this frame returns.
    let body: Box<dyn FnOnce() + Send + 'static> = unsafe { std::mem::transmute(body) };
    submit(Job::from_boxed(body));

    match rx.recv() {
        Ok(Ok(value)) => value,
        Ok(Err(payload)) => resume_unwind(payload),
        Err(_) => panic!("synchronous job was dropped without running"),
    }
}
