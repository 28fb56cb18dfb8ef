//! Unit of work as seen by the host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        JobId(JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A boxed closure plus bookkeeping, queued on a tier or a raw queue.
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) func: Box<dyn FnOnce() + Send + 'static>,
    pub(crate) submit_time: Instant,
}

impl Job {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Job {
            id: JobId::next(),
            func: Box::new(f),
            submit_time: Instant::now(),
        }
    }

    pub(crate) fn from_boxed(func: Box<dyn FnOnce() + Send + 'static>) -> Self {
        Job {
            id: JobId::next(),
            func,
            submit_time: Instant::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Time since the job was created.
    pub fn queued_for(&self) -> Duration {
        self.submit_time.elapsed()
    }

    pub fn run(self) {
        (self.func)();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("queued_for", &self.queued_for())
            .finish()
    }
}
