// pool worker thread
use super::job::Job;
use super::HostShared;
use crate::util::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};

pub type WorkerId = usize;

pub(crate) struct Worker {
    pub id: WorkerId,
    jobs_executed: AtomicU64,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            jobs_executed: AtomicU64::new(0),
        }
    }

    // main loop
    pub fn run(&self, shared: &HostShared) {
        let pool = &shared.pool;
        let mut backoff = Backoff::new();

        tracing::trace!(worker = self.id, "worker started");

        loop {
            if pool.is_shutdown() {
                break;
            }

            if let Some(job) = pool.find_job() {
                backoff.reset();
                self.execute_job(shared, job);
            } else if backoff.snooze() {
                // nothing to do for a while, block until a push
                pool.sleep();
                backoff.reset();
            }
        }

        tracing::trace!(
            worker = self.id,
            executed = self.jobs_executed.load(Ordering::Relaxed),
            "worker stopped"
        );
    }

    fn execute_job(&self, shared: &HostShared, job: Job) {
        if let Some(panic) = shared.panic_handler.run(job) {
            tracing::debug!(worker = self.id, job = ?panic.job, "job unwound");
        }
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
    }
}
