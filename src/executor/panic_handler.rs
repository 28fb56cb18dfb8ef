//! Containment of panics raised by job bodies.
//!
//! Host threads never unwind: every job runs through [`PanicHandler::run`],
//! which counts the panic and then reports it according to the configured
//! [`PanicStrategy`].

use super::job::{Job, JobId};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What a host thread does when a job panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    /// Log and abort the process.
    Abort,
    /// Swallow silently; only the panic counter moves.
    Isolate,
    /// Log the payload and keep the thread alive.
    #[default]
    LogAndContinue,
}

/// A job whose body unwound.
#[derive(Debug, Clone)]
pub struct JobPanic {
    pub job: JobId,
    pub message: String,
}

#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    panics: AtomicUsize,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            panics: AtomicUsize::new(0),
        }
    }

    /// Runs `job` on the calling thread and returns its panic, if any.
    pub fn run(&self, job: Job) -> Option<JobPanic> {
        let id = job.id();
        let queued = job.queued_for();

        let payload = catch_unwind(AssertUnwindSafe(|| job.run())).err()?;
        self.panics.fetch_add(1, Ordering::Relaxed);

        let panic = JobPanic {
            job: id,
            message: payload_message(payload.as_ref()),
        };

        match self.strategy {
            PanicStrategy::Abort => {
                tracing::error!(job = ?id, message = %panic.message, "job panicked, aborting");
                std::process::abort();
            }
            PanicStrategy::Isolate => {}
            PanicStrategy::LogAndContinue => {
                tracing::warn!(
                    job = ?id,
                    ?queued,
                    message = %panic.message,
                    thread = std::thread::current().name().unwrap_or("unnamed"),
                    "job panicked"
                );
            }
        }

        Some(panic)
    }

    pub fn panic_count(&self) -> usize {
        self.panics.load(Ordering::Relaxed)
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_isolated_panic_is_reported() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let job = Job::new(|| panic!("test panic"));
        let id = job.id();

        let panic = handler.run(job).unwrap();
        assert_eq!(panic.job, id);
        assert_eq!(panic.message, "test panic");
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_clean_job_is_not_counted() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let (tx, rx) = crossbeam_channel::bounded(1);

        assert!(handler.run(Job::new(move || tx.send(42).unwrap())).is_none());
        assert_eq!(rx.try_recv(), Ok(42));
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_non_string_payload() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let panic = handler
            .run(Job::new(|| std::panic::panic_any(17u32)))
            .unwrap();
        assert_eq!(panic.message, "non-string panic payload");
    }

    #[test]
    #[traced_test]
    fn test_log_and_continue_logs() {
        let handler = PanicHandler::new(PanicStrategy::LogAndContinue);

        for _ in 0..5 {
            handler.run(Job::new(|| panic!("boom {}", 7)));
        }

        assert_eq!(handler.panic_count(), 5);
        assert!(logs_contain("job panicked"));
        assert!(logs_contain("boom 7"));
    }
}
