use crate::error::WaitResult;
use crate::executor::RawSemaphore;
use std::fmt;
use std::time::Duration;

/// Counting semaphore without an upper bound. Clones share the count.
#[derive(Clone)]
pub struct CountingSemaphore {
    raw: RawSemaphore,
}

impl CountingSemaphore {
    pub fn new(value: usize) -> Self {
        Self {
            raw: RawSemaphore::new(value),
        }
    }

    /// Returns `true` if a blocked waiter was woken.
    pub fn signal(&self) -> bool {
        self.raw.signal()
    }

    pub fn wait(&self) {
        self.raw.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.raw.wait_timeout(timeout)
    }

    pub fn try_wait(&self) -> bool {
        self.raw.try_wait()
    }

    pub fn available(&self) -> usize {
        self.raw.value()
    }

    pub fn raw(&self) -> &RawSemaphore {
        &self.raw
    }
}

impl fmt::Debug for CountingSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingSemaphore")
            .field("available", &self.available())
            .finish()
    }
}
