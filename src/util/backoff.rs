//! Idle backoff for pool workers.
//!
//! A worker that finds no job spins briefly, then yields, and only after
//! that falls asleep on the pool's condition variable. Short gaps between
//! submissions therefore never pay for a futex round trip.

use std::hint::spin_loop;
use std::thread;

#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    pub fn new() -> Self {
        Self { step: 0 }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Performs one backoff step. Returns `true` once spinning and yielding
    /// are exhausted and the caller should block instead.
    pub fn snooze(&mut self) -> bool {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            return true;
        }

        self.step += 1;
        false
    }
}
