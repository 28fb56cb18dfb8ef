//! veda-dispatch - structured work submission over a tiered host scheduler
//!
//! Application code gets a small typed vocabulary for running work: execution
//! contexts (fixed priority tiers and custom serial or concurrent queues),
//! single-shot tasks, join barriers, counting semaphores and recurring
//! timers. Threads are owned by the host scheduler in [`executor`]; the
//! [`dispatch`] layer never spawns any.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use veda_dispatch::prelude::*;
//!
//! let io = ExecutionContext::serial("io");
//! let barrier = JoinBarrier::new();
//!
//! for i in 0..4 {
//!     barrier.async_into(&io, move || println!("write {}", i));
//! }
//! barrier.notify(&ExecutionContext::main(), || println!("all written"));
//! barrier.wait();
//!
//! let timer = RecurringTimer::start(
//!     &ExecutionContext::global(Tier::Utility),
//!     Duration::from_millis(500),
//!     Duration::from_millis(50),
//!     || println!("tick"),
//! );
//! std::thread::sleep(Duration::from_secs(2));
//! timer.cancel();
//! ```
//!
//! # Features
//!
//! - **Execution contexts**: six fixed tiers plus custom queues that can be
//!   redirected onto each other, suspended and resumed
//! - **Barriers**: exclusive work items on concurrent contexts
//! - **Identity probe**: ask whether code runs on a given context, through
//!   any chain of redirections
//! - **Recurring timers**: idempotent suspend/resume over a strict host
//!   trigger, monotonic or wall-clock schedules
//! - **Tasks and barriers**: single-shot work with completion continuations,
//!   join barriers with notifications

#![warn(missing_debug_implementations)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod runtime;
pub mod util;

pub use config::{HostConfig, HostConfigBuilder};
pub use dispatch::{
    ContextBuilder, ContextId, ContextMode, CountingSemaphore, ExecutionContext, JoinBarrier,
    LeaveToken, RecurringTimer, Task, TaskFlags, TaskState, WeakRecurringTimer,
};
pub use error::{Error, Result, WaitResult};
pub use executor::{Host, Tier};
pub use runtime::{init, init_with_config};
