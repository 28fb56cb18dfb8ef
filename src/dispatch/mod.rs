//! The dispatch vocabulary: contexts to run work on, single-shot tasks, join
//! barriers, semaphores and recurring timers, all backed by the global host.

pub mod context;
pub mod group;
pub mod probe;
pub mod semaphore;
pub mod task;
pub mod timer;

pub use context::{ContextBuilder, ContextId, ContextMode, CustomContext, ExecutionContext};
pub use group::{JoinBarrier, LeaveToken};
pub use probe::{assert_not_on, assert_on, current_context_id};
pub use semaphore::CountingSemaphore;
pub use task::{Task, TaskFlags, TaskId, TaskState};
pub use timer::{RecurringTimer, WeakRecurringTimer};
