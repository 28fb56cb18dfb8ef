pub use crate::config::{HostConfig, HostConfigBuilder};
pub use crate::dispatch::{
    ContextMode, CountingSemaphore, ExecutionContext, JoinBarrier, RecurringTimer, Task,
    TaskFlags,
};
pub use crate::error::{Error, Result, WaitResult};
pub use crate::executor::Tier;
pub use crate::{init, init_with_config};
