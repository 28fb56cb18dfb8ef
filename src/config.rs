use crate::error::{Error, Result};
use crate::executor::PanicStrategy;
use std::time::Duration;

/// Settings for a [`Host`](crate::executor::Host).
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Pool workers shared by every tier except `Main`. `None` picks
    /// `max(num_cpus, 4)`.
    pub num_threads: Option<usize>,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub panic_strategy: PanicStrategy,
    /// Upper bound on how long the clock thread sleeps while a wall-clock
    /// deadline is pending, so that system clock changes are noticed.
    pub wall_clock_resolution: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            thread_name_prefix: "veda-dispatch".to_string(),
            stack_size: Some(2 * 1024 * 1024),
            panic_strategy: PanicStrategy::default(),
            wall_clock_resolution: Duration::from_millis(50),
        }
    }
}

impl HostConfig {
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(Error::config("num_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if self.thread_name_prefix.is_empty() {
            return Err(Error::config("thread_name_prefix must not be empty"));
        }

        if self.wall_clock_resolution.is_zero() {
            return Err(Error::config("wall_clock_resolution must be > 0"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads
            .unwrap_or_else(|| num_cpus::get().max(4))
    }
}

#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn wall_clock_resolution(mut self, resolution: Duration) -> Self {
        self.config.wall_clock_resolution = resolution;
        self
    }

    pub fn build(self) -> Result<HostConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
