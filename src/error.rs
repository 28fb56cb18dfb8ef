pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to spawn host thread: {0}")]
    Spawn(String),

    #[error("host already initialized")]
    AlreadyInitialized,

    #[error("timer already cancelled")]
    TimerCancelled,
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn spawn<S: Into<String>>(msg: S) -> Self {
        Error::Spawn(msg.into())
    }
}

/// Outcome of a bounded wait.
///
/// Timeouts are an expected result of `wait_timeout` style calls and are
/// reported as a value rather than through [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "a wait may have timed out"]
pub enum WaitResult {
    Success,
    TimedOut,
}

impl WaitResult {
    pub fn is_success(self) -> bool {
        matches!(self, WaitResult::Success)
    }

    pub fn is_timed_out(self) -> bool {
        matches!(self, WaitResult::TimedOut)
    }
}
