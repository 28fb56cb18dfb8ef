use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::executor::Host;
use parking_lot::Mutex;
use std::sync::OnceLock;

// Process-wide host backing the fixed tiers and every context, barrier and
// timer created without an explicit host.
static GLOBAL_HOST: OnceLock<Host> = OnceLock::new();

// Serializes explicit initialization against itself.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Starts the process-wide host with the default configuration.
pub fn init() -> Result<()> {
    init_with_config(HostConfig::default())
}

/// Starts the process-wide host with `config`.
///
/// Must run before anything touches the global host; once the host exists
/// (explicitly or lazily) this returns [`Error::AlreadyInitialized`].
pub fn init_with_config(config: HostConfig) -> Result<()> {
    config.validate()?;

    let _guard = INIT_LOCK.lock();
    if GLOBAL_HOST.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let host = Host::new(config)?;
    // a concurrent lazy `host()` call may still have won the race
    GLOBAL_HOST.set(host).map_err(|_| Error::AlreadyInitialized)
}

/// The process-wide host, started with the default configuration on first
/// use if [`init_with_config`] was never called.
///
/// # Panics
///
/// Panics if the default host cannot spawn its threads.
pub fn host() -> &'static Host {
    GLOBAL_HOST.get_or_init(|| {
        Host::new(HostConfig::default()).expect("failed to start the default dispatch host")
    })
}

pub fn is_initialized() -> bool {
    GLOBAL_HOST.get().is_some()
}
