pub mod backoff;
pub(crate) mod scope_guard;

pub use backoff::Backoff;
pub(crate) use scope_guard::ScopeGuard;
