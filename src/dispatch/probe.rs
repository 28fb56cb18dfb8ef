//! "Am I running on this context?"
//!
//! Every custom context attaches its own [`ContextId`] to its host queue,
//! keyed by a key only that context holds. While a job runs, the host keeps
//! the queues executing it on a thread-local stack, outermost target first,
//! so a lookup sees the context itself and every context it is redirected
//! onto. The main tier is answered by the host directly. The pooled tiers
//! share their worker threads and cannot be told apart, so they always
//! report `false`.

use super::context::{ContextId, ExecutionContext};
use crate::executor::{get_specific, SpecificKey, Tier};
use crate::runtime;
use std::sync::OnceLock;

/// Key every custom context also stores its id under, so the innermost one
/// can be found without knowing which context to ask about.
pub(crate) fn innermost_key() -> &'static SpecificKey<ContextId> {
    static KEY: OnceLock<SpecificKey<ContextId>> = OnceLock::new();
    KEY.get_or_init(SpecificKey::new)
}

pub fn is_current(context: &ExecutionContext) -> bool {
    match context {
        ExecutionContext::Fixed(Tier::Main) => runtime::host().is_main_thread(),
        ExecutionContext::Fixed(_) => false,
        ExecutionContext::Custom(custom) => get_specific(custom.key()) == Some(custom.id()),
    }
}

/// Id of the innermost custom context running the calling code.
pub fn current_context_id() -> Option<ContextId> {
    get_specific(innermost_key())
}

/// # Panics
///
/// Panics unless the calling code runs on `context`.
#[track_caller]
pub fn assert_on(context: &ExecutionContext) {
    assert!(
        is_current(context),
        "expected to run on context '{}'",
        context.label()
    );
}

/// # Panics
///
/// Panics if the calling code runs on `context`.
#[track_caller]
pub fn assert_not_on(context: &ExecutionContext) {
    assert!(
        !is_current(context),
        "expected not to run on context '{}'",
        context.label()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_custom_context_sees_itself() {
        let context = ExecutionContext::serial("probe");
        assert!(!context.is_current());

        let probe = context.clone();
        assert!(context.dispatch_sync(move || probe.is_current()));
    }

    #[test]
    fn test_target_chain_is_visible() {
        let outer = ExecutionContext::concurrent("outer");
        let inner = ExecutionContext::builder("inner").target(&outer).build();
        let unrelated = ExecutionContext::serial("unrelated");

        let (o, i, u) = (outer.clone(), inner.clone(), unrelated.clone());
        let seen = inner.dispatch_sync(move || (o.is_current(), i.is_current(), u.is_current()));
        assert_eq!(seen, (true, true, false));

        let i = inner.clone();
        assert!(!outer.dispatch_sync(move || i.is_current()));
    }

    #[test]
    fn test_current_context_id_is_innermost() {
        let outer = ExecutionContext::serial("id-outer");
        let inner = ExecutionContext::builder("id-inner").target(&outer).build();

        assert_eq!(current_context_id(), None);
        assert_eq!(inner.dispatch_sync(current_context_id), inner.id());
        assert_eq!(outer.dispatch_sync(current_context_id), outer.id());
    }

    #[test]
    fn test_main_tier_probe() {
        let main = ExecutionContext::main();
        assert!(!main.is_current());

        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = main.clone();
        main.dispatch_async(move || tx.send(probe.is_current()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn test_pooled_tiers_report_false() {
        for tier in &Tier::ALL[1..] {
            let context = ExecutionContext::global(*tier);
            let probe = context.clone();
            assert!(!context.dispatch_sync(move || probe.is_current()));
        }
    }

    #[test]
    fn test_preconditions() {
        let context = ExecutionContext::serial("assert");
        assert_not_on(&context);
        let probe = context.clone();
        context.dispatch_sync(move || assert_on(&probe));
    }

    #[test]
    #[should_panic(expected = "expected to run on context 'elsewhere'")]
    fn test_assert_on_fails_off_context() {
        assert_on(&ExecutionContext::serial("elsewhere"));
    }
}
