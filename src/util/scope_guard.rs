/// Runs a closure when dropped, including during unwinding.
///
/// Used wherever queue or barrier bookkeeping must happen after a job body
/// regardless of whether the body panicked.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    /// Prevents the closure from running on drop.
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
