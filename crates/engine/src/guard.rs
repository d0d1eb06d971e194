//! Cleanup on unwind
//!
//! A unit of work that panics never returns a `Result`, so the scope it ran
//! in would otherwise stay open and keep the thread context modified.

/// Runs `action` on drop unless disarmed
pub(crate) struct UnwindGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> UnwindGuard<F> {
    pub(crate) fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// The unit of work returned normally; skip the action
    pub(crate) fn disarm(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for UnwindGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
