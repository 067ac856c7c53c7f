//! Guard against blocking waits on threads that must stay responsive.
//!
//! A UI (or any event-loop) thread marks itself once; every blocking
//! convenience call then refuses to run there instead of hanging it.

use std::cell::Cell;

use crate::error::ApduError;

thread_local! {
    static NON_BLOCKING: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as one that must never block on the key.
pub fn mark_current_thread_non_blocking() {
    NON_BLOCKING.with(|f| f.set(true));
}

/// Undo [`mark_current_thread_non_blocking`].
pub fn clear_current_thread_non_blocking() {
    NON_BLOCKING.with(|f| f.set(false));
}

pub fn is_current_thread_non_blocking() -> bool {
    NON_BLOCKING.with(|f| f.get())
}

/// Fail with [`ApduError::BlockingNotAllowed`] on a non-blocking thread.
pub(crate) fn ensure_blocking_allowed(operation: &'static str) -> Result<(), ApduError> {
    if is_current_thread_non_blocking() {
        tracing::error!(operation, "Blocking call on a non-blocking thread");
        return Err(ApduError::BlockingNotAllowed);
    }
    Ok(())
}
