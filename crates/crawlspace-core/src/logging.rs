//! Process-wide log suppression.
//!
//! While a process is attached to a foreign mount namespace, any log sink
//! that opens or rotates files would resolve paths inside the container.
//! Attaching suppresses logging and detaching resumes it; the subscriber
//! consults [`is_suppressed`] for every event.

use std::sync::atomic::{AtomicUsize, Ordering};

static SUPPRESSION_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Suppresses log output until the matching [`resume`].
pub fn suppress() {
    let _ = SUPPRESSION_DEPTH.fetch_add(1, Ordering::SeqCst);
}

/// Ends one [`suppress`] scope. Unbalanced calls are ignored.
pub fn resume() {
    let _ = SUPPRESSION_DEPTH.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
        depth.checked_sub(1)
    });
}

/// Whether any suppression scope is active.
pub fn is_suppressed() -> bool {
    depth() > 0
}

/// Number of open suppression scopes.
pub fn depth() -> usize {
    SUPPRESSION_DEPTH.load(Ordering::SeqCst)
}

/// Serializes tests that open suppression scopes, so depth checks see
/// only their own scopes.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
