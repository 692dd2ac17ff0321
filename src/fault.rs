//! One-way latch recording that fixture I/O has permanently degraded.

use std::sync::{Arc, Mutex, PoisonError};

/// Shared-state guard for unrecoverable I/O failure.
///
/// The first fault wins: later faults on other ports never overwrite the
/// recorded message. The latch never clears on its own; [`FaultLatch::reset`]
/// exists only for the start of a fresh bench session. Handles are cheap
/// clones of the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct FaultLatch {
    state: Arc<Mutex<Option<String>>>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault. Only the first call per session takes effect.
    pub fn latch(&self, message: impl Into<String>) {
        let mut state = self.lock();
        if state.is_none() {
            let message = message.into();
            log::error!("I/O fault latched: {message}");
            *state = Some(message);
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.lock().is_some()
    }

    /// Fault flag plus the recorded message (empty when not faulted).
    pub fn info(&self) -> (bool, String) {
        match &*self.lock() {
            Some(message) => (true, message.clone()),
            None => (false, String::new()),
        }
    }

    /// Clear the latch. Only valid at session start, before any I/O.
    pub fn reset(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // A panicking callback elsewhere must not wedge fault reporting.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
