//! Cancellation token for blocking waits.
//!
//! The daemon has exactly one long blocking wait outside the service thread:
//! polling for a debugger during a debug-attach bind. The token lets `stop`
//! interrupt that wait instead of leaving an RPC thread parked forever.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cloneable cancellation flag with an interruptible sleep.
///
/// When `cancel()` is called on any clone, all clones observe it and any
/// thread blocked in [`CancellationToken::sleep`] wakes immediately.
///
/// # Example
///
/// ```
/// use soloipc_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every sleeper.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `interval` unless cancelled first.
    ///
    /// Returns `Err(CancelledError)` if the token is (or becomes) cancelled.
    pub fn sleep(&self, interval: Duration) -> Result<(), CancelledError> {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (cancelled, _) = cvar
            .wait_timeout_while(guard, interval, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        if *cancelled {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when a wait is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::SoloError {
    fn from(_: CancelledError) -> Self {
        crate::error::SoloError::Cancelled
    }
}
