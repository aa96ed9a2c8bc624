//! Cooperative cancellation token shared across async tasks.
//!
//! Long operations check the token at their natural suspension points: every
//! read chunk while hashing, every file boundary during import, every binding
//! during resolve, every link during mapping. No OS signals are involved.

use crate::error::LibraryError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation token for cooperative cancellation.
///
/// Clones share state: cancelling any clone cancels them all.
///
/// # Example
///
/// ```
/// use ocelot_library::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, un-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Observed by all clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(LibraryError::Cancelled)` if cancellation was requested.
    ///
    /// Convenience for `token.check()?` at loop checkpoints.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(LibraryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
        assert!(matches!(b.check(), Err(LibraryError::Cancelled)));
    }
}
