//! Build generations
//!
//! Each build takes a [`Generation`] from the shared [`CancellationToken`]. Starting a new
//! build, or cancelling explicitly, bumps the counter and every older generation becomes
//! stale at once. Builds poll [`Generation::check`] at their suspension points and unwind
//! with [`MirrorError::Cancelled`] when stale.

use crate::error::MirrorError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    current: Arc<AtomicU64>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, invalidating every earlier one.
    pub fn begin(&self) -> Generation {
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            id,
            current: self.current.clone(),
        }
    }

    /// Invalidate the running generation without starting a new build.
    pub fn cancel(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Latest generation handed out.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// The running generation, without invalidating anything.
    pub fn generation(&self) -> Generation {
        Generation {
            id: self.current(),
            current: self.current.clone(),
        }
    }
}

/// One build's view of the token.
#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    current: Arc<AtomicU64>,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// False once a newer build began or this one was cancelled.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.id
    }

    /// `Err(MirrorError::Cancelled)` once this generation is stale.
    pub fn check(&self) -> Result<(), MirrorError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(MirrorError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generation_invalidates_previous() {
        let token = CancellationToken::new();
        let first = token.begin();
        assert!(first.check().is_ok());

        let second = token.begin();
        assert!(!first.is_current());
        assert!(matches!(first.check(), Err(MirrorError::Cancelled)));
        assert!(second.is_current());
        assert!(second.id() > first.id());
    }

    #[test]
    fn test_cancel_without_new_build() {
        let token = CancellationToken::new();
        let gen = token.begin();
        token.cancel();
        assert!(gen.check().is_err());
        assert_eq!(token.current(), gen.id() + 1);
    }

    #[test]
    fn test_generation_view_follows_token() {
        let token = CancellationToken::new();
        let started = token.begin();
        let view = token.generation();
        assert_eq!(view.id(), started.id());
        assert!(view.is_current());

        token.cancel();
        assert!(!view.is_current());
    }
}
