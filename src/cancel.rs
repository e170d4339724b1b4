// src/cancel.rs

//! Cancellation tokens for long-running operations
//!
//! Downloads and child processes poll a [`CancelToken`] between chunks or
//! wait intervals. A token trips either when `cancel()` is called on any
//! clone or when its deadline passes. Child tokens inherit the parent's
//! flag and take the earlier of the two deadlines.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a token sharing this one's flag with an additional timeout
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Return `Err(Error::Cancelled)` if the token has tripped
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_deadline_trips() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_shares_flag_and_takes_earlier_deadline() {
        let parent = CancelToken::with_timeout(Duration::from_secs(3600));
        let child = parent.child_with_timeout(Duration::from_secs(1));
        assert!(child.remaining().unwrap() <= Duration::from_secs(1));

        parent.cancel();
        assert!(child.is_cancelled());
    }
}
