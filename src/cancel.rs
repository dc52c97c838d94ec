//! Cooperative cancellation.
//!
//! Every stage of a capture pipeline observes a single `CancelToken`. The
//! token carries a shared flag plus an optional deadline, and all blocking
//! waits in this crate are expressed as polls against it, so a cancelled
//! pipeline unblocks within one poll interval instead of waiting on a remote
//! peer to close a connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on how long any stage stays blocked past cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared cancellation signal with an optional deadline.
///
/// Clones share the underlying flag: cancelling any clone cancels them all.
/// `child_with_timeout` derives a token that also expires on its own, which is
/// how per-request deadlines are layered on top of process shutdown.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a token sharing this token's flag, bounded by `timeout` or the
    /// parent deadline, whichever comes first.
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
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Bounded wait: sleeps up to `duration`, waking at `POLL_INTERVAL` to
    /// check for cancellation. Returns `false` if the wait was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep((until - now).min(POLL_INTERVAL));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn deadline_expires() {
        let token = CancelToken::with_timeout(Duration::from_millis(10));
        assert!(!token.is_cancelled());
        std::thread::sleep(Duration::from_millis(25));
        assert!(token.is_cancelled());
    }

    #[test]
    fn child_inherits_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_deadline_is_bounded_by_parent() {
        let parent = CancelToken::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(25));
        assert!(child.is_cancelled());
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let token = CancelToken::new();
        let cancel_from = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            cancel_from.cancel();
        });

        let start = Instant::now();
        let completed = token.sleep(Duration::from_secs(5));
        handle.join().expect("cancel thread");

        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
    }
}
