//! Progress reporting and cooperative cancellation for long operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Passed into long-running operations. Implementations must be cheap to
/// poll; operations check [`is_cancelled`](Self::is_cancelled) between tile
/// batches.
pub trait ProgressReporter: Sync {
    /// Completion in percent (0..=100).
    fn report(&self, percent: u8);

    fn is_cancelled(&self) -> bool;
}

/// Reporter that ignores progress and never cancels.
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn report(&self, _percent: u8) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shared cancel flag plus last reported percentage. Clones observe the
/// same state, so a UI thread can hold one and cancel the other.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    percent: Arc<AtomicU8>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
        self.percent.store(0, Ordering::Relaxed);
    }

    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for CancelFlag {
    fn report(&self, percent: u8) {
        self.percent.store(percent.min(100), Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Cancels itself once a given number of polls have happened. Handy for
/// exercising mid-operation cancellation.
#[derive(Debug)]
pub struct CancelAfter {
    remaining: std::sync::atomic::AtomicUsize,
}

impl CancelAfter {
    pub fn new(polls: usize) -> Self {
        Self {
            remaining: std::sync::atomic::AtomicUsize::new(polls),
        }
    }
}

impl ProgressReporter for CancelAfter {
    fn report(&self, _percent: u8) {}

    fn is_cancelled(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let a = CancelFlag::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        b.report(140);
        assert_eq!(a.percent(), 100);
    }

    #[test]
    fn cancel_after_counts_polls() {
        let p = CancelAfter::new(2);
        assert!(!p.is_cancelled());
        assert!(!p.is_cancelled());
        assert!(p.is_cancelled());
        assert!(p.is_cancelled());
    }
}
