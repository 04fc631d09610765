//! Time budget and cancellation for a session.
//!
//! A session may be interrupted by an operator abort ([`CancelToken`]) or by
//! its own wall-clock deadline. Both are checked at the controller's suspension
//! points (agent call, tool call) and both end the session as cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Shared operator abort flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a budget check stopped the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupt::Cancelled => f.write_str("cancelled by operator"),
            Interrupt::DeadlineExceeded => f.write_str("session timed out"),
        }
    }
}

/// Deadline plus cancel token for one session.
#[derive(Debug, Clone)]
pub struct SessionBudget {
    deadline: Instant,
    cancel: CancelToken,
}

impl SessionBudget {
    pub fn new(timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Fail fast if the session should stop.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if self.remaining().is_zero() {
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Return the remaining time budget until the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::from_secs(0))
    }

    /// Clamp a per-call timeout to what is left of the session.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    /// Sleep for `delay`, waking early on cancellation or deadline.
    pub fn sleep(&self, delay: Duration) -> Result<(), Interrupt> {
        const SLICE: Duration = Duration::from_millis(50);
        let until = Instant::now() + delay;
        loop {
            self.check()?;
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            thread::sleep(left.min(SLICE));
        }
    }
}
