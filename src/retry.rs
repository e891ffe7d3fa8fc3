//! Single bounded retry
//!
//! Runs an operation, and when it fails with an error the caller classifies
//! as recoverable, runs a recovery step and tries exactly once more. The
//! policy remembers that it already retried, so a second recoverable failure
//! is returned as-is, even across calls.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Retry policy allowing one recovery attempt per policy lifetime
#[derive(Debug, Default)]
pub struct RetryOnce {
    retried: AtomicBool,
}

impl RetryOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the single retry has been spent
    pub fn has_retried(&self) -> bool {
        self.retried.load(Ordering::SeqCst)
    }

    /// Run `op`; on a recoverable error run `recover` and `op` once more
    pub fn run<T, E, Op, Classify, Recover>(
        &self,
        mut op: Op,
        is_recoverable: Classify,
        recover: Recover,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Result<T, E>,
        Classify: Fn(&E) -> bool,
        Recover: FnOnce(),
        E: std::fmt::Display,
    {
        match op() {
            Ok(value) => Ok(value),
            Err(e) if is_recoverable(&e) && !self.retried.swap(true, Ordering::SeqCst) => {
                warn!("Recoverable failure, retrying once: {}", e);
                recover();
                op()
            }
            Err(e) => Err(e),
        }
    }
}
