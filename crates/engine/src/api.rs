//! Public API types for the `cadgate` build engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single progress notification from a running build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Human-readable phase description (e.g. `"Rebuilding model"`).
    pub message: String,
    /// Completion percentage, clamped to `0..=100`.
    pub percent: u8,
}

/// One-shot cooperative cancellation flag.
///
/// The cache sets it when an entry is preempted (or on shutdown); the worker
/// polls it between interruptible phases and bails out promptly once set.
/// Clones share the flag. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Poll the flag.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Failure raised by a worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    /// The worker observed its cancel token and stopped.
    #[error("build cancelled")]
    Cancelled,
    /// The build itself failed.
    #[error("{0}")]
    Failed(String),
}

/// Outcome of [`SingleflightCache::submit`](crate::SingleflightCache::submit)
/// as seen by one observer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    /// This submission's entry was replaced by a request for a different
    /// fingerprint before it finished.
    #[error("build superseded by a newer request")]
    Cancelled,
    /// The worker for the joined entry failed; every observer of that entry
    /// sees the same message.
    #[error("{0}")]
    Worker(String),
}

/// A build function handed to the cache.
///
/// Invoked exactly once, on a dedicated worker thread. `report` forwards to
/// the entry's broadcaster and never blocks on slow observers; the token
/// must be polled at every interruptible point.
pub type Worker<R> =
    Box<dyn FnOnce(&dyn Fn(&str, u8), &CancelToken) -> Result<R, BuildError> + Send + 'static>;
