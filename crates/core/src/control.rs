//! Cooperative pause and cancel
//!
//! Traversals call [`ScanControl::checkpoint`] before dispatching new work.
//! In-flight filesystem operations are never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct PauseGate {
    paused: AtomicBool,
    resumed: Notify,
}

/// Shared pause/cancel token for one job.
///
/// Clones share both flags. [`ScanControl::fresh`] makes a token with a new
/// cancel flag that still shares the pause gate, so a dispatcher-wide pause
/// reaches every job.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
}

impl ScanControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn fresh(&self) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            gate: Arc::clone(&self.gate),
        }
    }

    pub fn pause(&self) {
        self.gate.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.gate.paused.store(false, Ordering::SeqCst);
        self.gate.resumed.notify_waiters();
    }

    /// Cancel the job. Also releases a paused checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.gate.resumed.notify_waiters();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.gate.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait while paused; fail once cancelled.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if the job was cancelled.
    pub async fn checkpoint(&self) -> Result<()> {
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            // Register before re-checking so a resume in between is not lost.
            let resumed = self.gate.resumed.notified();
            if !self.is_paused() {
                return Ok(());
            }
            resumed.await;
        }
    }
}
