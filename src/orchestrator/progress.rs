//! Progress reporting as a non-blocking channel send.
//!
//! The orchestrator never blocks on progress: updates go through a bounded
//! channel with drop-on-full semantics, consumed by the queue layer. Percent
//! values are clamped monotonic at the sender so consumers can trust the
//! ordering guarantee.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
}

/// Sending half handed to the orchestrator.
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressUpdate>,
    last_percent: AtomicU8,
}

impl ProgressSender {
    /// Bounded channel; 64 slots is plenty for one sequential job.
    pub fn channel() -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                tx,
                last_percent: AtomicU8::new(0),
            },
            rx,
        )
    }

    /// Best-effort send. Updates may be dropped under load; percent never
    /// goes backwards.
    pub fn send(&self, percent: u8, message: impl Into<String>) {
        let clamped = self
            .last_percent
            .fetch_max(percent.min(100), Ordering::Relaxed)
            .max(percent.min(100));
        let _ = self.tx.try_send(ProgressUpdate {
            percent: clamped,
            message: message.into(),
        });
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent.load(Ordering::Relaxed)
    }
}
