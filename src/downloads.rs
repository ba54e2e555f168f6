use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Control state for a single in-flight transfer.
pub struct DownloadControl {
    paused: AtomicBool,
    cancel: CancellationToken,
    notify: Notify,
    bytes_received: AtomicU64,
    total_bytes: AtomicU64,
}

/// Progress snapshot for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadStatus {
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub in_flight: bool,
    pub completed: bool,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            notify: Notify::new(),
            bytes_received: AtomicU64::new(0),
            total_bytes: AtomicU64::new(UNKNOWN_TOTAL),
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
        // Wake any paused waiter so it can observe cancel
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn set_paused(&self, pause: bool) {
        self.paused.store(pause, Ordering::SeqCst);
        // Wake any waiters so they can re-check state
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn wait_while_paused_or_until_cancel(&self) {
        loop {
            // Register interest before checking so a concurrent resume is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_paused() || self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn record_progress(&self, bytes_received: u64, total_bytes: Option<u64>) {
        self.bytes_received.store(bytes_received, Ordering::Relaxed);
        self.total_bytes
            .store(total_bytes.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
    }

    pub fn progress(&self) -> (u64, Option<u64>) {
        let total = self.total_bytes.load(Ordering::Relaxed);
        (
            self.bytes_received.load(Ordering::Relaxed),
            (total != UNKNOWN_TOTAL).then_some(total),
        )
    }
}

impl Default for DownloadControl {
    fn default() -> Self {
        Self::new()
    }
}
