use crate::downloads::{DownloadControl, DownloadStatus};
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::registry::{Registry, Subscription};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Where an entry's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOrigin {
    /// Downloaded from this URI; can be fetched again after a failure.
    Fetched(String),
    /// Published from an existing file via `put`; nothing to re-fetch.
    Adopted,
}

/// Public view of an entry's fetch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Idle,
    InFlight,
    Done,
    Failed,
}

pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

pub(crate) type Subscriber = oneshot::Sender<CacheResult<PathBuf>>;

pub(crate) enum FetchState {
    Idle,
    InFlight {
        control: Arc<DownloadControl>,
        subscribers: Vec<Subscriber>,
    },
    Done,
    Failed,
}

impl FetchState {
    pub(crate) fn is_in_flight(&self) -> bool {
        matches!(self, FetchState::InFlight { .. })
    }

    pub(crate) fn phase(&self) -> FetchPhase {
        match self {
            FetchState::Idle => FetchPhase::Idle,
            FetchState::InFlight { .. } => FetchPhase::InFlight,
            FetchState::Done => FetchPhase::Done,
            FetchState::Failed => FetchPhase::Failed,
        }
    }
}

/// Identity of one entry. Survives removal from the registry so stale handles can
/// tell "invalidated" apart from "evicted".
pub(crate) struct EntryCore {
    pub(crate) id: u64,
    pub(crate) key: CacheKey,
    pub(crate) origin: CacheOrigin,
    invalidated: AtomicBool,
    progress: Mutex<Option<ProgressCallback>>,
}

impl EntryCore {
    pub(crate) fn new(id: u64, key: CacheKey, origin: CacheOrigin) -> Self {
        Self {
            id,
            key,
            origin,
            invalidated: AtomicBool::new(false),
            progress: Mutex::new(None),
        }
    }

    pub(crate) fn mark_invalidated(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_progress(&self, callback: Option<ProgressCallback>) {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    pub(crate) fn report_progress(&self, received: u64, total: Option<u64>) {
        let callback = self
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(received, total);
        }
    }

    /// The error a handle gets once its entry is no longer registered.
    pub(crate) fn detached_error(&self) -> CacheError {
        if self.is_invalidated() {
            CacheError::Invalidated
        } else {
            CacheError::Evicted(self.key.to_string())
        }
    }
}

/// Mutable per-key record, owned by the registry map and guarded by its lock.
pub(crate) struct EntrySlot {
    pub(crate) core: Arc<EntryCore>,
    pub(crate) file: Option<PathBuf>,
    pub(crate) ref_count: i64,
    pub(crate) fetch: FetchState,
    pub(crate) last_error: Option<CacheError>,
}

impl EntrySlot {
    pub(crate) fn idle(core: Arc<EntryCore>) -> Self {
        Self {
            core,
            file: None,
            ref_count: 0,
            fetch: FetchState::Idle,
            last_error: None,
        }
    }

    pub(crate) fn done(core: Arc<EntryCore>, file: PathBuf) -> Self {
        Self {
            core,
            file: Some(file),
            ref_count: 0,
            fetch: FetchState::Done,
            last_error: None,
        }
    }

    pub(crate) fn belongs_to(&self, core: &EntryCore) -> bool {
        self.core.id == core.id
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.ref_count <= 0 && !self.fetch.is_in_flight()
    }

    /// Unreferenced and holding no file: a failed or cancelled fetch nobody waits on.
    pub(crate) fn is_dead(&self) -> bool {
        self.file.is_none() && self.is_evictable()
    }

    /// Resolve every queued subscriber with the same outcome, exactly once.
    pub(crate) fn notify_subscribers(subscribers: Vec<Subscriber>, outcome: &CacheResult<PathBuf>) {
        for tx in subscribers {
            let _ = tx.send(outcome.clone());
        }
    }
}

/// A consumer's lease on one cache entry, returned by `get` and `peek`.
///
/// Each successful `get`/`peek` counts one reference; call [`release`](Self::release)
/// once when done so the sweeper may reclaim the file.
pub struct CacheHandle {
    registry: Arc<Registry>,
    core: Arc<EntryCore>,
}

impl CacheHandle {
    pub(crate) fn new(registry: Arc<Registry>, core: Arc<EntryCore>) -> Self {
        Self { registry, core }
    }

    pub fn key(&self) -> &CacheKey {
        &self.core.key
    }

    pub fn origin(&self) -> &CacheOrigin {
        &self.core.origin
    }

    /// Wait for the file.
    ///
    /// Served immediately when the content is already on disk; otherwise this call joins
    /// the in-flight download (starting one if the last attempt failed).
    pub async fn file(&self) -> CacheResult<PathBuf> {
        match self.registry.subscribe(&self.core)? {
            Subscription::Ready(path) => Ok(path),
            Subscription::Pending(rx) => rx.await.unwrap_or(Err(CacheError::Cancelled)),
        }
    }

    /// The file if it is materialized right now; `None` while fetching or after failure.
    pub fn cached_file(&self) -> Option<PathBuf> {
        self.registry.cached_file(&self.core)
    }

    pub fn phase(&self) -> Option<FetchPhase> {
        self.registry.phase(&self.core)
    }

    pub fn ref_count(&self) -> i64 {
        self.registry.ref_count(&self.core)
    }

    pub fn add_ref(&self) {
        self.registry.add_ref(&self.core)
    }

    /// Drop one reference; returns the remaining count, never below zero.
    pub fn release(&self) -> i64 {
        self.registry.release_entry(&self.core)
    }

    /// Remove the entry and delete its file now, even if other consumers hold references.
    pub fn invalidate(&self) {
        self.registry.invalidate_entry(&self.core)
    }

    pub fn is_invalidated(&self) -> bool {
        self.core.is_invalidated()
    }

    /// Abort an in-flight download. Waiters are resolved with [`CacheError::Cancelled`]
    /// once the transfer has wound down.
    pub fn cancel(&self) {
        self.registry.cancel(&self.core)
    }

    pub fn pause(&self) {
        self.registry.set_paused(&self.core, true)
    }

    pub fn resume(&self) {
        self.registry.set_paused(&self.core, false)
    }

    /// Called from the download task with `(bytes_received, total_bytes)` per chunk.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        self.core.set_progress(Some(Arc::new(callback)));
    }

    pub fn status(&self) -> DownloadStatus {
        self.registry.status(&self.core)
    }

    pub fn last_error(&self) -> Option<CacheError> {
        self.registry.last_error(&self.core)
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.core.key)
            .field("origin", &self.core.origin)
            .field("invalidated", &self.core.is_invalidated())
            .finish()
    }
}
