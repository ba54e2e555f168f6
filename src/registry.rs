//! Key -> entry map. Every state transition of every entry (creation, reference counts,
//! subscriber lists, fetch completion, invalidation, eviction) happens under one mutex.

use crate::config::CacheConfig;
use crate::downloads::{DownloadControl, DownloadStatus};
use crate::entry::{
    CacheHandle, CacheOrigin, EntryCore, EntrySlot, FetchPhase, FetchState,
};
use crate::error::{CacheError, CacheResult};
use crate::fetch::FetchSource;
use crate::fetcher;
use crate::key::CacheKey;
use crate::sweep::VolumeStats;
use filetime::FileTime;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

pub(crate) enum Subscription {
    Ready(PathBuf),
    Pending(oneshot::Receiver<CacheResult<PathBuf>>),
}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) entries: HashMap<CacheKey, EntrySlot>,
}

impl RegistryState {
    fn slot_mut(&mut self, core: &EntryCore) -> Option<&mut EntrySlot> {
        self.entries
            .get_mut(&core.key)
            .filter(|slot| slot.belongs_to(core))
    }

    fn slot(&self, core: &EntryCore) -> Option<&EntrySlot> {
        self.entries.get(&core.key).filter(|slot| slot.belongs_to(core))
    }
}

pub(crate) struct Registry {
    pub(crate) root: PathBuf,
    pub(crate) staging: PathBuf,
    pub(crate) source: Arc<dyn FetchSource>,
    pub(crate) volume: Arc<dyn VolumeStats>,
    pub(crate) read_timeout: Duration,
    /// Re-entrancy guard for the sweeper.
    pub(crate) sweeping: AtomicBool,
    state: Mutex<RegistryState>,
    runtime: Handle,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new(
        config: &CacheConfig,
        source: Arc<dyn FetchSource>,
        volume: Arc<dyn VolumeStats>,
        runtime: Handle,
    ) -> Self {
        Self {
            root: config.root_dir.clone(),
            staging: config.staging_dir(),
            source,
            volume,
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
            sweeping: AtomicBool::new(false),
            state: Mutex::new(RegistryState::default()),
            runtime,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn file_for_key(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub(crate) fn staging_path(&self, key: &CacheKey, id: u64) -> PathBuf {
        self.staging.join(format!("{}.{}.part", key, id))
    }

    /// Look up or create the entry for `key` and take one reference on it.
    ///
    /// A file already on disk under `key` is adopted (and touched) instead of fetched.
    pub(crate) fn get_or_create(self: &Arc<Self>, key: CacheKey, uri: &str) -> CacheHandle {
        let mut state = self.lock();

        if let Some(slot) = state.entries.get_mut(&key) {
            crate::log_debug!("[cache] {}: from cache list", key);
            slot.ref_count += 1;
            if slot.file.is_none() && !slot.fetch.is_in_flight() {
                self.start_fetch(slot);
            }
            return CacheHandle::new(self.clone(), slot.core.clone());
        }

        let core = Arc::new(EntryCore::new(
            self.next_id(),
            key.clone(),
            CacheOrigin::Fetched(uri.to_string()),
        ));
        let path = self.file_for_key(&key);
        let mut slot = if path.is_file() {
            crate::log_debug!("[cache] {}: reuse existing file", key);
            touch(&path);
            EntrySlot::done(core.clone(), path)
        } else {
            crate::log_debug!("[cache] {}: new", key);
            let mut slot = EntrySlot::idle(core.clone());
            self.start_fetch(&mut slot);
            slot
        };
        slot.ref_count = 1;
        state.entries.insert(key, slot);

        CacheHandle::new(self.clone(), core)
    }

    /// Like `get_or_create`, but never creates an entry and never fetches.
    pub(crate) fn peek(self: &Arc<Self>, key: &CacheKey) -> Option<CacheHandle> {
        let mut state = self.lock();
        let slot = state.entries.get_mut(key)?;
        slot.ref_count += 1;
        Some(CacheHandle::new(self.clone(), slot.core.clone()))
    }

    /// Kick off a transfer for `slot`. Must be called with the registry lock held.
    fn start_fetch(self: &Arc<Self>, slot: &mut EntrySlot) {
        debug_assert!(
            !slot.fetch.is_in_flight(),
            "internal error: download twice for {}",
            slot.core.key
        );
        if slot.fetch.is_in_flight() {
            crate::log_error!("[cache] {}: internal error: download twice", slot.core.key);
            return;
        }
        let uri = match &slot.core.origin {
            CacheOrigin::Fetched(uri) => uri.clone(),
            CacheOrigin::Adopted => return,
        };

        let control = Arc::new(DownloadControl::new());
        slot.file = None;
        slot.fetch = FetchState::InFlight {
            control: control.clone(),
            subscribers: Vec::new(),
        };
        self.runtime.spawn(fetcher::run(
            self.clone(),
            slot.core.clone(),
            uri,
            control,
        ));
    }

    /// Register interest in an entry's file. Checking the state and queueing the
    /// subscriber happen under the same lock the fetch completion drains under.
    pub(crate) fn subscribe(self: &Arc<Self>, core: &Arc<EntryCore>) -> CacheResult<Subscription> {
        let mut state = self.lock();
        let slot = state
            .slot_mut(core)
            .ok_or_else(|| core.detached_error())?;

        if let Some(file) = &slot.file {
            crate::log_debug!("[cache] {}: file is available in cache", core.key);
            return Ok(Subscription::Ready(file.clone()));
        }

        if !slot.fetch.is_in_flight() {
            if core.origin == CacheOrigin::Adopted {
                let err = CacheError::NoSource;
                slot.last_error = Some(err.clone());
                return Err(err);
            }
            self.start_fetch(slot);
        }

        let (tx, rx) = oneshot::channel();
        if let FetchState::InFlight { subscribers, .. } = &mut slot.fetch {
            subscribers.push(tx);
        }
        Ok(Subscription::Pending(rx))
    }

    /// Publish the outcome of a transfer and resolve every queued subscriber.
    ///
    /// `staged` is the finished temp file; it is renamed into place only if the entry is
    /// still registered, so an invalidated entry never resurrects its file.
    pub(crate) fn complete_fetch(
        &self,
        core: &EntryCore,
        control: &Arc<DownloadControl>,
        staged: CacheResult<PathBuf>,
    ) {
        let mut state = self.lock();
        let final_path = self.file_for_key(&core.key);

        let slot = match state.slot_mut(core) {
            Some(slot) => slot,
            None => {
                if let Ok(temp) = staged {
                    let _ = fs::remove_file(&temp);
                }
                crate::log_debug!("[cache] {}: entry gone before download finished", core.key);
                return;
            }
        };

        let subscribers = match std::mem::replace(&mut slot.fetch, FetchState::Idle) {
            FetchState::InFlight {
                control: current,
                subscribers,
            } if Arc::ptr_eq(&current, control) => subscribers,
            other => {
                slot.fetch = other;
                if let Ok(temp) = staged {
                    let _ = fs::remove_file(&temp);
                }
                crate::log_warn!("[cache] {}: stale download completion ignored", core.key);
                return;
            }
        };

        let outcome = staged.and_then(|temp| match fs::rename(&temp, &final_path) {
            Ok(()) => Ok(final_path),
            Err(e) => {
                let _ = fs::remove_file(&temp);
                Err(CacheError::fs(&final_path, e))
            }
        });

        match &outcome {
            Ok(path) => {
                crate::log_info!("[cache] {}: download complete -> {}", core.key, path.display());
                slot.file = Some(path.clone());
                slot.fetch = FetchState::Done;
                slot.last_error = None;
            }
            Err(err) => {
                if err.is_cancelled() {
                    crate::log_info!("[cache] {}: download cancelled", core.key);
                } else {
                    crate::log_warn!("[cache] {}: download failed: {}", core.key, err);
                }
                slot.file = None;
                slot.fetch = FetchState::Failed;
                slot.last_error = Some(err.clone());
            }
        }

        EntrySlot::notify_subscribers(subscribers, &outcome);
    }

    pub(crate) fn add_ref(&self, core: &EntryCore) {
        let mut state = self.lock();
        if let Some(slot) = state.slot_mut(core) {
            slot.ref_count = slot.ref_count.max(0) + 1;
        }
    }

    pub(crate) fn ref_count(&self, core: &EntryCore) -> i64 {
        self.lock().slot(core).map_or(0, |slot| slot.ref_count)
    }

    pub(crate) fn release_entry(&self, core: &EntryCore) -> i64 {
        let mut state = self.lock();
        match state.slot_mut(core) {
            Some(slot) => decrement(slot),
            None => 0,
        }
    }

    /// Invalidate whatever entry is registered under `key`.
    pub(crate) fn invalidate(&self, key: &CacheKey) {
        let mut state = self.lock();
        if let Some(slot) = state.entries.remove(key) {
            slot.core.mark_invalidated();
            discard_slot(slot, CacheError::Invalidated);
        }
    }

    pub(crate) fn invalidate_entry(&self, core: &EntryCore) {
        let mut state = self.lock();
        core.mark_invalidated();
        if state.slot(core).is_some() {
            if let Some(slot) = state.entries.remove(&core.key) {
                discard_slot(slot, CacheError::Invalidated);
            }
        }
    }

    /// Publish an existing file under `key` without fetching. Fails if the key is already
    /// registered or its file already exists.
    ///
    /// A move is a rename under the lock; when that fails (e.g. across filesystems) it
    /// degrades to a copy into staging, done without the lock, then a rename.
    pub(crate) fn insert_existing(&self, key: CacheKey, source: &Path, prefer_move: bool) -> bool {
        if prefer_move {
            match self.publish(&key, source) {
                Ok(published) => return published,
                Err(e) => crate::log_debug!(
                    "[cache] {}: rename of {} failed ({}), copying instead",
                    key,
                    source.display(),
                    e
                ),
            }
        }

        let temp = self.staging_path(&key, self.next_id());
        if let Err(e) = fs::copy(source, &temp) {
            let _ = fs::remove_file(&temp);
            crate::log_warn!("[cache] {}: failed to copy {}: {}", key, source.display(), e);
            return false;
        }

        match self.publish(&key, &temp) {
            Ok(true) => {
                if prefer_move {
                    if let Err(e) = fs::remove_file(source) {
                        crate::log_warn!(
                            "[cache] {}: failed to remove moved file {}: {}",
                            key,
                            source.display(),
                            e
                        );
                    }
                }
                true
            }
            Ok(false) => {
                let _ = fs::remove_file(&temp);
                false
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                crate::log_warn!("[cache] {}: failed to publish {}: {}", key, source.display(), e);
                false
            }
        }
    }

    /// Rename `from` into place and register it as an adopted entry. `Ok(false)` when the
    /// key is already taken.
    fn publish(&self, key: &CacheKey, from: &Path) -> io::Result<bool> {
        let mut state = self.lock();
        let target = self.file_for_key(key);
        if state.entries.contains_key(key) || target.exists() {
            return Ok(false);
        }
        fs::rename(from, &target)?;

        touch(&target);
        let core = Arc::new(EntryCore::new(self.next_id(), key.clone(), CacheOrigin::Adopted));
        crate::log_debug!("[cache] {}: adopted {}", key, from.display());
        state
            .entries
            .insert(key.clone(), EntrySlot::done(core, target));
        Ok(true)
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        let state = self.lock();
        state.entries.contains_key(key) || self.file_for_key(key).is_file()
    }

    pub(crate) fn cached_file(&self, core: &EntryCore) -> Option<PathBuf> {
        self.lock().slot(core).and_then(|slot| slot.file.clone())
    }

    pub(crate) fn phase(&self, core: &EntryCore) -> Option<FetchPhase> {
        self.lock().slot(core).map(|slot| slot.fetch.phase())
    }

    pub(crate) fn last_error(&self, core: &EntryCore) -> Option<CacheError> {
        match self.lock().slot(core) {
            Some(slot) => slot.last_error.clone(),
            None => Some(core.detached_error()),
        }
    }

    pub(crate) fn cancel(&self, core: &EntryCore) {
        let state = self.lock();
        if let Some(EntrySlot {
            fetch: FetchState::InFlight { control, .. },
            ..
        }) = state.slot(core)
        {
            crate::log_info!("[cache] {}: cancel requested", core.key);
            control.request_cancel();
        }
    }

    pub(crate) fn set_paused(&self, core: &EntryCore, pause: bool) {
        let state = self.lock();
        if let Some(EntrySlot {
            fetch: FetchState::InFlight { control, .. },
            ..
        }) = state.slot(core)
        {
            control.set_paused(pause);
        }
    }

    pub(crate) fn status(&self, core: &EntryCore) -> DownloadStatus {
        let state = self.lock();
        match state.slot(core) {
            Some(slot) => slot_status(slot),
            None => DownloadStatus {
                bytes_received: 0,
                total_bytes: None,
                in_flight: false,
                completed: false,
            },
        }
    }

    pub(crate) fn in_flight(&self) -> Vec<(CacheKey, DownloadStatus)> {
        let state = self.lock();
        let mut items: Vec<(CacheKey, DownloadStatus)> = state
            .entries
            .iter()
            .filter(|(_, slot)| slot.fetch.is_in_flight())
            .map(|(key, slot)| (key.clone(), slot_status(slot)))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub(crate) fn live_entries(&self) -> usize {
        self.lock().entries.len()
    }

    /// Wipe the map and every file under the root, ignoring reference counts.
    pub(crate) fn clear_all(&self) {
        let mut state = self.lock();
        for (_, slot) in state.entries.drain() {
            if let FetchState::InFlight {
                control,
                subscribers,
            } = slot.fetch
            {
                control.request_cancel();
                EntrySlot::notify_subscribers(subscribers, &Err(CacheError::Cancelled));
            }
        }

        for dir in [&self.root, &self.staging] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    crate::log_error!("[cache] clear cache error on {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    if let Err(e) = fs::remove_file(&path) {
                        crate::log_error!("[cache] clear cache error on {}: {}", path.display(), e);
                    }
                }
            }
        }
        crate::log_info!("[cache] Cache cleared");
    }

    /// Remove the registered entry for a file the sweeper has just deleted.
    pub(crate) fn forget(state: &mut RegistryState, key: &CacheKey) {
        state.entries.remove(key);
    }

    /// Drop entries with no file and no references. Returns how many were dropped.
    pub(crate) fn prune_dead(state: &mut RegistryState) -> usize {
        let before = state.entries.len();
        state.entries.retain(|key, slot| {
            if slot.is_dead() {
                crate::log_debug!("[cache] {}: dropped unreferenced failed entry", key);
                false
            } else {
                true
            }
        });
        before - state.entries.len()
    }
}

fn decrement(slot: &mut EntrySlot) -> i64 {
    slot.ref_count = (slot.ref_count - 1).max(0);
    slot.ref_count
}

fn slot_status(slot: &EntrySlot) -> DownloadStatus {
    match &slot.fetch {
        FetchState::InFlight { control, .. } => {
            let (bytes_received, total_bytes) = control.progress();
            DownloadStatus {
                bytes_received,
                total_bytes,
                in_flight: true,
                completed: false,
            }
        }
        _ => {
            let size = slot
                .file
                .as_ref()
                .and_then(|file| fs::metadata(file).ok())
                .map(|meta| meta.len());
            DownloadStatus {
                bytes_received: size.unwrap_or(0),
                total_bytes: size,
                in_flight: false,
                completed: size.is_some(),
            }
        }
    }
}

/// Tear down a slot that has just been removed from the map: abort its transfer,
/// resolve its waiters and delete its file.
fn discard_slot(slot: EntrySlot, reason: CacheError) {
    crate::log_info!("[cache] {}: invalidated", slot.core.key);
    if let FetchState::InFlight {
        control,
        subscribers,
    } = slot.fetch
    {
        control.request_cancel();
        EntrySlot::notify_subscribers(subscribers, &Err(reason));
    }
    if let Some(file) = slot.file {
        if let Err(e) = fs::remove_file(&file) {
            if e.kind() != io::ErrorKind::NotFound {
                crate::log_error!("[cache] remove cache error on {}: {}", file.display(), e);
            }
        }
    }
}

/// Set the file's modification time to now; the sweeper evicts by mtime.
pub(crate) fn touch(path: &Path) {
    if let Err(e) = filetime::set_file_mtime(path, FileTime::now()) {
        crate::log_warn!("[cache] failed to touch {}: {}", path.display(), e);
    }
}
