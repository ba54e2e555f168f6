//! Eviction: keep the cache root under its file-count and byte budgets by deleting the
//! least recently used files that nobody holds a reference on.

use crate::key::CacheKey;
use crate::registry::Registry;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

/// Space on the volume holding the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeCapacity {
    pub total: u64,
    pub free: u64,
}

pub trait VolumeStats: Send + Sync + 'static {
    fn capacity(&self, path: &Path) -> io::Result<VolumeCapacity>;
}

/// Queries the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsVolume;

impl VolumeStats for FsVolume {
    fn capacity(&self, path: &Path) -> io::Result<VolumeCapacity> {
        let total = fs2::total_space(path)?;
        // Space reserved for root does not count.
        let free = fs2::free_space(path)?.min(fs2::available_space(path)?);
        Ok(VolumeCapacity { total, free })
    }
}

/// Reports the same numbers every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedVolume(pub VolumeCapacity);

impl VolumeStats for FixedVolume {
    fn capacity(&self, _path: &Path) -> io::Result<VolumeCapacity> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub count: usize,
    pub total_size: u64,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Keys whose files were deleted.
    pub removed: Vec<CacheKey>,
    pub freed_bytes: u64,
    /// Files left after the sweep.
    pub count: usize,
    pub total_size: u64,
    /// Byte budget the sweep enforced.
    pub budget: u64,
    /// Registry entries dropped because their fetch failed and nobody holds them.
    pub pruned: usize,
    /// False when another sweep was already running and this one did nothing.
    pub ran: bool,
}

/// The byte budget actually enforced: the static budget, capped at 5% of the volume and
/// at a tenth of (free space + current cache size).
pub fn effective_budget(
    static_budget: u64,
    volume: Option<VolumeCapacity>,
    cache_size: u64,
) -> u64 {
    let Some(volume) = volume else {
        return static_budget;
    };
    let by_capacity = (volume.total as u128 * 5 / 100) as u64;
    let by_free = ((volume.free as u128 + cache_size as u128) / 10) as u64;
    static_budget.min(by_capacity).min(by_free)
}

pub(crate) struct CacheFile {
    pub(crate) key: CacheKey,
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
    pub(crate) modified: SystemTime,
}

/// Regular files directly under `root`. Directories (the staging area) are skipped.
pub(crate) fn list_cache_files(root: &Path) -> io::Result<Vec<CacheFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                crate::log_warn!("[cache] skipping unreadable entry in {}: {}", root.display(), e);
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        files.push(CacheFile {
            key: CacheKey::from_file_name(name),
            path: entry.path(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(files)
}

pub(crate) fn statistics(root: &Path) -> CacheStatistics {
    match list_cache_files(root) {
        Ok(files) => CacheStatistics {
            count: files.len(),
            total_size: files.iter().map(|f| f.size).sum(),
        },
        Err(e) => {
            crate::log_warn!("[cache] failed to list {}: {}", root.display(), e);
            CacheStatistics::default()
        }
    }
}

struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Delete least recently used, unreferenced files until both budgets hold.
///
/// A file is deletable when no entry is registered for it or its entry has no references
/// and no transfer running. Files that cannot be removed are logged and skipped. Entries
/// left without a file by a failed fetch and no longer referenced are dropped first.
pub(crate) fn sweep(registry: &Registry, max_count: usize, max_bytes: u64) -> SweepReport {
    let Some(_guard) = SweepGuard::acquire(&registry.sweeping) else {
        crate::log_debug!("[cache] sweep already running");
        return SweepReport::default();
    };

    let pruned = Registry::prune_dead(&mut registry.lock());

    let mut files = match list_cache_files(&registry.root) {
        Ok(files) => files,
        Err(e) => {
            crate::log_error!("[cache] sweep failed to list {}: {}", registry.root.display(), e);
            return SweepReport {
                ran: true,
                pruned,
                ..SweepReport::default()
            };
        }
    };

    let mut count = files.len();
    let mut total_size: u64 = files.iter().map(|f| f.size).sum();

    let volume = match registry.volume.capacity(&registry.root) {
        Ok(volume) => Some(volume),
        Err(e) => {
            crate::log_warn!("[cache] failed to query disk space: {}", e);
            None
        }
    };
    let budget = effective_budget(max_bytes, volume, total_size);

    let mut report = SweepReport {
        budget,
        ran: true,
        pruned,
        ..SweepReport::default()
    };

    if count < max_count && total_size < budget {
        report.count = count;
        report.total_size = total_size;
        return report;
    }

    crate::log_debug!(
        "[cache] sweep: {} files, {} bytes, budget {} files / {} bytes",
        count,
        total_size,
        max_count,
        budget
    );

    // Newest first; candidates are taken from the tail.
    files.sort_by(|a, b| b.modified.cmp(&a.modified));

    let mut state = registry.lock();
    for file in files.iter().rev() {
        if count < max_count && total_size < budget {
            break;
        }
        let evictable = state
            .entries
            .get(&file.key)
            .map_or(true, |slot| slot.is_evictable());
        if !evictable {
            continue;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                crate::log_error!("[cache] remove cache error on {}: {}", file.path.display(), e);
                continue;
            }
        }
        Registry::forget(&mut state, &file.key);
        crate::log_debug!("[cache] {}: evicted ({} bytes)", file.key, file.size);
        count -= 1;
        total_size = total_size.saturating_sub(file.size);
        report.freed_bytes += file.size;
        report.removed.push(file.key.clone());
    }
    drop(state);

    if !report.removed.is_empty() {
        crate::log_info!(
            "[cache] swept {} files, freed {} bytes",
            report.removed.len(),
            report.freed_bytes
        );
    }
    report.count = count;
    report.total_size = total_size;
    report
}
