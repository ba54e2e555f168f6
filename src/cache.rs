use crate::config::CacheConfig;
use crate::downloads::DownloadStatus;
use crate::entry::CacheHandle;
use crate::error::{CacheError, CacheResult};
use crate::fetch::{FetchSource, HttpSource};
use crate::key::CacheKey;
use crate::registry::Registry;
use crate::sweep::{self, CacheStatistics, FsVolume, SweepReport, VolumeStats};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Download cache over one root directory.
///
/// Cheap to clone; clones share the same registry. Constructing a manager is the
/// initialization step, so there is no uninitialized state to misuse. Use one manager per
/// root directory.
#[derive(Clone)]
pub struct CacheManager {
    registry: Arc<Registry>,
    config: Arc<CacheConfig>,
}

impl CacheManager {
    /// Create the manager with the real filesystem as the source of disk-space figures.
    ///
    /// Must be called from within a tokio runtime; downloads are spawned onto it.
    pub fn initialize(config: CacheConfig, source: Arc<dyn FetchSource>) -> CacheResult<Self> {
        Self::initialize_with_volume(config, source, Arc::new(FsVolume))
    }

    pub fn initialize_with_volume(
        config: CacheConfig,
        source: Arc<dyn FetchSource>,
        volume: Arc<dyn VolumeStats>,
    ) -> CacheResult<Self> {
        let runtime = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        config.validate()?;
        config.ensure_directories_exist()?;
        clear_staging(&config.staging_dir());

        let registry = Arc::new(Registry::new(&config, source, volume, runtime));
        crate::log_info!(
            "[cache] Download cache initialized at: {} (max {} files, {} bytes)",
            config.root_dir.display(),
            config.max_count,
            config.max_total_bytes
        );

        Ok(Self {
            registry,
            config: Arc::new(config),
        })
    }

    /// Create the manager with an [`HttpSource`] built from the config's timeouts.
    pub fn with_http(config: CacheConfig) -> CacheResult<Self> {
        let source = HttpSource::new(&config)?;
        Self::initialize(config, Arc::new(source))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Acquire the entry for `identifier` (or for `key`, when given), starting a download
    /// if the content is neither registered nor on disk. Every call takes one reference;
    /// pair it with [`release`](Self::release).
    pub fn get(&self, identifier: &str, key: Option<&str>) -> CacheHandle {
        let key = CacheKey::resolve(identifier, key);
        let handle = self.registry.get_or_create(key, identifier);
        self.sweep();
        handle
    }

    /// Acquire an already registered entry without creating one or fetching.
    pub fn peek(&self, key: &str) -> Option<CacheHandle> {
        let key = CacheKey::explicit(key)?;
        self.registry.peek(&key)
    }

    /// Publish an existing file under `key`, moving it when `prefer_move` is set and
    /// copying otherwise. Returns false if the key is already taken or the file could not
    /// be placed.
    pub fn put(&self, key: &str, existing_file: &Path, prefer_move: bool) -> bool {
        let Some(key) = CacheKey::explicit(key) else {
            return false;
        };
        if !existing_file.is_file() {
            crate::log_warn!("[cache] {}: put source {} is not a file", key, existing_file.display());
            return false;
        }
        self.registry.insert_existing(key, existing_file, prefer_move)
    }

    pub fn release(&self, handle: &CacheHandle) -> i64 {
        handle.release()
    }

    pub fn invalidate(&self, handle: &CacheHandle) {
        handle.invalidate()
    }

    /// Invalidate by key without holding a handle.
    pub fn invalidate_key(&self, key: &CacheKey) {
        self.registry.invalidate(key)
    }

    /// True if the resource is registered or its file is on disk.
    pub fn contains(&self, identifier: &str, key: Option<&str>) -> bool {
        self.registry.contains(&CacheKey::resolve(identifier, key))
    }

    pub fn file_for_key(&self, key: &CacheKey) -> PathBuf {
        self.registry.file_for_key(key)
    }

    pub fn statistics(&self) -> CacheStatistics {
        sweep::statistics(&self.registry.root)
    }

    /// Sweep with the configured budgets.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_with(self.config.max_count, self.config.max_total_bytes)
    }

    pub fn sweep_with(&self, max_count: usize, max_total_bytes: u64) -> SweepReport {
        sweep::sweep(&self.registry, max_count, max_total_bytes)
    }

    pub fn in_flight(&self) -> Vec<(CacheKey, DownloadStatus)> {
        self.registry.in_flight()
    }

    /// Number of registered entries.
    pub fn entry_count(&self) -> usize {
        self.registry.live_entries()
    }

    /// Drop every entry and delete every cached file, ignoring references.
    ///
    /// Only meant for test setup and teardown.
    pub fn clear_all(&self) {
        self.registry.clear_all()
    }
}

/// Remove temp files left behind by a previous process.
fn clear_staging(staging: &Path) {
    let Ok(entries) = fs::read_dir(staging) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => crate::log_debug!("[cache] removed stale temp file {}", path.display()),
                Err(e) => crate::log_warn!(
                    "[cache] failed to remove stale temp file {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
}
