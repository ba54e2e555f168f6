use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the private staging area for in-flight transfers, inside the cache root.
pub const STAGING_DIR_NAME: &str = ".partial";

const DEFAULT_MAX_COUNT: usize = 200;
const DEFAULT_MAX_TOTAL_BYTES: u64 = if cfg!(debug_assertions) {
    20 * 1000 * 1000 // 20MB
} else {
    1000 * 1000 * 1000 // 1GB
};
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Cache root and budgets, supplied once when the manager is initialized.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Flat directory holding one file per key.
    pub root_dir: PathBuf,

    /// Sweep until fewer than this many files remain.
    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Static byte budget; the effective budget may be smaller on a small or full disk.
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default)]
    pub logs: Option<LogPaths>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogPaths {
    pub log_file: PathBuf,
    pub error_file: PathBuf,
}

fn default_max_count() -> usize {
    DEFAULT_MAX_COUNT
}

fn default_max_total_bytes() -> u64 {
    DEFAULT_MAX_TOTAL_BYTES
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

impl CacheConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_count: DEFAULT_MAX_COUNT,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            logs: None,
        }
    }

    /// Default layout for an application: `<user cache dir>/<app>/downloads`, logs alongside.
    pub fn for_app(app_name: &str) -> CacheResult<Self> {
        let base = dirs::cache_dir()
            .ok_or_else(|| CacheError::Config("Failed to get user cache directory".to_string()))?
            .join(app_name);

        let mut config = Self::new(base.join("downloads"));
        config.logs = Some(LogPaths {
            log_file: base.join("logs").join("cache_logs.txt"),
            error_file: base.join("logs").join("cache_errors.txt"),
        });
        Ok(config)
    }

    pub fn with_limits(mut self, max_count: usize, max_total_bytes: u64) -> Self {
        self.max_count = max_count;
        self.max_total_bytes = max_total_bytes;
        self
    }

    pub fn from_json(content: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| CacheError::Config(format!("Failed to parse cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CacheError::fs(path, e))?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> CacheResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Config(format!("Failed to serialize cache config: {}", e)))
    }

    /// Override fields from `DOWNLOAD_CACHE_DIR`, `DOWNLOAD_CACHE_MAX_COUNT` and
    /// `DOWNLOAD_CACHE_MAX_BYTES` when they are set.
    pub fn apply_env_overrides(&mut self) -> CacheResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> CacheResult<()> {
        if let Some(dir) = lookup("DOWNLOAD_CACHE_DIR") {
            self.root_dir = PathBuf::from(dir);
        }
        if let Some(count) = lookup("DOWNLOAD_CACHE_MAX_COUNT") {
            self.max_count = count
                .parse()
                .map_err(|e| CacheError::Config(format!("DOWNLOAD_CACHE_MAX_COUNT: {}", e)))?;
        }
        if let Some(bytes) = lookup("DOWNLOAD_CACHE_MAX_BYTES") {
            self.max_total_bytes = bytes
                .parse()
                .map_err(|e| CacheError::Config(format!("DOWNLOAD_CACHE_MAX_BYTES: {}", e)))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.max_count == 0 {
            return Err(CacheError::Config("max_count must be at least 1".to_string()));
        }
        if self.max_total_bytes == 0 {
            return Err(CacheError::Config(
                "max_total_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root_dir.join(STAGING_DIR_NAME)
    }

    /// Ensure the root, staging and log directories exist.
    pub fn ensure_directories_exist(&self) -> CacheResult<()> {
        let mut dirs_to_create = vec![self.root_dir.clone(), self.staging_dir()];
        if let Some(logs) = &self.logs {
            for file in [&logs.log_file, &logs.error_file] {
                if let Some(parent) = file.parent() {
                    dirs_to_create.push(parent.to_path_buf());
                }
            }
        }

        for dir in dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(&dir).map_err(|e| CacheError::fs(&dir, e))?;
            }
        }

        Ok(())
    }
}
