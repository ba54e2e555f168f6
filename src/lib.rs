//! Download cache: maps a resource identifier to a local file, coalesces concurrent
//! downloads of the same resource, reference-counts consumers and evicts least recently
//! used files under count and disk-space budgets.

#[macro_use]
pub mod logging;

pub mod cache;
pub mod config;
pub mod downloads;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod key;
pub mod sweep;

mod fetcher;
mod registry;

pub use cache::CacheManager;
pub use config::{CacheConfig, LogPaths};
pub use downloads::DownloadStatus;
pub use entry::{CacheHandle, CacheOrigin, FetchPhase};
pub use error::{CacheError, CacheResult, ErrorKind, FetchError};
pub use fetch::{FetchResponse, FetchSource, HttpSource};
pub use key::CacheKey;
pub use sweep::{CacheStatistics, FixedVolume, FsVolume, SweepReport, VolumeCapacity, VolumeStats};
