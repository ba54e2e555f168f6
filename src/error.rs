//! Error types for cache operations

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure reported by a [`FetchSource`](crate::fetch::FetchSource).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("streaming error: {0}")]
    Stream(String),
}

/// Coarse classification of a [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Cancelled,
    Filesystem,
    Invalidated,
    InvalidState,
}

/// Errors surfaced by the cache.
///
/// Cloneable because a single fetch failure is delivered to every waiting subscriber.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("transport error: {0}")]
    Transport(#[from] FetchError),

    #[error("body truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("filesystem error on {path}: {reason}")]
    Filesystem { path: PathBuf, reason: String },

    #[error("cache has been invalidated")]
    Invalidated,

    #[error("entry {0} has been evicted")]
    Evicted(String),

    #[error("no uri to download")]
    NoSource,

    #[error("cache manager requires a tokio runtime")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn fs(path: &Path, err: std::io::Error) -> Self {
        CacheError::Filesystem {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Transport(_) | CacheError::Truncated { .. } => ErrorKind::Transport,
            CacheError::Cancelled => ErrorKind::Cancelled,
            CacheError::Filesystem { .. } => ErrorKind::Filesystem,
            CacheError::Invalidated => ErrorKind::Invalidated,
            CacheError::Evicted(_)
            | CacheError::NoSource
            | CacheError::NoRuntime
            | CacheError::Config(_) => ErrorKind::InvalidState,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_cancellation_from_transport() {
        assert_eq!(CacheError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            CacheError::from(FetchError::Status(404)).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            CacheError::Truncated { expected: 10, received: 4 }.kind(),
            ErrorKind::Transport
        );
        assert!(!CacheError::from(FetchError::Request("reset".into())).is_cancelled());
    }

    #[test]
    fn invalidated_message_matches_domain_wording() {
        assert_eq!(CacheError::Invalidated.to_string(), "cache has been invalidated");
    }
}
