#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use download_cache::{
    CacheConfig, CacheManager, FetchError, FetchResponse, FetchSource, FixedVolume,
    VolumeCapacity,
};
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

const OPEN: usize = 1 << 20;
const CHUNK: usize = 4;

/// In-memory source. Every fetch waits at a gate before answering, so tests can line up
/// subscribers while the transfer is still pending.
pub struct MockSource {
    gate: Semaphore,
    fetches: AtomicUsize,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    short: Mutex<HashSet<String>>,
}

impl MockSource {
    pub fn open() -> Arc<Self> {
        let source = Self::gated();
        source.release_gate();
        source
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            fetches: AtomicUsize::new(0),
            bodies: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            short: Mutex::new(HashSet::new()),
        })
    }

    pub fn release_gate(&self) {
        self.gate.add_permits(OPEN);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_body(&self, uri: &str, body: &[u8]) {
        self.bodies.lock().unwrap().insert(uri.to_string(), body.to_vec());
    }

    /// Answer `uri` with HTTP 503 until [`heal`](Self::heal) is called.
    pub fn fail(&self, uri: &str) {
        self.failing.lock().unwrap().insert(uri.to_string());
    }

    pub fn heal(&self, uri: &str) {
        self.failing.lock().unwrap().remove(uri);
    }

    /// Announce more bytes for `uri` than the body carries.
    pub fn truncate(&self, uri: &str) {
        self.short.lock().unwrap().insert(uri.to_string());
    }

    pub fn body(&self, uri: &str) -> Vec<u8> {
        self.bodies
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_else(|| format!("body of {}", uri).into_bytes())
    }
}

#[async_trait]
impl FetchSource for MockSource {
    async fn fetch(&self, uri: &str) -> Result<FetchResponse, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| FetchError::Request("gate closed".to_string()))?;

        if self.failing.lock().unwrap().contains(uri) {
            return Err(FetchError::Status(503));
        }

        let body = self.body(uri);
        let mut announced = body.len() as u64;
        if self.short.lock().unwrap().contains(uri) {
            announced += 10;
        }

        let chunks: Vec<Result<Bytes, FetchError>> = body
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(FetchResponse::new(Some(announced), stream::iter(chunks).boxed()))
    }
}

/// A volume so large the static budgets always win.
pub fn roomy_volume() -> Arc<FixedVolume> {
    Arc::new(FixedVolume(VolumeCapacity {
        total: 1 << 50,
        free: 1 << 50,
    }))
}

pub fn manager(root: &Path, source: Arc<MockSource>) -> CacheManager {
    manager_with_limits(root, source, 200, 1 << 40)
}

pub fn manager_with_limits(
    root: &Path,
    source: Arc<MockSource>,
    max_count: usize,
    max_total_bytes: u64,
) -> CacheManager {
    let config = CacheConfig::new(root).with_limits(max_count, max_total_bytes);
    CacheManager::initialize_with_volume(config, source, roomy_volume()).unwrap()
}
