//! The byte-stream capability the cache downloads through.

use crate::config::CacheConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use std::time::Duration;

/// An opened transfer: announced length (if any) and the body as a stream of chunks.
pub struct FetchResponse {
    pub total_bytes: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl FetchResponse {
    pub fn new(
        total_bytes: Option<u64>,
        body: BoxStream<'static, Result<Bytes, FetchError>>,
    ) -> Self {
        Self { total_bytes, body }
    }
}

/// Opens a byte stream for a URI. Dropping the returned stream aborts the transfer.
#[async_trait]
pub trait FetchSource: Send + Sync + 'static {
    async fn fetch(&self, uri: &str) -> Result<FetchResponse, FetchError>;
}

/// [`FetchSource`] over HTTP(S).
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &CacheConfig) -> Result<Self, FetchError> {
        // No overall request timeout; the per-read limit is applied by the fetcher.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| FetchError::Request(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchSource for HttpSource {
    async fn fetch(&self, uri: &str) -> Result<FetchResponse, FetchError> {
        let resp = self
            .client
            .get(uri)
            .header("Accept-Encoding", "identity")
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // Chunked responses may still announce their size out of band.
        let expected_length = resp
            .headers()
            .get("X-Expected-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let total_bytes = resp.content_length().or(expected_length);

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FetchError::Stream(e.to_string())))
            .boxed();

        Ok(FetchResponse::new(total_bytes, body))
    }
}
