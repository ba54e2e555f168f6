//! The per-entry download task: stream the source into a staging file, then hand the
//! result back to the registry.

use crate::downloads::DownloadControl;
use crate::entry::EntryCore;
use crate::error::{CacheError, CacheResult, FetchError};
use crate::registry::Registry;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs as tokio_fs;
use tokio::io::{AsyncWriteExt, BufWriter};

const WRITE_BUFFER_BYTES: usize = 64 * 1024;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) async fn run(
    registry: Arc<Registry>,
    core: Arc<EntryCore>,
    uri: String,
    control: Arc<DownloadControl>,
) {
    let temp_path = registry.staging_path(&core.key, core.id);
    crate::log_info!("[cache] {}: start download {}", core.key, uri);

    let result = transfer(&registry, &core, &uri, &control, &temp_path).await;
    if result.is_err() {
        if let Err(e) = tokio_fs::remove_file(&temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                crate::log_warn!(
                    "[cache] {}: failed to remove temp file {}: {}",
                    core.key,
                    temp_path.display(),
                    e
                );
            }
        }
    }

    registry.complete_fetch(&core, &control, result);
}

async fn transfer(
    registry: &Registry,
    core: &EntryCore,
    uri: &str,
    control: &DownloadControl,
    temp_path: &Path,
) -> CacheResult<PathBuf> {
    let response = tokio::select! {
        _ = control.cancelled() => return Err(CacheError::Cancelled),
        res = registry.source.fetch(uri) => res?,
    };
    let expected = response.total_bytes;
    let mut body = response.body;

    if let Some(parent) = temp_path.parent() {
        tokio_fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::fs(parent, e))?;
    }
    let file = tokio_fs::File::create(temp_path)
        .await
        .map_err(|e| CacheError::fs(temp_path, e))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

    let mut received: u64 = 0;
    let mut last_log = Instant::now();
    control.record_progress(0, expected);
    core.report_progress(0, expected);

    loop {
        if control.is_paused() {
            crate::log_debug!("[cache] {}: paused at {} bytes", core.key, received);
            control.wait_while_paused_or_until_cancel().await;
        }
        if control.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let next = tokio::select! {
            _ = control.cancelled() => return Err(CacheError::Cancelled),
            next = tokio::time::timeout(registry.read_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(FetchError::Stream(format!(
                    "no data for {}s",
                    registry.read_timeout.as_secs()
                ))
                .into())
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| CacheError::fs(temp_path, e))?;
        received += chunk.len() as u64;
        control.record_progress(received, expected);
        core.report_progress(received, expected);

        if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
            last_log = Instant::now();
            crate::log_debug!(
                "[cache] {}: {} / {} bytes",
                core.key,
                received,
                expected.map_or_else(|| "?".to_string(), |t| t.to_string())
            );
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| CacheError::fs(temp_path, e))?;
    drop(writer);

    if let Some(expected) = expected {
        if received < expected {
            return Err(CacheError::Truncated { expected, received });
        }
    }

    Ok(temp_path.to_path_buf())
}
