//! Artifact fetching
//!
//! Streams a URL into a local file. The cache owns naming, validation and
//! the rename into place; a fetcher only writes bytes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config;
use crate::error::CacheError;
use crate::utils::{bytes_to_mb, ProgressTracker};
use crate::{log_debug, log_error, log_info};

const MODULE: &str = "cache::fetch";

/// Bytes received so far and the announced total, if any
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.downloaded as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Result of one fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub written: u64,
    /// Length announced by the server
    pub expected: Option<u64>,
}

pub type ProgressCallback = dyn Fn(DownloadProgress) + Send + Sync;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the body of `url` to `dest`, replacing any existing file
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressCallback,
    ) -> Result<FetchOutcome, CacheError>;
}

/// HTTP(S) fetcher backed by reqwest
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, CacheError> {
        let client = Client::builder()
            .user_agent(config::app::USER_AGENT)
            .connect_timeout(Duration::from_secs(config::download::CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CacheError::Io(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressCallback,
    ) -> Result<FetchOutcome, CacheError> {
        let transient = |reason: String| CacheError::Transient {
            url: url.to_string(),
            reason,
        };

        log_info!(MODULE, "Starting download: {}", url);
        let response = self.client.get(url).send().await.map_err(|e| {
            log_error!(MODULE, "Failed to start download: {}", e);
            transient(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            log_error!(MODULE, "Download failed with status: {}", status);
            let reason = format!("HTTP status {}", status);
            return Err(if is_retryable_status(status) {
                transient(reason)
            } else {
                CacheError::Unavailable {
                    url: url.to_string(),
                    reason,
                }
            });
        }

        let expected = response.content_length();
        log_info!(
            MODULE,
            "Download size: {} bytes ({:.2} MB)",
            expected.unwrap_or(0),
            bytes_to_mb(expected.unwrap_or(0))
        );

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CacheError::Io(format!("Failed to create {}: {}", dest.display(), e)))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut tracker = ProgressTracker::new(
            "Download",
            MODULE,
            expected.unwrap_or(0),
            config::logging::DOWNLOAD_LOG_INTERVAL_MB,
        );

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transient(format!("Download error: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CacheError::Io(format!("Failed to write chunk: {}", e)))?;
            written += chunk.len() as u64;
            tracker.update(chunk.len() as u64);
            progress(DownloadProgress {
                downloaded: written,
                total: expected,
            });
        }

        file.sync_all()
            .await
            .map_err(|e| CacheError::Io(format!("Failed to sync {}: {}", dest.display(), e)))?;
        tracker.finish();

        Ok(FetchOutcome { written, expected })
    }
}

/// Server errors, throttling and timeouts may clear up on their own
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// SHA-256 of a file as lowercase hex
///
/// Runs on the blocking pool; BSP archives are several gigabytes.
pub async fn sha256_file(path: &Path) -> Result<String, CacheError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || calculate_sha256(&path))
        .await
        .map_err(|e| CacheError::Io(format!("SHA256 task failed: {}", e)))?
        .map_err(CacheError::Io)
}

fn calculate_sha256(path: &Path) -> Result<String, String> {
    use std::io::Read;

    log_debug!(MODULE, "Calculating SHA256 of: {}", path.display());
    let mut file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open {} for SHA: {}", path.display(), e))?;
    let total = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; config::download::CHUNK_SIZE];
    let mut tracker =
        ProgressTracker::new("SHA256", MODULE, total, config::logging::SHA_LOG_INTERVAL_MB);

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| format!("Failed to read {} for SHA: {}", path.display(), e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        tracker.update(bytes_read as u64);
    }

    let hash = hex::encode(hasher.finalize());
    log_debug!(MODULE, "Calculated SHA256: {}", hash);
    Ok(hash)
}
