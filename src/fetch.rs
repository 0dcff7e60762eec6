// src/fetch.rs

//! Resource fetching with integrity verification
//!
//! Sources and resources are kept in a content-addressed cache keyed by their
//! SHA-256 hash, not by URL: URLs rot or move, content does not. Fetching is
//! idempotent (a cached hash is reused without re-downloading) and concurrent
//! fetches of the same hash coalesce behind a per-hash lock so exactly one
//! transport download happens.
//!
//! The transport itself is a collaborator behind a trait; the HTTP
//! implementation here uses a blocking client with bounded retries.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Transport collaborator: moves bytes from a URL to a local path
pub trait Transport: Send + Sync {
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// HTTP transport with retry support
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::FetchUnavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }
}

impl Transport for HttpTransport {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest.display());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::FetchUnavailable(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let mut file = File::create(dest)?;
                    io::copy(&mut response, &mut file)
                        .map_err(|e| Error::FetchUnavailable(format!("read body failed: {}", e)))?;

                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::FetchUnavailable(format!(
                            "failed to download {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// Content-addressed source cache
pub struct SourceCache {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    /// Per-hash locks so concurrent fetches of one hash coalesce
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            transport,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a verified resource; returns the cached, content-addressed path
    ///
    /// A cache hit performs no transport call. On a hash mismatch the
    /// downloaded content is discarded, never installed into the cache.
    pub fn fetch(&self, url: &str, expected_sha256: &str) -> Result<PathBuf> {
        let lock = self.lock_for(expected_sha256);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let cached = self.root.join(expected_sha256);
        if cached.exists() {
            debug!("Cache hit for {} ({})", url, expected_sha256);
            return Ok(cached);
        }

        let partial = self.root.join(format!("{}.partial", expected_sha256));
        let result = self.download_and_verify(url, expected_sha256, &partial, &cached);
        if result.is_err() && partial.exists() {
            let _ = fs::remove_file(&partial);
        }
        result?;

        Ok(cached)
    }

    fn download_and_verify(
        &self,
        url: &str,
        expected_sha256: &str,
        partial: &Path,
        cached: &Path,
    ) -> Result<()> {
        self.transport.download(url, partial)?;

        let actual = sha256_file(partial)?;
        if actual != expected_sha256 {
            return Err(Error::IntegrityMismatch {
                expected: expected_sha256.to_string(),
                actual,
            });
        }

        // Atomic rename: the keyed cache path only ever holds verified content.
        fs::rename(partial, cached)?;
        debug!("Cached {} as {}", url, expected_sha256);
        Ok(())
    }

    /// Fetch a branch-tracked (HEAD) source without hash verification
    ///
    /// Content is a moving target, so this always re-downloads; transport
    /// failures still surface as `FetchUnavailable`.
    pub fn fetch_unverified(&self, url: &str) -> Result<PathBuf> {
        let key = sha256_hex(url.as_bytes());
        let head_dir = self.root.join("head");
        fs::create_dir_all(&head_dir)?;

        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dest = head_dir.join(&key);
        let partial = head_dir.join(format!("{}.partial", key));

        let result = self.transport.download(url, &partial);
        if result.is_err() && partial.exists() {
            let _ = fs::remove_file(&partial);
        }
        result?;

        fs::rename(&partial, &dest)?;
        Ok(dest)
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// SHA-256 of a file's content, lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
