//! Content-addressed artifact cache with retrying, single-flight fetches.
//!
//! Archives are stored as `cache/<sha256>--<filename>`. A cached file is
//! re-hashed before reuse, so a corrupted entry is discarded and fetched
//! again instead of reaching a build. Concurrent requests for the same key
//! serialize on a per-key async lock: the first performs the transfer and
//! the rest find the verified file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keg_schema::{PackageName, Sha256Digest, SourceLocator};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::download::{DownloadError, DownloadRequest, hash_file};
use super::git::{self, GitError};
use crate::Reporter;
use crate::paths::{Layout, filename_from_url};

/// Failure to obtain a verified source.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Every attempt failed; carries the last cause.
    #[error("failed to fetch {url} after {attempts} attempt(s): {cause}")]
    Fetch {
        /// Source URL.
        url: String,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        cause: String,
    },

    /// The downloaded content does not match the declared checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    Integrity {
        /// Source URL.
        url: String,
        /// Declared digest.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },

    /// A VCS checkout failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Local I/O failure while managing the cache.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A verified source ready for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedSource {
    /// Verified archive in the cache.
    Archive {
        /// Cached file.
        path: PathBuf,
        /// Original file name, for format detection.
        filename: String,
        /// Verified digest.
        sha256: String,
    },
    /// Checked-out repository.
    Checkout {
        /// Working tree in the git cache.
        path: PathBuf,
        /// Resolved commit id.
        revision: String,
    },
}

impl FetchedSource {
    /// Digest or commit recorded in the install receipt.
    pub fn provenance(&self) -> &str {
        match self {
            Self::Archive { sha256, .. } => sha256,
            Self::Checkout { revision, .. } => revision,
        }
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles each time.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given zero-based failed attempt: `base * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.min(16))
    }
}

/// Artifact cache shared by every package of a run.
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    git_root: PathBuf,
    client: Client,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactCache {
    /// Create the cache under the layout's `cache/` directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(layout: &Layout, retry: RetryPolicy) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Fetch {
                url: String::new(),
                attempts: 0,
                cause: e.to_string(),
            })?;
        Ok(Self {
            root: layout.cache_path(),
            git_root: layout.git_cache_path(),
            client,
            retry,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache location of an archive.
    pub fn archive_path(&self, sha256: &Sha256Digest, url: &str) -> PathBuf {
        let filename = filename_from_url(url);
        let filename = if filename.is_empty() { "source" } else { filename };
        self.root.join(format!("{sha256}--{filename}"))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Obtain a verified local copy of `locator`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Integrity`] on checksum mismatch (never retried)
    /// and [`FetchError::Fetch`] once transient failures exhaust the retry
    /// policy.
    pub async fn fetch<R: Reporter>(
        &self,
        name: &PackageName,
        version: &str,
        locator: &SourceLocator,
        reporter: &R,
    ) -> Result<FetchedSource, FetchError> {
        match locator {
            SourceLocator::Archive { url, sha256 } => {
                self.fetch_archive(name, version, url, sha256, reporter)
                    .await
            }
            SourceLocator::Git { url, reference } => self.fetch_git(url, reference.as_deref()).await,
        }
    }

    async fn fetch_archive<R: Reporter>(
        &self,
        name: &PackageName,
        version: &str,
        url: &str,
        sha256: &Sha256Digest,
        reporter: &R,
    ) -> Result<FetchedSource, FetchError> {
        let lock = self.key_lock(sha256.as_str());
        let _guard = lock.lock().await;

        let dest = self.archive_path(sha256, url);
        let filename = filename_from_url(url).to_string();

        if dest.exists() {
            let actual = hash_file(&dest).await?;
            if sha256.matches(&actual) {
                debug!("cache hit for {name} ({})", dest.display());
                return Ok(FetchedSource::Archive {
                    path: dest,
                    filename,
                    sha256: actual,
                });
            }
            warn!("cached {} is corrupt, fetching again", dest.display());
            tokio::fs::remove_file(&dest).await?;
        }

        tokio::fs::create_dir_all(&self.root).await?;
        info!("fetching {url}");

        let mut attempt = 0;
        loop {
            let part = tempfile::Builder::new()
                .prefix(".download-")
                .tempfile_in(&self.root)?
                .into_temp_path();

            let result = DownloadRequest {
                client: &self.client,
                pkg_name: name,
                version,
                url,
                dest: &part,
                expected: sha256,
                reporter,
            }
            .execute()
            .await;

            match result {
                Ok(actual) => {
                    part.persist(&dest).map_err(|e| FetchError::Io(e.error))?;
                    return Ok(FetchedSource::Archive {
                        path: dest,
                        filename,
                        sha256: actual,
                    });
                }
                Err(DownloadError::HashMismatch { expected, actual }) => {
                    return Err(FetchError::Integrity {
                        url: url.to_string(),
                        expected,
                        actual,
                    });
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "fetch of {url} failed (attempt {}): {e}; retrying in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(FetchError::Fetch {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        cause: e.to_string(),
                    });
                }
            }
        }
    }

    async fn fetch_git(&self, url: &str, reference: Option<&str>) -> Result<FetchedSource, FetchError> {
        let key = git::checkout_key(url, reference);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        info!("fetching {url} ({})", reference.unwrap_or("HEAD"));

        let mut attempt = 0;
        loop {
            let git_root = self.git_root.clone();
            let url_owned = url.to_string();
            let reference = reference.map(str::to_string);
            let result = tokio::task::spawn_blocking(move || {
                git::checkout(&git_root, &url_owned, reference.as_deref())
            })
            .await
            .map_err(std::io::Error::other)?;

            match result {
                Ok((path, revision)) => {
                    debug!("checked out {url} at {revision}");
                    return Ok(FetchedSource::Checkout { path, revision });
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "git fetch of {url} failed (attempt {}): {e}; retrying in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(FetchError::Fetch {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        cause: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
