//! Source downloads with streaming SHA256 verification.
//!
//! `http(s)://` URLs are streamed with `reqwest`; `file://` URLs and plain
//! paths are copied. Either way the bytes are hashed as they are written and
//! the destination is deleted when the digest does not match.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use futures::StreamExt;
use keg_schema::{PackageName, Sha256Digest};
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::Reporter;

/// Failure of a single download attempt.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP status {status} for {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// Local I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The content does not match the declared checksum.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Declared digest.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },
}

impl DownloadError {
    /// Whether another attempt could succeed. Integrity failures never do.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_body()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            Self::HashMismatch { .. } => false,
        }
    }
}

/// Request for a download operation
pub struct DownloadRequest<'a, R: Reporter> {
    pub client: &'a Client,
    pub pkg_name: &'a PackageName,
    pub version: &'a str,
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected: &'a Sha256Digest,
    pub reporter: &'a R,
}

impl<R: Reporter> DownloadRequest<'_, R> {
    /// Download to `dest` and verify. Returns the hex digest.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`]; on `HashMismatch` the destination has
    /// already been removed.
    pub async fn execute(self) -> Result<String, DownloadError> {
        let actual = match local_path(self.url) {
            Some(src) => copy_and_hash(src, self.dest.to_path_buf()).await?,
            None => self.stream_http().await?,
        };

        if !self.expected.matches(&actual) {
            tokio::fs::remove_file(self.dest).await.ok();
            return Err(DownloadError::HashMismatch {
                expected: self.expected.to_string(),
                actual,
            });
        }

        Ok(actual)
    }

    async fn stream_http(&self) -> Result<String, DownloadError> {
        let response = self
            .client
            .get(self.url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }

        let total_size = response.content_length();
        self.reporter
            .downloading(self.pkg_name, self.version, 0, total_size);

        let mut file = File::create(self.dest).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
            self.reporter
                .downloading(self.pkg_name, self.version, downloaded, total_size);
        }

        file.flush().await?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// `file://` URLs and bare paths resolve to a local file.
fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") {
        return None;
    }
    Some(PathBuf::from(url))
}

async fn copy_and_hash(src: PathBuf, dest: PathBuf) -> Result<String, DownloadError> {
    tokio::task::spawn_blocking(move || {
        let mut input = std::fs::File::open(&src)?;
        let mut output = std::fs::File::create(&dest)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let count = input.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
            output.write_all(&buffer[..count])?;
        }
        output.flush()?;
        Ok::<String, std::io::Error>(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
    .map_err(DownloadError::Io)
}

/// SHA256 of a file on disk, computed on a blocking thread.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut hasher = Sha256::new();
        let mut file = std::fs::File::open(&path)?;
        let mut buffer = [0u8; 8192];
        loop {
            let count = file.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
        Ok::<String, std::io::Error>(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}
