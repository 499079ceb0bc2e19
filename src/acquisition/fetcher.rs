use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::roster::{FetchKey, ImageFormat};

/// Why a single download failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchError {
    #[error("not found (404)")]
    NotFound,

    #[error("forbidden (403)")]
    Forbidden,

    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    #[serde(rename = "NETWORK_ERROR")]
    Network(String),

    #[error("write error: {0}")]
    #[serde(rename = "WRITE_ERROR")]
    Write(String),
}

impl FetchError {
    /// Stable reason code used in reports
    pub fn reason_code(&self) -> &'static str {
        match self {
            FetchError::NotFound => "NOT_FOUND",
            FetchError::Forbidden => "FORBIDDEN",
            FetchError::Timeout => "TIMEOUT",
            FetchError::Network(_) => "NETWORK_ERROR",
            FetchError::Write(_) => "WRITE_ERROR",
        }
    }
}

/// Downloads one portrait by fetch key
///
/// Implementations make at most one network attempt per call and never
/// leave a file at `destination` when they return an error.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, key: FetchKey, destination: &Path, timeout: Duration)
        -> Result<u64, FetchError>;

    /// Where `key` would be fetched from, if anywhere
    fn url_for(&self, key: FetchKey) -> Option<String>;
}

/// Plain HTTP(S) GET against `{base_url}/{key}.{ext}`
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
    extension: &'static str,
}

impl HttpFetcher {
    pub fn new(base_url: &str, format: ImageFormat) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("badge-processor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            extension: format.extension(),
        })
    }

    pub fn url(&self, key: FetchKey) -> String {
        format!("{}/{}.{}", self.base_url, key, self.extension)
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(
        &self,
        key: FetchKey,
        destination: &Path,
        timeout: Duration,
    ) -> Result<u64, FetchError> {
        let url = self.url(key);
        debug!(%url, destination = %destination.display(), "fetching portrait");

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if status == StatusCode::FORBIDDEN {
            return Err(FetchError::Forbidden);
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP {}", status.as_u16())));
        }

        // Read the whole body before touching the disk so transport errors
        // and write errors stay distinguishable.
        let body = response.bytes().map_err(classify_transport_error)?;
        write_atomically(destination, &body)?;

        Ok(body.len() as u64)
    }

    fn url_for(&self, key: FetchKey) -> Option<String> {
        Some(self.url(key))
    }
}

/// Fetcher used when no remote source is configured
pub struct OfflineFetcher;

impl ImageFetcher for OfflineFetcher {
    fn fetch(&self, _key: FetchKey, _destination: &Path, _timeout: Duration) -> Result<u64, FetchError> {
        Err(FetchError::Network("no remote source configured".to_string()))
    }

    fn url_for(&self, _key: FetchKey) -> Option<String> {
        None
    }
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Write through a `.part` sibling and rename into place
pub(crate) fn write_atomically(destination: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FetchError::Write(e.to_string()))?;
    }

    let partial = partial_path(destination);
    let written = std::fs::write(&partial, bytes)
        .and_then(|_| std::fs::rename(&partial, destination));

    if let Err(e) = written {
        let _ = std::fs::remove_file(&partial);
        let _ = std::fs::remove_file(destination);
        return Err(FetchError::Write(e.to_string()));
    }

    Ok(())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
