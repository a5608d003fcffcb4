//! Shared HTTP session and photo downloads
//!
//! One `reqwest::Client` is created at startup and reused by the VK client and
//! the photo downloader, so TCP/TLS connections are pooled across requests.

use crate::config::{DOWNLOAD_MAX_ATTEMPTS, DOWNLOAD_RETRY_DELAY_MS};
use reqwest::{Client as HttpClient, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Errors that can occur while downloading a file
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection, timeout or body transfer failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Server answered with a non-success status
    #[error("Unexpected HTTP status: {0}")]
    Status(StatusCode),
}

impl DownloadError {
    /// Whether another attempt may succeed.
    ///
    /// Only transport failures are retried; an error status is final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Status(_) => false,
        }
    }
}

/// Creates the shared HTTP client with the given request timeout.
#[must_use]
pub fn create_http_client(timeout: Duration) -> HttpClient {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Downloads remote files over the shared HTTP session.
#[derive(Clone)]
pub struct Downloader {
    client: HttpClient,
    retry_delay: Duration,
}

impl Downloader {
    /// Creates a downloader on top of an existing client.
    #[must_use]
    pub const fn new(client: HttpClient) -> Self {
        Self {
            client,
            retry_delay: Duration::from_millis(DOWNLOAD_RETRY_DELAY_MS),
        }
    }

    /// Overrides the pause between attempts.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Downloads `url` into memory.
    ///
    /// Transport failures are retried up to `DOWNLOAD_MAX_ATTEMPTS` times in
    /// total, with a fixed pause between attempts.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Status` for non-success responses, or the last
    /// `DownloadError::Request` once all attempts failed.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let strategy = FixedInterval::new(self.retry_delay).take(DOWNLOAD_MAX_ATTEMPTS - 1);

        RetryIf::spawn(strategy, || self.fetch(url), |e: &DownloadError| {
            let retry = e.is_transient();
            if retry {
                warn!("Download attempt failed, retrying: {e}");
            }
            retry
        })
        .await
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }
        let bytes = response.bytes().await?;
        debug!(size = bytes.len(), "Downloaded file");
        Ok(bytes.to_vec())
    }
}
