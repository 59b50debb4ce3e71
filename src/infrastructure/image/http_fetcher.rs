//! HTTP adapter for the image fetcher port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::ImageFetcher;

/// Default number of simultaneous requests allowed per host.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 4;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches images over HTTP GET.
///
/// No HTTP caching layer is involved; the image caches are the only cache.
pub struct HttpImageFetcher {
    client: reqwest::Client,
    max_connections_per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpImageFetcher {
    /// Creates a fetcher.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        timeout: Duration,
        max_connections_per_host: usize,
        user_agent: &str,
    ) -> CacheResult<Self> {
        let max_connections_per_host = max_connections_per_host.max(1);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .pool_max_idle_per_host(max_connections_per_host)
            .build()
            .map_err(|e| CacheError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_connections_per_host,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a fetcher with default limits.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> CacheResult<Self> {
        Self::new(
            DEFAULT_TIMEOUT,
            DEFAULT_MAX_CONNECTIONS_PER_HOST,
            &default_user_agent(),
        )
    }

    fn host_permits(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        Arc::clone(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections_per_host))),
        )
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> CacheResult<Bytes> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| CacheError::network(format!("Invalid URL {url}: {e}")))?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let permits = self.host_permits(&host);
        let _permit = permits
            .acquire()
            .await
            .map_err(|e| CacheError::network(format!("Connection limiter closed: {e}")))?;

        debug!(url = %parsed, host = %host, "Downloading image from network");

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| CacheError::network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CacheError::network(format!(
                "HTTP {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::network(format!("Failed to read body: {e}")))?;

        trace!(host = %host, size = bytes.len(), "Download complete");
        Ok(bytes)
    }
}

impl std::fmt::Debug for HttpImageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpImageFetcher")
            .field("max_connections_per_host", &self.max_connections_per_host)
            .finish_non_exhaustive()
    }
}

/// User agent sent with every request.
#[must_use]
pub fn default_user_agent() -> String {
    format!("{}/{}", crate::NAME, crate::VERSION)
}
