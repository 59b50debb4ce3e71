//! Port definition for fetching encoded image bytes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::errors::CacheResult;

/// Port for retrieving raw image bytes from their source.
/// Implementations must be thread-safe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetches the encoded bytes behind `url`.
    async fn fetch(&self, url: &str) -> CacheResult<Bytes>;
}
