//! Image pipeline error types.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while loading or caching an image.
///
/// Clonable so a single fetch outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Transport failure or non-success HTTP status.
    #[error("network error: {0}")]
    Network(String),
    /// Bytes could not be interpreted as an image.
    #[error("decode error: {0}")]
    Decode(String),
    /// I/O failure in the disk tier.
    #[error("io error: {0}")]
    Io(String),
    /// A valid image could not be decoded within the memory budget.
    #[error("resource limit: {0}")]
    ResourceLimit(String),
    /// The shared fetch was abandoned before it produced a result.
    #[error("image load cancelled")]
    Cancelled,
}

impl CacheError {
    /// Creates network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Creates io error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Creates resource limit error.
    #[must_use]
    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::ResourceLimit(message.into())
    }

    /// Returns true if issuing the same request again may succeed.
    ///
    /// Undecodable bytes stay undecodable; everything else is transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<image::ImageError> for CacheError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(e) => Self::Io(e.to_string()),
            image::ImageError::Limits(e) => Self::ResourceLimit(e.to_string()),
            other => Self::Decode(other.to_string()),
        }
    }
}
