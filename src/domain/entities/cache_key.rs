//! Cache key value object.

use std::fmt;

/// Deterministic key identifying a cacheable image.
///
/// The key is the trimmed source URL, shared by the memory and disk tiers.
/// Disk file names are derived from a hash of the key so they are always
/// valid on every filesystem and never depend on the URL's characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Extension used for files in the disk tier.
    pub const FILE_EXTENSION: &'static str = "img";

    /// Creates a key from a source URL.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        Self(url.trim().to_string())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the file name used for this key in the disk tier.
    #[must_use]
    pub fn file_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        format!("{}.{}", hex::encode(&digest[..16]), Self::FILE_EXTENSION)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(url: &str) -> Self {
        Self::from_url(url)
    }
}

impl From<String> for CacheKey {
    fn from(url: String) -> Self {
        Self::from_url(&url)
    }
}
