//! Disk-based image cache for persistence across sessions.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, error, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{CacheError, CacheResult};

/// JPEG quality for ordinary images.
pub const DEFAULT_QUALITY: u8 = 80;
/// JPEG quality for tall images (height at least twice the width).
pub const TALL_QUALITY: u8 = 65;
/// JPEG quality for extreme aspect ratios (height at least three times the width).
pub const EXTREME_QUALITY: u8 = 50;

/// Disk-based image cache that persists re-encoded image bytes.
///
/// Entries are only removed explicitly; there is no expiry or size cap.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    usage: Arc<Usage>,
}

/// Byte and entry totals for the cache directory.
///
/// Every change to the directory and the matching counter update happen
/// under `update`, so concurrent writers cannot both count the same entry.
/// Readers load the atomics without taking the lock.
struct Usage {
    update: Mutex<()>,
    bytes: AtomicU64,
    items: AtomicUsize,
}

impl Usage {
    fn new(bytes: u64, items: usize) -> Self {
        Self {
            update: Mutex::new(()),
            bytes: AtomicU64::new(bytes),
            items: AtomicUsize::new(items),
        }
    }

    /// Records an entry written with `new_size` bytes over one of `previous`
    /// bytes, if any. Caller holds `update`.
    fn replaced(&self, previous: Option<u64>, new_size: u64) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        match previous {
            Some(old) => {
                self.bytes
                    .store(bytes.saturating_sub(old).saturating_add(new_size), Ordering::Relaxed);
            }
            None => {
                self.bytes.store(bytes.saturating_add(new_size), Ordering::Relaxed);
                self.items.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records an entry of `size` bytes leaving. Caller holds `update`.
    fn released(&self, size: u64) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        self.bytes.store(bytes.saturating_sub(size), Ordering::Relaxed);
        let items = self.items.load(Ordering::Relaxed);
        self.items.store(items.saturating_sub(1), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.items.store(0, Ordering::Relaxed);
    }
}

impl DiskImageCache {
    /// Creates a new disk cache in the specified directory.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created or read.
    pub async fn new(cache_dir: PathBuf) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::io(format!("Failed to create cache dir: {e}")))?;

        let mut total_size = 0u64;
        let mut count = 0usize;

        let mut entries = fs::read_dir(&cache_dir)
            .await
            .map_err(|e| CacheError::io(format!("Failed to read cache dir: {e}")))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            if is_cache_file(&entry.path())
                && let Ok(meta) = entry.metadata().await
            {
                total_size += meta.len();
                count += 1;
            }
        }

        debug!(dir = %cache_dir.display(), count, total_size, "Opened disk image cache");

        Ok(Self {
            cache_dir,
            usage: Arc::new(Usage::new(total_size, count)),
        })
    }

    /// Creates a cache in the default per-user cache location.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn default_location() -> CacheResult<Self> {
        Self::new(default_cache_dir()).await
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path for a cached image.
    fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Gets raw image bytes from disk cache.
    pub async fn get_bytes(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.cache_path(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                Some(bytes)
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to read disk cache entry");
                }
                trace!(key = %key, "Disk cache miss");
                None
            }
        }
    }

    /// Loads and decodes an image from disk cache.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let bytes = self.get_bytes(key).await?;

        let result = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await;

        match result {
            Ok(Ok(img)) => {
                debug!(key = %key, "Decoded image from disk cache");
                Some(Arc::new(img))
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to decode cached image");
                None
            }
            Err(e) => {
                error!(key = %key, error = %e, "Decode task panicked");
                None
            }
        }
    }

    /// Re-encodes an image and stores it atomically.
    ///
    /// # Errors
    /// Returns error if encoding fails or the file cannot be written.
    pub async fn put(&self, key: &CacheKey, image: Arc<DynamicImage>) -> CacheResult<()> {
        let bytes = tokio::task::spawn_blocking(move || encode(&image))
            .await
            .map_err(|e| CacheError::io(format!("Encode task panicked: {e}")))??;
        self.put_bytes(key, &bytes).await
    }

    /// Stores raw bytes atomically: written to a temporary file in the cache
    /// directory, then renamed over the entry.
    ///
    /// # Errors
    /// Returns error if file cannot be created or written.
    pub async fn put_bytes(&self, key: &CacheKey, bytes: &[u8]) -> CacheResult<()> {
        let path = self.cache_path(key);

        let dir = self.cache_dir.clone();
        let target = path.clone();
        let data = bytes.to_vec();
        let usage = Arc::clone(&self.usage);
        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &data, &usage))
            .await
            .map_err(|e| CacheError::io(format!("Write task panicked: {e}")))??;

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");
        Ok(())
    }

    /// Removes an image from disk cache.
    pub async fn remove(&self, key: &CacheKey) {
        let path = self.cache_path(key);
        let usage = Arc::clone(&self.usage);
        let result = tokio::task::spawn_blocking(move || {
            let _update = usage.update.lock();
            let size = std::fs::metadata(&path).map(|m| m.len())?;
            std::fs::remove_file(&path)?;
            usage.released(size);
            Ok::<_, std::io::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => debug!(key = %key, "Removed from disk cache"),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to remove from disk cache"),
            Err(e) => error!(key = %key, error = %e, "Remove task panicked"),
        }
    }

    /// Deletes the cache directory and recreates it empty.
    ///
    /// # Errors
    /// Returns error if the directory cannot be removed or recreated.
    pub async fn clear_cache(&self) -> CacheResult<()> {
        let dir = self.cache_dir.clone();
        let usage = Arc::clone(&self.usage);
        tokio::task::spawn_blocking(move || {
            let _update = usage.update.lock();
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(format!("Failed to remove cache dir: {e}"))),
            }
            std::fs::create_dir_all(&dir)
                .map_err(|e| CacheError::io(format!("Failed to recreate cache dir: {e}")))?;
            usage.reset();
            Ok(())
        })
        .await
        .map_err(|e| CacheError::io(format!("Clear task panicked: {e}")))??;

        debug!(dir = %self.cache_dir.display(), "Cleared disk cache");
        Ok(())
    }

    /// Returns the current cache size in bytes.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.usage.bytes.load(Ordering::Relaxed)
    }

    /// Returns the number of cached files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.usage.items.load(Ordering::Relaxed)
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if an image is cached.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.cache_path(key)).await.unwrap_or(false)
    }
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("cache_dir", &self.cache_dir)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Picks a JPEG quality for an image of the given size.
///
/// Tall images compress harder to keep long screenshots and strips small.
#[must_use]
pub fn quality_for(width: u32, height: u32) -> u8 {
    let width = u64::from(width.max(1));
    let height = u64::from(height);
    if height >= width * 3 {
        EXTREME_QUALITY
    } else if height >= width * 2 {
        TALL_QUALITY
    } else {
        DEFAULT_QUALITY
    }
}

fn encode(image: &DynamicImage) -> CacheResult<Vec<u8>> {
    let quality = quality_for(image.width(), image.height());
    let rgb = image.to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .map_err(|e| CacheError::io(format!("Failed to encode image: {e}")))?;
    Ok(buf.into_inner())
}

fn write_atomic(dir: &Path, path: &Path, data: &[u8], usage: &Usage) -> CacheResult<()> {
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CacheError::io(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(data)
        .map_err(|e| CacheError::io(format!("Failed to write cache file: {e}")))?;

    let _update = usage.update.lock();
    let previous = std::fs::metadata(path).map(|m| m.len()).ok();
    temp_file
        .persist(path)
        .map_err(|e| CacheError::io(format!("Failed to persist cache file: {}", e.error)))?;
    usage.replaced(previous, data.len() as u64);
    Ok(())
}

fn is_cache_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == CacheKey::FILE_EXTENSION)
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from(crate::APP_QUALIFIER, crate::APP_ORGANIZATION, crate::NAME)
        .map_or_else(
            || std::env::temp_dir().join(crate::NAME).join("images"),
            |dirs| dirs.cache_dir().join("images"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    async fn create_test_cache() -> (DiskImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::new(temp_dir.path().join("images"))
            .await
            .unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get_bytes() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("https://example.com/1.png");

        cache.put_bytes(&key, b"test image data").await.unwrap();

        assert_eq!(cache.get_bytes(&key).await.unwrap(), b"test image data");
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("nonexistent");

        assert!(cache.get_bytes(&key).await.is_none());
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_put_reencodes_and_decodes() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("https://example.com/photo.png");
        let image = Arc::new(DynamicImage::new_rgba8(64, 48));

        cache.put(&key, image).await.unwrap();

        let bytes = cache.get_bytes(&key).await.unwrap();
        assert_eq!(
            image::guess_format(&bytes).unwrap(),
            image::ImageFormat::Jpeg
        );
        let decoded = cache.get(&key).await.unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_absent() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("corrupt");

        cache.put_bytes(&key, b"not an image").await.unwrap();

        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (cache, _temp) = create_test_cache().await;
        cache
            .put_bytes(&CacheKey::from_url("a"), b"data")
            .await
            .unwrap();

        let mut entries = fs::read_dir(cache.dir()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.path());
        }
        assert_eq!(names.len(), 1);
        assert!(is_cache_file(&names[0]));
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("a");

        cache.put_bytes(&key, b"test").await.unwrap();
        assert!(cache.contains(&key).await);

        cache.remove(&key).await;
        assert!(!cache.contains(&key).await);
    }

    #[tokio::test]
    async fn test_clear_cache_recreates_directory() {
        let (cache, _temp) = create_test_cache().await;

        cache
            .put_bytes(&CacheKey::from_url("a"), b"data1")
            .await
            .unwrap();
        cache
            .put_bytes(&CacheKey::from_url("b"), b"data2")
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear_cache().await.unwrap();

        assert_eq!(cache.len(), 0);
        assert!(cache.dir().is_dir());
        assert!(!cache.contains(&CacheKey::from_url("a")).await);
    }

    #[tokio::test]
    async fn test_counters_track_overwrites() {
        let (cache, _temp) = create_test_cache().await;

        cache
            .put_bytes(&CacheKey::from_url("a"), b"hello")
            .await
            .unwrap();
        cache
            .put_bytes(&CacheKey::from_url("b"), b"world!")
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.current_size(), 11);

        cache
            .put_bytes(&CacheKey::from_url("a"), b"hey")
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.current_size(), 9);

        cache.remove(&CacheKey::from_url("b")).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_writes_of_new_key_count_once() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("https://example.com/shared.png");

        let writes = (0..16).map(|_| cache.put_bytes(&key, b"same-bytes"));
        for result in futures_util::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 10);
    }

    #[tokio::test]
    async fn test_remove_racing_clear_never_underflows() {
        let (cache, _temp) = create_test_cache().await;
        let key = CacheKey::from_url("a");
        cache.put_bytes(&key, b"hello").await.unwrap();

        let (cleared, ()) = tokio::join!(cache.clear_cache(), cache.remove(&key));
        cleared.unwrap();
        cache.remove(&key).await;

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.current_size(), 0);
    }

    #[tokio::test]
    async fn test_reopen_counts_existing_entries() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("images");
        {
            let cache = DiskImageCache::new(dir.clone()).await.unwrap();
            cache
                .put_bytes(&CacheKey::from_url("a"), b"12345")
                .await
                .unwrap();
        }

        let reopened = DiskImageCache::new(dir).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.current_size(), 5);
        assert!(
            reopened
                .get_bytes(&CacheKey::from_url("a"))
                .await
                .is_some()
        );
    }

    #[test_case(100, 100, DEFAULT_QUALITY ; "square")]
    #[test_case(400, 100, DEFAULT_QUALITY ; "wide")]
    #[test_case(100, 199, DEFAULT_QUALITY ; "just_under_tall")]
    #[test_case(100, 200, TALL_QUALITY ; "tall")]
    #[test_case(100, 300, EXTREME_QUALITY ; "extreme")]
    #[test_case(0, 10, EXTREME_QUALITY ; "zero_width")]
    fn test_quality_for(width: u32, height: u32, expected: u8) {
        assert_eq!(quality_for(width, height), expected);
    }
}
