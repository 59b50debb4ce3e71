//! In-memory LRU image cache bounded by entry count and estimated byte cost.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, CachedImage};

/// Default maximum number of images to cache in memory.
pub const DEFAULT_COUNT_LIMIT: usize = 100;

/// Default ceiling on the summed cost of cached images (128 MiB).
pub const DEFAULT_COST_LIMIT: u64 = 128 * 1024 * 1024;

struct Inner {
    entries: LruCache<CacheKey, CachedImage>,
    total_cost: u64,
}

/// In-memory LRU cache for decoded images.
///
/// Lookups never suspend: the store sits behind a short-lived synchronous lock.
pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    cost_limit: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a new cache with the given count and cost limits.
    #[must_use]
    pub fn new(count_limit: usize, cost_limit: u64) -> Self {
        let cap = NonZeroUsize::new(count_limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                total_cost: 0,
            }),
            cost_limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up an image, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let mut inner = self.inner.lock();
        if let Some(image) = inner.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at an image without promoting it in the LRU.
    pub fn peek(&self, key: &CacheKey) -> Option<CachedImage> {
        self.inner.lock().entries.peek(key).cloned()
    }

    /// Returns true if the key is cached, without touching recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Stores an image, evicting least recently used entries until both
    /// limits hold again.
    ///
    /// An image costlier than the whole ceiling is not stored.
    pub fn put(&self, key: CacheKey, image: CachedImage) {
        let cost = image.cost();
        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.pop(&key) {
            inner.total_cost = inner.total_cost.saturating_sub(old.cost());
        }

        if cost > self.cost_limit {
            debug!(key = %key, cost, limit = self.cost_limit, "Image exceeds memory cost limit, not cached");
            return;
        }

        while inner.total_cost + cost > self.cost_limit {
            match inner.entries.pop_lru() {
                Some((evicted, old)) => {
                    inner.total_cost = inner.total_cost.saturating_sub(old.cost());
                    trace!(key = %evicted, "Evicted image to respect cost limit");
                }
                None => break,
            }
        }

        if let Some((evicted, old)) = inner.entries.push(key.clone(), image) {
            inner.total_cost = inner.total_cost.saturating_sub(old.cost());
            trace!(key = %evicted, "Evicted image to respect count limit");
        }
        inner.total_cost += cost;

        debug!(key = %key, cost, total_cost = inner.total_cost, "Stored image in memory cache");
    }

    /// Removes an image from the cache.
    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(key) {
            inner.total_cost = inner.total_cost.saturating_sub(old.cost());
            debug!(key = %key, "Removed image from memory cache");
        }
    }

    /// Drops every entry. Called when the process is under memory pressure.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.total_cost = 0;
        debug!(count, "Cleared memory image cache");
    }

    /// Returns the number of cached images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the summed cost of cached images.
    #[must_use]
    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.entries.len(),
            total_cost: inner.total_cost,
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT_LIMIT, DEFAULT_COST_LIMIT)
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImageCache")
            .field("cost_limit", &self.cost_limit)
            .finish_non_exhaustive()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Summed estimated cost in bytes.
    pub total_cost: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn image(width: u32, height: u32) -> CachedImage {
        CachedImage::new(DynamicImage::new_rgb8(width, height))
    }

    #[test]
    fn test_cache_put_and_get() {
        let cache = MemoryImageCache::default();
        let key = CacheKey::from_url("https://example.com/1.png");

        cache.put(key.clone(), image(100, 100));
        let retrieved = cache.get(&key).expect("image should be cached");

        assert_eq!(retrieved.image().width(), 100);
        assert_eq!(cache.total_cost(), 100 * 100 * 4);
    }

    #[test]
    fn test_cache_miss() {
        let cache = MemoryImageCache::default();
        assert!(cache.get(&CacheKey::from_url("missing")).is_none());
    }

    #[test]
    fn test_count_limit_evicts_lru() {
        let cache = MemoryImageCache::new(2, DEFAULT_COST_LIMIT);
        let k1 = CacheKey::from_url("k1");
        let k2 = CacheKey::from_url("k2");
        let k3 = CacheKey::from_url("k3");

        cache.put(k1.clone(), image(10, 10));
        cache.put(k2.clone(), image(10, 10));
        cache.put(k3.clone(), image(10, 10));

        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
        assert_eq!(cache.total_cost(), 2 * 10 * 10 * 4);
    }

    #[test]
    fn test_cost_limit_evicts_lru() {
        // Room for exactly two 10x10 images.
        let cache = MemoryImageCache::new(10, 2 * 400);
        let k1 = CacheKey::from_url("k1");
        let k2 = CacheKey::from_url("k2");
        let k3 = CacheKey::from_url("k3");

        cache.put(k1.clone(), image(10, 10));
        cache.put(k2.clone(), image(10, 10));
        // Touch k1 so k2 becomes least recently used.
        assert!(cache.get(&k1).is_some());
        cache.put(k3.clone(), image(10, 10));

        assert!(cache.contains(&k1));
        assert!(!cache.contains(&k2));
        assert!(cache.contains(&k3));
        assert_eq!(cache.total_cost(), 800);
    }

    #[test]
    fn test_oversized_image_not_stored() {
        let cache = MemoryImageCache::new(10, 100);
        let key = CacheKey::from_url("huge");
        cache.put(key.clone(), image(10, 10));
        assert!(!cache.contains(&key));
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_overwrite_replaces_cost() {
        let cache = MemoryImageCache::default();
        let key = CacheKey::from_url("k");
        cache.put(key.clone(), image(10, 10));
        cache.put(key.clone(), image(20, 10));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 20 * 10 * 4);
    }

    #[test]
    fn test_clear_and_remove() {
        let cache = MemoryImageCache::default();
        cache.put(CacheKey::from_url("a"), image(5, 5));
        cache.put(CacheKey::from_url("b"), image(5, 5));

        cache.remove(&CacheKey::from_url("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_cache_stats() {
        let cache = MemoryImageCache::default();
        let key = CacheKey::from_url("k");
        cache.put(key.clone(), image(10, 10));

        let _ = cache.get(&key);
        let _ = cache.get(&CacheKey::from_url("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_peek_does_not_promote() {
        let cache = MemoryImageCache::new(2, DEFAULT_COST_LIMIT);
        let k1 = CacheKey::from_url("k1");
        let k2 = CacheKey::from_url("k2");

        cache.put(k1.clone(), image(10, 10));
        cache.put(k2.clone(), image(10, 10));
        let _ = cache.peek(&k1);
        cache.put(CacheKey::from_url("k3"), image(10, 10));

        assert!(cache.peek(&k1).is_none());
    }
}
