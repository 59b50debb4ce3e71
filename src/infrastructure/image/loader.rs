//! Async image loading orchestrator.
//!
//! Implements a three-tier lookup: Memory -> Disk -> Network.

use std::collections::HashMap;
use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::domain::entities::{
    CacheKey, CachedImage, ImageSource, ImageStatus, LoadedImage, TargetSize,
};
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::ImageFetcher;

use super::coordinator::{CoordinatorStats, RequestCoordinator};
use super::disk_cache::DiskImageCache;
use super::downsampler::downsample;
use super::http_fetcher::HttpImageFetcher;
use super::memory_cache::{self, CacheStats, MemoryImageCache};

/// Message sent when an image requested with [`ImageLoader::load_async`]
/// finishes loading.
#[derive(Debug, Clone)]
pub struct ImageLoadedEvent {
    /// The image key.
    pub key: CacheKey,
    /// The loaded image, or why it could not be loaded.
    pub result: Result<LoadedImage, CacheError>,
}

/// Signal that the process should release memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPressure;

/// Configuration for the image loader.
#[derive(Debug, Clone)]
pub struct ImageLoaderConfig {
    /// Maximum images in memory cache.
    pub memory_count_limit: usize,
    /// Maximum summed cost of images in memory cache, in bytes.
    pub memory_cost_limit: u64,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            memory_count_limit: memory_cache::DEFAULT_COUNT_LIMIT,
            memory_cost_limit: memory_cache::DEFAULT_COST_LIMIT,
        }
    }
}

/// Everything a load needs, shared with background tasks.
struct Pipeline {
    memory_cache: Arc<MemoryImageCache>,
    disk_cache: Arc<DiskImageCache>,
    fetcher: Arc<dyn ImageFetcher>,
    coordinator: RequestCoordinator<Arc<DynamicImage>>,
}

/// Orchestrates image loading from memory, disk, and network.
pub struct ImageLoader {
    pipeline: Arc<Pipeline>,
    pending_loads: Arc<Mutex<HashMap<CacheKey, AbortHandle>>>,
    failed_loads: Arc<Mutex<HashMap<CacheKey, String>>>,
    event_tx: mpsc::UnboundedSender<ImageLoadedEvent>,
    config: ImageLoaderConfig,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Creates a new image loader.
    #[must_use]
    pub fn new(
        config: ImageLoaderConfig,
        event_tx: &mpsc::UnboundedSender<ImageLoadedEvent>,
        fetcher: Arc<dyn ImageFetcher>,
        disk_cache: Arc<DiskImageCache>,
    ) -> Self {
        let memory_cache = Arc::new(MemoryImageCache::new(
            config.memory_count_limit,
            config.memory_cost_limit,
        ));

        Self {
            pipeline: Arc::new(Pipeline {
                memory_cache,
                disk_cache,
                fetcher,
                coordinator: RequestCoordinator::new(),
            }),
            pending_loads: Arc::new(Mutex::new(HashMap::new())),
            failed_loads: Arc::new(Mutex::new(HashMap::new())),
            event_tx: event_tx.clone(),
            config,
        }
    }

    /// Creates a loader with default configuration, an HTTP fetcher and the
    /// default disk cache location.
    ///
    /// # Errors
    /// Returns error if disk cache or HTTP client cannot be created.
    pub async fn with_defaults(
        event_tx: &mpsc::UnboundedSender<ImageLoadedEvent>,
    ) -> CacheResult<Self> {
        let disk_cache = Arc::new(DiskImageCache::default_location().await?);
        let fetcher = Arc::new(HttpImageFetcher::with_defaults()?);
        Ok(Self::new(
            ImageLoaderConfig::default(),
            event_tx,
            fetcher,
            disk_cache,
        ))
    }

    /// Loads an image, checking caches first.
    ///
    /// A network result is written to both cache tiers before this returns.
    ///
    /// # Errors
    /// Returns error if the image cannot be fetched or decoded.
    pub async fn load(&self, url: &str, target: TargetSize) -> CacheResult<LoadedImage> {
        self.pipeline.load(url, target).await
    }

    /// Starts loading an image in the background.
    ///
    /// The result is sent on the event channel. A request for a key that is
    /// already pending is ignored.
    pub fn load_async(&self, url: String, target: TargetSize) {
        let key = CacheKey::from_url(&url);
        let mut pending = self.pending_loads.lock();
        if pending.contains_key(&key) {
            trace!(key = %key, "Load already pending");
            return;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let pending_loads = Arc::clone(&self.pending_loads);
        let failed_loads = Arc::clone(&self.failed_loads);
        let event_tx = self.event_tx.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let result = pipeline.load(&url, target).await;
            {
                // A cancelled-then-reissued key belongs to a newer task.
                let mut pending = pending_loads.lock();
                if pending
                    .get(&task_key)
                    .is_some_and(|handle| handle.id() == tokio::task::id())
                {
                    pending.remove(&task_key);
                }
            }

            match &result {
                Ok(_) => {
                    failed_loads.lock().remove(&task_key);
                }
                Err(e) => {
                    failed_loads.lock().insert(task_key.clone(), e.to_string());
                }
            }

            if event_tx
                .send(ImageLoadedEvent {
                    key: task_key,
                    result,
                })
                .is_err()
            {
                trace!("Image event receiver dropped");
            }
        });

        pending.insert(key, task.abort_handle());
    }

    /// Prefetches multiple images into cache.
    pub fn prefetch_batch(&self, images: Vec<(String, TargetSize)>) {
        for (url, target) in images {
            self.load_async(url, target);
        }
    }

    /// Cancels a pending background load.
    ///
    /// The underlying fetch keeps running while other callers await it.
    pub fn cancel(&self, key: &CacheKey) {
        if let Some(handle) = self.pending_loads.lock().remove(key) {
            handle.abort();
            debug!(key = %key, "Cancelled image load");
        }
    }

    /// Cancels all pending background loads.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.pending_loads.lock().drain().collect();
        let count = drained.len();
        for (_, handle) in drained {
            handle.abort();
        }
        if count > 0 {
            debug!(count, "Cancelled all pending image loads");
        }
    }

    /// Returns true if a background load for the key is pending.
    #[must_use]
    pub fn is_loading(&self, key: &CacheKey) -> bool {
        self.pending_loads.lock().contains_key(key)
    }

    /// Returns the number of pending background loads.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_loads.lock().len()
    }

    /// Reports where `key` stands in the pipeline.
    ///
    /// A memory-resident image is `Ready`; a background load or shared fetch
    /// in progress is `Loading`; the last background load's error is kept
    /// as `Failed` until the key loads successfully.
    #[must_use]
    pub fn status(&self, key: &CacheKey) -> ImageStatus {
        if self.pipeline.memory_cache.contains(key) {
            return ImageStatus::Ready;
        }
        if self.is_loading(key) || self.pipeline.coordinator.is_in_flight(key) {
            return ImageStatus::Loading;
        }
        self.failed_loads
            .lock()
            .get(key)
            .map_or(ImageStatus::NotStarted, |error| {
                ImageStatus::Failed(error.clone())
            })
    }

    /// Peeks at the memory cache without affecting recency or statistics.
    #[must_use]
    pub fn check_memory_cache(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        self.pipeline
            .memory_cache
            .peek(key)
            .map(|cached| Arc::clone(cached.image()))
    }

    /// Spawns a task that empties the memory cache whenever a
    /// [`MemoryPressure`] signal arrives. The task ends when the channel
    /// closes.
    pub fn watch_memory_pressure(
        &self,
        mut signals: mpsc::Receiver<MemoryPressure>,
    ) -> JoinHandle<()> {
        let memory_cache = Arc::clone(&self.pipeline.memory_cache);
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                let released = memory_cache.total_cost();
                memory_cache.clear();
                info!(released_bytes = released, "Memory pressure, cleared image cache");
            }
        })
    }

    /// Returns memory cache statistics.
    #[must_use]
    pub fn memory_cache_stats(&self) -> CacheStats {
        self.pipeline.memory_cache.stats()
    }

    /// Returns request coalescing statistics.
    #[must_use]
    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.pipeline.coordinator.stats()
    }

    /// Returns the disk tier.
    #[must_use]
    pub fn disk_cache(&self) -> &Arc<DiskImageCache> {
        &self.pipeline.disk_cache
    }

    /// Clears all caches.
    pub async fn clear_all(&self) {
        self.pipeline.memory_cache.clear();
        self.failed_loads.lock().clear();
        if let Err(e) = self.pipeline.disk_cache.clear_cache().await {
            warn!(error = %e, "Failed to clear disk cache");
        }
        info!("Cleared all image caches");
    }
}

impl Pipeline {
    async fn load(&self, url: &str, target: TargetSize) -> CacheResult<LoadedImage> {
        let key = CacheKey::from_url(url);

        if let Some(cached) = self.memory_cache.get(&key) {
            return Ok(LoadedImage {
                key,
                image: Arc::clone(cached.image()),
                source: ImageSource::MemoryCache,
            });
        }

        if let Some(bytes) = self.disk_cache.get_bytes(&key).await {
            match decode(bytes, target).await {
                Ok(image) => {
                    let image = Arc::new(image);
                    self.memory_cache
                        .put(key.clone(), CachedImage::new(Arc::clone(&image)));
                    debug!(key = %key, source = %ImageSource::DiskCache, "Image loaded");
                    return Ok(LoadedImage {
                        key,
                        image,
                        source: ImageSource::DiskCache,
                    });
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring undecodable disk cache entry");
                }
            }
        }

        let image = self
            .coordinator
            .run(&key, || {
                fetch_and_store(
                    Arc::clone(&self.fetcher),
                    Arc::clone(&self.memory_cache),
                    Arc::clone(&self.disk_cache),
                    key.clone(),
                    url.trim().to_string(),
                    target,
                )
            })
            .await?;

        Ok(LoadedImage {
            key,
            image,
            source: ImageSource::Network,
        })
    }
}

/// Fetches, downsamples and writes through to both tiers.
///
/// Runs once per flight, so coalesced callers never repeat the writes.
async fn fetch_and_store(
    fetcher: Arc<dyn ImageFetcher>,
    memory_cache: Arc<MemoryImageCache>,
    disk_cache: Arc<DiskImageCache>,
    key: CacheKey,
    url: String,
    target: TargetSize,
) -> CacheResult<Arc<DynamicImage>> {
    // A flight that finished while this caller was reading the disk tier
    // has already filled memory.
    if let Some(cached) = memory_cache.peek(&key) {
        trace!(key = %key, "Image stored by an earlier fetch, skipping download");
        return Ok(Arc::clone(cached.image()));
    }

    let bytes = fetcher.fetch(&url).await?;
    let image = Arc::new(decode(bytes, target).await?);

    memory_cache.put(key.clone(), CachedImage::new(Arc::clone(&image)));
    if let Err(e) = disk_cache.put(&key, Arc::clone(&image)).await {
        warn!(key = %key, error = %e, "Failed to cache to disk");
    }

    debug!(
        key = %key,
        source = %ImageSource::Network,
        width = image.width(),
        height = image.height(),
        "Image loaded"
    );
    Ok(image)
}

async fn decode<B>(bytes: B, target: TargetSize) -> CacheResult<DynamicImage>
where
    B: AsRef<[u8]> + Send + 'static,
{
    tokio::task::spawn_blocking(move || downsample(bytes.as_ref(), target))
        .await
        .map_err(|e| CacheError::decode(format!("Decode task panicked: {e}")))?
}
