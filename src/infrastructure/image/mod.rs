//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction bounded by count and cost
//! - Disk caching for persistence
//! - Decode-time downsampling
//! - Request coalescing so each key is fetched at most once at a time
//! - Async image loading pipeline

pub mod coordinator;
pub mod disk_cache;
pub mod downsampler;
pub mod http_fetcher;
pub mod loader;
pub mod memory_cache;

pub use coordinator::{CoordinatorStats, RequestCoordinator};
pub use disk_cache::{DiskImageCache, default_cache_dir, quality_for};
pub use downsampler::downsample;
pub use http_fetcher::HttpImageFetcher;
pub use loader::{ImageLoadedEvent, ImageLoader, ImageLoaderConfig, MemoryPressure};
pub use memory_cache::{CacheStats, MemoryImageCache};
