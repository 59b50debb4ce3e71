//! Infrastructure layer with cache, network and configuration adapters.

/// Application configuration.
pub mod config;
/// Image handling (caching, loading, coalescing, downsampling).
pub mod image;

pub use config::{AppConfig, CliArgs, Command, ConfigOrigin, ConfigStore, LogLevel};
pub use image::{
    CacheStats, CoordinatorStats, DiskImageCache, HttpImageFetcher, ImageLoadedEvent, ImageLoader,
    ImageLoaderConfig, MemoryImageCache, MemoryPressure, RequestCoordinator,
};
