//! Domain layer with core cache entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, CachedImage, ImageSource, ImageStatus, LoadedImage, TargetSize};
pub use errors::{CacheError, CacheResult};
pub use ports::ImageFetcher;
