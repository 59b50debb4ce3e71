//! Imagecache - a two-tier image cache with request coalescing.
//!
//! Images are served from an in-memory LRU, then a disk cache, then the
//! network. Concurrent requests for the same URL share one download, and
//! every decode is downsampled to the size it will be displayed at.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing cache and network adapters.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "imagecache";

/// Qualifier used to resolve per-user directories.
pub const APP_QUALIFIER: &str = "com";

/// Organization used to resolve per-user directories.
pub const APP_ORGANIZATION: &str = "imagecache";
