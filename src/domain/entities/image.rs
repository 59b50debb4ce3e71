//! Domain types for image handling.

use std::sync::Arc;

use image::DynamicImage;

use super::CacheKey;

/// Estimated bytes per decoded pixel (RGBA).
pub const BYTES_PER_PIXEL: u64 = 4;

/// Display size of an image in points, with the screen scale factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSize {
    /// Width in points.
    pub width: f32,
    /// Height in points.
    pub height: f32,
    /// Pixels per point.
    pub scale: f32,
}

impl TargetSize {
    /// Creates a new target size.
    #[must_use]
    pub const fn new(width: f32, height: f32, scale: f32) -> Self {
        Self {
            width,
            height,
            scale,
        }
    }

    /// Largest pixel dimension an image needs to fill this target.
    ///
    /// Never smaller than one pixel, even for degenerate inputs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn max_pixel_dimension(&self) -> u32 {
        let points = self.width.max(self.height);
        let pixels = (points * self.scale).ceil();
        if pixels.is_finite() && pixels >= 1.0 {
            pixels.min(u32::MAX as f32) as u32
        } else {
            1
        }
    }
}

impl Default for TargetSize {
    fn default() -> Self {
        Self::new(400.0, 300.0, 2.0)
    }
}

/// A decoded image held by the memory tier.
#[derive(Debug, Clone)]
pub struct CachedImage {
    image: Arc<DynamicImage>,
}

impl CachedImage {
    /// Wraps a decoded image.
    #[must_use]
    pub fn new(image: impl Into<Arc<DynamicImage>>) -> Self {
        Self {
            image: image.into(),
        }
    }

    /// Returns the decoded image.
    #[must_use]
    pub fn image(&self) -> &Arc<DynamicImage> {
        &self.image
    }

    /// Estimated memory cost in bytes.
    ///
    /// Pixel dimensions are already points multiplied by scale.
    #[must_use]
    pub fn cost(&self) -> u64 {
        u64::from(self.image.width()) * u64::from(self.image.height()) * BYTES_PER_PIXEL
    }
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Loaded from the in-memory LRU cache.
    MemoryCache,
    /// Loaded from the disk cache.
    DiskCache,
    /// Downloaded from the network.
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// An image ready for display.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Key the image was requested under.
    pub key: CacheKey,
    /// The decoded image.
    pub image: Arc<DynamicImage>,
    /// Tier that served the request.
    pub source: ImageSource,
}

/// Status of an image in the loading pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ImageStatus {
    /// Image loading has not started.
    #[default]
    NotStarted,
    /// Image is being fetched or decoded.
    Loading,
    /// Image is loaded and ready for display.
    Ready,
    /// Image loading failed with an error message.
    Failed(String),
}

impl ImageStatus {
    /// Returns true if the image is ready for rendering.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns true if the image is currently being loaded.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns true if loading failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
