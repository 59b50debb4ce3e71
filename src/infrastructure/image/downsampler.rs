//! Decode-time downsampling.
//!
//! Large sources are reduced to the pixel size they will be displayed at, so
//! a 6000px photo shown in a 200pt cell never stays resident at full size.
//!
//! Only the header is read up front. Sources that need shrinking are then
//! decoded at reduced size where the format allows it:
//! - non-interlaced PNG is streamed row by row into a box filter, so only one
//!   source row is resident at a time
//! - JPEG is decoded with DCT scaling (1/2, 1/4 or 1/8) and finished with a
//!   thumbnail pass
//! - other formats are decoded in full under an allocation cap, and an
//!   overrun is reported as [`CacheError::ResourceLimit`]

use std::io::Cursor;

use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, Limits, RgbImage,
    RgbaImage,
};
use tracing::{debug, trace};

use crate::domain::entities::TargetSize;
use crate::domain::errors::{CacheError, CacheResult};

/// Upper bound on a full-size decode's working allocation (512 MiB).
const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

/// Decodes `bytes` into an image no larger than `target` requires.
///
/// The largest side of the result is at most
/// [`TargetSize::max_pixel_dimension`]. Images already within bounds are
/// returned at their native size.
///
/// # Errors
/// Returns [`CacheError::Decode`] if the bytes are not a decodable image, or
/// [`CacheError::ResourceLimit`] if a format without reduced-size decoding
/// needs more than the decode budget.
pub fn downsample(bytes: &[u8], target: TargetSize) -> CacheResult<DynamicImage> {
    downsample_within(bytes, target, MAX_DECODE_ALLOC)
}

fn downsample_within(
    bytes: &[u8],
    target: TargetSize,
    max_alloc: u64,
) -> CacheResult<DynamicImage> {
    let max_dimension = target.max_pixel_dimension();

    let header = reader(bytes)?;
    let format = header.format();
    let (width, height) = header
        .into_dimensions()
        .map_err(|e| CacheError::decode(format!("Failed to read image header: {e}")))?;

    if width.max(height) <= max_dimension {
        trace!(width, height, max_dimension, "Image within bounds, no downsampling");
        return decode_full(bytes, max_alloc);
    }

    let (to_width, to_height) = fit_within(width, height, max_dimension);

    let image = match format {
        Some(ImageFormat::Png) => match stream_png(bytes, to_width, to_height)? {
            Some(image) => image,
            None => shrink(decode_full(bytes, max_alloc)?, max_dimension),
        },
        Some(ImageFormat::Jpeg) => match decode_jpeg_scaled(bytes, to_width, to_height) {
            Some(image) => shrink(image, max_dimension),
            None => shrink(decode_full(bytes, max_alloc)?, max_dimension),
        },
        _ => shrink(decode_full(bytes, max_alloc)?, max_dimension),
    };

    trace!(
        from_width = width,
        from_height = height,
        to_width = image.width(),
        to_height = image.height(),
        "Downsampled image"
    );
    Ok(image)
}

fn reader(bytes: &[u8]) -> CacheResult<ImageReader<Cursor<&[u8]>>> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CacheError::decode(format!("Failed to guess image format: {e}")))
}

fn decode_full(bytes: &[u8], max_alloc: u64) -> CacheResult<DynamicImage> {
    let mut reader = reader(bytes)?;
    let mut limits = Limits::default();
    limits.max_alloc = Some(max_alloc);
    reader.limits(limits);

    reader.decode().map_err(|e| match e {
        image::ImageError::Limits(limit) => {
            CacheError::resource_limit(format!("Image too large to decode: {limit}"))
        }
        other => CacheError::decode(format!("Failed to decode image: {other}")),
    })
}

fn shrink(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    if image.width().max(image.height()) > max_dimension {
        image.thumbnail(max_dimension, max_dimension)
    } else {
        image
    }
}

/// Output size that fits `max_dimension` on the long side, keeping aspect.
fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let scale_short = |long: u32, short: u32| -> u32 {
        let scaled = (u64::from(short) * u64::from(max_dimension) + u64::from(long) / 2)
            / u64::from(long.max(1));
        u32::try_from(scaled).unwrap_or(max_dimension).clamp(1, max_dimension)
    };

    if width >= height {
        (max_dimension, scale_short(width, height))
    } else {
        (scale_short(height, width), max_dimension)
    }
}

/// Decodes a JPEG with DCT-domain scaling to the smallest factor that still
/// covers the requested size. Returns `None` when the stream needs the
/// general decoder (CMYK, 16-bit, or anything `jpeg-decoder` rejects).
fn decode_jpeg_scaled(bytes: &[u8], to_width: u32, to_height: u32) -> Option<DynamicImage> {
    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(bytes));
    let requested_width = u16::try_from(to_width).unwrap_or(u16::MAX);
    let requested_height = u16::try_from(to_height).unwrap_or(u16::MAX);

    let attempt = decoder
        .read_info()
        .and_then(|()| decoder.scale(requested_width, requested_height))
        .and_then(|size| decoder.decode().map(|pixels| (size, pixels)));

    let ((width, height), pixels) = match attempt {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "Scaled JPEG decode unavailable, using full decode");
            return None;
        }
    };

    let (width, height) = (u32::from(width), u32::from(height));
    match decoder.info()?.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8)
        }
        jpeg_decoder::PixelFormat::L8 => {
            GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8)
        }
        _ => None,
    }
}

/// Streams a non-interlaced PNG through a box filter. Returns `None` for
/// interlaced images, whose rows do not arrive in order.
fn stream_png(
    bytes: &[u8],
    to_width: u32,
    to_height: u32,
) -> CacheResult<Option<DynamicImage>> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| CacheError::decode(format!("Failed to read PNG header: {e}")))?;

    let info = reader.info();
    if info.interlaced {
        return Ok(None);
    }
    let (width, height) = (info.width, info.height);
    let (color, _) = reader.output_color_type();
    let channels = color.samples();

    let mut filter = BoxFilter::new(width, height, to_width, to_height, channels);
    let row_len = width as usize * channels;
    let mut y = 0u32;
    while let Some(row) = reader
        .next_row()
        .map_err(|e| CacheError::decode(format!("Failed to decode PNG row: {e}")))?
    {
        let data = row.data();
        if data.len() < row_len || y >= height {
            return Err(CacheError::decode("PNG row does not match header"));
        }
        filter.push_row(y, &data[..row_len]);
        y += 1;
    }
    if y != height {
        return Err(CacheError::decode("PNG ended before its last row"));
    }

    let pixels = filter.finish();
    let image = match color {
        png::ColorType::Grayscale => {
            GrayImage::from_raw(to_width, to_height, pixels).map(DynamicImage::ImageLuma8)
        }
        png::ColorType::GrayscaleAlpha => {
            GrayAlphaImage::from_raw(to_width, to_height, pixels).map(DynamicImage::ImageLumaA8)
        }
        png::ColorType::Rgb => {
            RgbImage::from_raw(to_width, to_height, pixels).map(DynamicImage::ImageRgb8)
        }
        png::ColorType::Rgba => {
            RgbaImage::from_raw(to_width, to_height, pixels).map(DynamicImage::ImageRgba8)
        }
        png::ColorType::Indexed => None,
    };

    image
        .map(Some)
        .ok_or_else(|| CacheError::decode("Unexpected PNG output layout"))
}

/// Area-averaging reducer fed one source row at a time.
///
/// Holds one accumulator row plus the finished output; memory does not
/// depend on the source height.
struct BoxFilter {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    channels: usize,
    current_row: u32,
    sums: Vec<u64>,
    counts: Vec<u64>,
    out: Vec<u8>,
}

impl BoxFilter {
    fn new(
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
        channels: usize,
    ) -> Self {
        let row = dst_width as usize;
        Self {
            src_width,
            src_height,
            dst_width,
            dst_height,
            channels,
            current_row: 0,
            sums: vec![0; row * channels],
            counts: vec![0; row],
            out: Vec::with_capacity(row * dst_height as usize * channels),
        }
    }

    fn push_row(&mut self, y: u32, row: &[u8]) {
        let dst_y = scale_index(y, self.src_height, self.dst_height);
        if dst_y != self.current_row {
            self.flush();
            self.current_row = dst_y;
        }

        let channels = self.channels;
        for (x, pixel) in (0..self.src_width).zip(row.chunks_exact(channels)) {
            let dst_x = scale_index(x, self.src_width, self.dst_width) as usize;
            let sums = &mut self.sums[dst_x * channels..(dst_x + 1) * channels];
            for (sum, &sample) in sums.iter_mut().zip(pixel) {
                *sum += u64::from(sample);
            }
            self.counts[dst_x] += 1;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn flush(&mut self) {
        for (dst_x, count) in self.counts.iter_mut().enumerate() {
            let n = (*count).max(1);
            let sums = &mut self.sums[dst_x * self.channels..(dst_x + 1) * self.channels];
            for sum in sums.iter_mut() {
                self.out.push((*sum / n) as u8);
                *sum = 0;
            }
            *count = 0;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.out
    }
}

#[allow(clippy::cast_possible_truncation)]
fn scale_index(index: u32, src: u32, dst: u32) -> u32 {
    ((u64::from(index) * u64::from(dst)) / u64::from(src.max(1))) as u32
}
