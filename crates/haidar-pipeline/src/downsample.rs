//! Input size normalization.
//!
//! Segmentation cost grows with pixel count, so every batch input is
//! reduced until neither side exceeds a fixed cap. The aspect ratio is
//! preserved. Images already within the cap are returned unchanged.

use std::fmt;

use image::imageops;
use serde::{Deserialize, Serialize};

use crate::types::PixelBuffer;

/// Longest side, in pixels, an image may have before segmentation.
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Resampling filter used when downsampling.
///
/// Ordered from fastest/lowest-quality to slowest/highest-quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownsampleFilter {
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Lanczos with 3 lobes: slowest, sharpest.
    Lanczos3,
}

impl DownsampleFilter {
    /// Convert to the `image` crate's `FilterType`.
    const fn to_image_filter(self) -> imageops::FilterType {
        match self {
            Self::Nearest => imageops::FilterType::Nearest,
            Self::Triangle => imageops::FilterType::Triangle,
            Self::CatmullRom => imageops::FilterType::CatmullRom,
            Self::Lanczos3 => imageops::FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for DownsampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Target size for an image so neither side exceeds `max_dimension`.
///
/// Returns `None` when the image already fits. Both sides of the
/// result are at least one pixel.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn fitted_size(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    if width <= max_dimension && height <= max_dimension {
        return None;
    }
    let ratio = (f64::from(max_dimension) / f64::from(width))
        .min(f64::from(max_dimension) / f64::from(height));
    let w = (f64::from(width) * ratio).round().max(1.0) as u32;
    let h = (f64::from(height) * ratio).round().max(1.0) as u32;
    Some((w, h))
}

/// Downsample a buffer so neither side exceeds `max_dimension`.
///
/// Returns the (possibly unchanged) buffer and whether resizing was
/// actually applied.
#[must_use]
pub fn normalize(
    image: PixelBuffer,
    max_dimension: u32,
    filter: DownsampleFilter,
) -> (PixelBuffer, bool) {
    match fitted_size(image.width(), image.height(), max_dimension) {
        None => (image, false),
        Some((w, h)) => (
            imageops::resize(&image, w, h, filter.to_image_filter()),
            true,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(w: u32, h: u32) -> PixelBuffer {
        PixelBuffer::from_pixel(w, h, image::Rgba([128, 128, 128, 255]))
    }

    #[test]
    fn default_filter_is_triangle() {
        assert_eq!(DownsampleFilter::default(), DownsampleFilter::Triangle);
    }

    #[test]
    fn no_resize_when_already_small() {
        let (result, applied) = normalize(test_image(100, 80), 256, DownsampleFilter::Triangle);
        assert!(!applied);
        assert_eq!(result.dimensions(), (100, 80));
    }

    #[test]
    fn no_resize_when_exact_match() {
        let (result, applied) = normalize(test_image(256, 200), 256, DownsampleFilter::Triangle);
        assert!(!applied);
        assert_eq!(result.dimensions(), (256, 200));
    }

    #[test]
    fn landscape_keeps_aspect_ratio() {
        let (result, applied) = normalize(test_image(2048, 1536), 1024, DownsampleFilter::Triangle);
        assert!(applied);
        assert_eq!(result.dimensions(), (1024, 768));
    }

    #[test]
    fn portrait_caps_height() {
        let (result, applied) = normalize(test_image(600, 1200), 256, DownsampleFilter::Nearest);
        assert!(applied);
        assert_eq!(result.dimensions(), (128, 256));
    }

    #[test]
    fn extreme_aspect_never_collapses_to_zero() {
        assert_eq!(fitted_size(10_000, 3, 100), Some((100, 1)));
    }
}
