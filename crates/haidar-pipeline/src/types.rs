//! Shared types for the haidar pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Re-export `RgbaImage` so downstream crates can hold pixel buffers
/// without depending on `image` directly.
pub use image::RgbaImage;

/// A dense RGBA pixel buffer, one byte per channel.
///
/// This is the working-buffer type shared by every stage: segmentation
/// output, refined masks, retouched images and raster renditions.
pub type PixelBuffer = RgbaImage;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.hypot(dy)
    }

    /// Linear interpolation towards `other` at parameter `t`.
    #[must_use]
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self::new(
            t.mul_add(other.x - self.x, self.x),
            t.mul_add(other.y - self.y, self.y),
        )
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of an existing pixel buffer.
    #[must_use]
    pub fn of(buffer: &PixelBuffer) -> Self {
        Self {
            width: buffer.width(),
            height: buffer.height(),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A resource an operation needed but could not find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    /// No original snapshot has been captured for retouching.
    OriginalSnapshot,
    /// No vectorization engine is currently active.
    ActiveEngine,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OriginalSnapshot => f.write_str("original snapshot"),
            Self::ActiveEngine => f.write_str("active vectorization engine"),
        }
    }
}

/// The external collaborator that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collaborator {
    /// The background-segmentation model.
    Segmentation,
    /// The vectorization engine.
    Engine,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segmentation => f.write_str("segmentation"),
            Self::Engine => f.write_str("vectorization engine"),
        }
    }
}

/// Reasons a source image could not be read.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// The input image bytes were empty.
    #[error("input image data is empty")]
    Empty,

    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Errors that can occur anywhere in the pipeline.
///
/// No operation retries on its own: callers decide whether to re-trigger.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An operation needed a resource that does not exist.
    #[error("{0} is not available")]
    ResourceUnavailable(Resource),

    /// An external collaborator failed or faulted.
    #[error("{collaborator} failed: {message}")]
    CollaboratorFailure {
        /// Which collaborator failed.
        collaborator: Collaborator,
        /// Human-readable cause.
        message: String,
    },

    /// A conversion finished but produced too little to be useful.
    #[error("conversion produced an empty vector document ({nodes} nodes)")]
    EmptyResult {
        /// Number of nodes the document held.
        nodes: usize,
    },

    /// The source image could not be read.
    #[error(transparent)]
    InputFailure(#[from] InputError),
}

impl PipelineError {
    /// Shorthand for a segmentation failure.
    pub fn segmentation(message: impl Into<String>) -> Self {
        Self::CollaboratorFailure {
            collaborator: Collaborator::Segmentation,
            message: message.into(),
        }
    }

    /// Shorthand for an engine failure.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::CollaboratorFailure {
            collaborator: Collaborator::Engine,
            message: message.into(),
        }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::InputFailure(InputError::Decode(err))
    }
}
