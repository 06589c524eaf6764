//! haidar-pipeline: background cut-out, retouching and vectorization core (sans-IO).
//!
//! Takes a raster photo through:
//! decode -> size normalization -> segmentation -> mask refinement ->
//! interactive retouch -> cooperative vectorization.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! byte slices and pixel buffers and returns structured data. File
//! handling, archives and batch bookkeeping live in `haidar-export` and
//! `haidar-batch`.
//!
//! The vectorization engine and the segmentation model are collaborators
//! behind the [`VectorEngine`]/[`EngineFactory`] and [`Segmenter`]
//! traits. [`ScanlineEngine`] and [`BorderKeySegmenter`] are reference
//! implementations of each.

pub mod decode;
pub mod document;
pub mod downsample;
pub mod engine;
pub mod refine;
pub mod render;
pub mod retouch;
pub mod scheduler;
pub mod segment;
pub mod trace;
pub mod types;
pub mod workspace;

pub use document::{ShapeNode, VectorDocument};
pub use downsample::{DEFAULT_MAX_DIMENSION, DownsampleFilter};
pub use engine::{
    ClusteringMode, EngineConfig, EngineFactory, EngineSettings, Hierarchy, PathMode, VectorEngine,
};
pub use refine::refine;
pub use render::{Backdrop, NEUTRAL_BACKDROP, render};
pub use retouch::{BrushMode, RetouchEngine, RetouchState};
pub use scheduler::{Conversion, ConversionScheduler, EngineState};
pub use segment::{BorderKeySegmenter, RasterFormat, SegmentationConfig, Segmenter};
pub use trace::{ScanlineEngine, ScanlineEngineFactory};
pub use types::{
    Collaborator, Dimensions, InputError, PipelineError, PixelBuffer, Point, Resource, RgbaImage,
};
pub use workspace::{VISIBILITY_THRESHOLD, Workspace, WorkspaceSnapshot};

/// Decode image bytes and shrink them to fit `max_dimension`.
///
/// This is the front of every conversion: the result is the buffer
/// handed to segmentation (or straight to a workspace).
///
/// # Errors
///
/// Returns [`PipelineError::InputFailure`] if the bytes are empty or
/// cannot be decoded.
pub fn load_source(bytes: &[u8], max_dimension: u32) -> Result<PixelBuffer, PipelineError> {
    let decoded = decode::decode(bytes)?;
    let original = Dimensions::of(&decoded);
    let (normalized, resized) =
        downsample::normalize(decoded, max_dimension, DownsampleFilter::Triangle);
    if resized {
        tracing::debug!(
            from = %original,
            to = %Dimensions::of(&normalized),
            "source downsampled"
        );
    }
    Ok(normalized)
}
