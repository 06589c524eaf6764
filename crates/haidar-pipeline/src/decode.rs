//! Image decoding into an RGBA working buffer.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP) and produces the
//! straight-alpha RGBA buffer every later stage operates on.

use crate::types::{InputError, PipelineError, PixelBuffer};

/// Decode raw image bytes into an RGBA pixel buffer.
///
/// Images without an alpha channel come back fully opaque.
///
/// # Errors
///
/// Returns [`InputError::Empty`] if `bytes` is empty, or
/// [`InputError::Decode`] if the format is unrecognized or the data is
/// corrupt. Both surface as [`PipelineError::InputFailure`].
pub fn decode(bytes: &[u8]) -> Result<PixelBuffer, PipelineError> {
    if bytes.is_empty() {
        return Err(InputError::Empty.into());
    }

    let img = image::load_from_memory(bytes)?;
    Ok(img.into_rgba8())
}
