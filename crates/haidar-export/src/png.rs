//! PNG encoding for raster outputs.

use image::ImageEncoder;
use image::codecs::png::PngEncoder;

use haidar_pipeline::PixelBuffer;

/// Errors that can occur while serializing outputs.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The PNG encoder rejected the buffer.
    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

/// Encode an RGBA buffer as PNG bytes, alpha preserved.
///
/// # Errors
///
/// Returns [`ExportError::Png`] if encoding fails.
pub fn encode_png(buffer: &PixelBuffer) -> Result<Vec<u8>, ExportError> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(
        buffer.as_raw(),
        buffer.width(),
        buffer.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(bytes)
}
