//! Raster renditions of a vector document.
//!
//! Documents never carry a background. A preview that needs one gets it
//! here, at render time, via [`Backdrop::Solid`]; the document itself is
//! untouched.

use tiny_skia::{Color, FillRule, Paint, PathBuilder, Pixmap, Transform};

use crate::document::{ShapeNode, VectorDocument};
use crate::types::PixelBuffer;

/// Backdrop colour used for previews.
pub const NEUTRAL_BACKDROP: [u8; 3] = [255, 255, 255];

/// What is painted behind the document's shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backdrop {
    /// Uncovered pixels stay fully transparent.
    #[default]
    Transparent,
    /// Uncovered pixels take this opaque colour.
    Solid([u8; 3]),
}

/// Build a tiny-skia path with one closed contour per subpath.
#[allow(clippy::cast_possible_truncation)]
fn node_path(node: &ShapeNode) -> Option<tiny_skia::Path> {
    let mut pb = PathBuilder::new();
    for subpath in &node.subpaths {
        let Some((first, rest)) = subpath.split_first() else {
            continue;
        };
        pb.move_to(first.x as f32, first.y as f32);
        for p in rest {
            pb.line_to(p.x as f32, p.y as f32);
        }
        pb.close();
    }
    pb.finish()
}

/// Rasterize `document` at its declared size.
///
/// Shapes are painted in document order with the non-zero fill rule.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn render(document: &VectorDocument, backdrop: Backdrop) -> PixelBuffer {
    let dims = document.dimensions();
    let Some(mut pixmap) = Pixmap::new(dims.width, dims.height) else {
        return PixelBuffer::new(dims.width, dims.height);
    };

    if let Backdrop::Solid([r, g, b]) = backdrop {
        pixmap.fill(Color::from_rgba8(r, g, b, 255));
    }

    for node in document.nodes() {
        let Some(path) = node_path(node) else {
            continue;
        };
        let [r, g, b] = node.fill;
        let mut paint = Paint::default();
        paint.set_color_rgba8(r, g, b, 255);
        paint.anti_alias = true;
        pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
    }

    // Pixmap data is premultiplied; RgbaImage is straight alpha.
    let data = pixmap.data();
    PixelBuffer::from_fn(dims.width, dims.height, |x, y| {
        let off = (y * dims.width + x) as usize * 4;
        let a = data[off + 3];
        if a == 0 {
            return image::Rgba([0, 0, 0, 0]);
        }
        let unpremultiply = |c: u8| (u16::from(c) * 255 / u16::from(a)) as u8;
        image::Rgba([
            unpremultiply(data[off]),
            unpremultiply(data[off + 1]),
            unpremultiply(data[off + 2]),
            a,
        ])
    })
}
