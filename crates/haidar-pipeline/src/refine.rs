//! Mask refinement: clean up the alpha matte produced by segmentation.
//!
//! Segmentation models tend to erode thin subject edges and leave a
//! noisy semi-transparent fringe. [`refine`] runs three passes over the
//! alpha channel:
//!
//! 1. [`dilate`] pulls strong-but-not-solid pixels up toward their most
//!    opaque neighbour (radius 2),
//! 2. [`smooth_edges`] averages the fringe with its 4-neighbourhood,
//! 3. [`boost_colored`] lifts semi-transparent pixels that carry visible
//!    colour, since those are more likely subject than noise.
//!
//! All passes are pure functions of their input: no state is retained
//! between calls and the result is deterministic.

use crate::types::PixelBuffer;

/// Neighbourhood radius of the dilation pass.
pub const DILATION_RADIUS: u32 = 2;

/// Pixels at or below this alpha are never dilated.
const DILATION_MIN_ALPHA: u8 = 128;

/// Pixels at or below this alpha are never raised by dilation.
const DILATION_FLOOR: u8 = 50;

/// Fraction of the gap to the neighbourhood maximum closed by dilation.
const DILATION_GAIN: f64 = 0.3;

/// Exclusive alpha band smoothed by [`smooth_edges`].
const SMOOTH_BAND: (u8, u8) = (20, 235);

/// Exclusive alpha band boosted by [`boost_colored`].
const BOOST_BAND: (u8, u8) = (30, 200);

/// `R + G + B` must exceed this for a pixel to count as coloured.
const BOOST_MIN_COLOR_SUM: u16 = 50;

/// Alpha multiplier applied by [`boost_colored`].
const BOOST_FACTOR: f64 = 1.15;

/// Run the full refinement pipeline on a raw segmentation result.
///
/// Colour channels pass through untouched; only alpha changes.
#[must_use = "returns the refined buffer"]
pub fn refine(buffer: &PixelBuffer) -> PixelBuffer {
    let mut refined = dilate(buffer);
    smooth_edges(&mut refined);
    boost_colored(&mut refined);
    refined
}

/// Raise mostly-opaque pixels toward their most opaque neighbour.
///
/// For every pixel with alpha above 128 that is at least
/// [`DILATION_RADIUS`] pixels from each border, the maximum alpha of the
/// surrounding 5×5 window (excluding the pixel itself) is found. If it
/// exceeds the pixel's alpha, the pixel closes 30% of the gap.
///
/// Reads only from `input`, so the result does not depend on scan order.
/// Alpha never decreases.
#[must_use = "returns the dilated buffer"]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn dilate(input: &PixelBuffer) -> PixelBuffer {
    let mut out = input.clone();
    let (width, height) = input.dimensions();
    let r = DILATION_RADIUS;
    if width <= 2 * r || height <= 2 * r {
        return out;
    }

    for y in r..height - r {
        for x in r..width - r {
            let alpha = input.get_pixel(x, y).0[3];
            if alpha <= DILATION_MIN_ALPHA || alpha <= DILATION_FLOOR {
                continue;
            }

            let mut max_neighbour = alpha;
            for ny in y - r..=y + r {
                for nx in x - r..=x + r {
                    if nx == x && ny == y {
                        continue;
                    }
                    max_neighbour = max_neighbour.max(input.get_pixel(nx, ny).0[3]);
                }
            }

            if max_neighbour > alpha {
                let gap = f64::from(max_neighbour - alpha);
                let raised = DILATION_GAIN.mul_add(gap, f64::from(alpha)).round();
                out.get_pixel_mut(x, y).0[3] = raised.min(255.0) as u8;
            }
        }
    }
    out
}

/// Average fringe alpha with its 4-neighbourhood.
///
/// Pixels with alpha strictly between 20 and 235, excluding the
/// one-pixel border, get `round((3·self + N + S + E + W) / 7)`.
/// Operates in place in row-major order, so north and west neighbours
/// have already been smoothed when a pixel is visited.
#[allow(clippy::cast_possible_truncation)]
pub fn smooth_edges(buffer: &mut PixelBuffer) {
    let (width, height) = buffer.dimensions();
    if width < 3 || height < 3 {
        return;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let alpha = buffer.get_pixel(x, y).0[3];
            if alpha <= SMOOTH_BAND.0 || alpha >= SMOOTH_BAND.1 {
                continue;
            }
            let sum = 3 * u32::from(alpha)
                + u32::from(buffer.get_pixel(x, y - 1).0[3])
                + u32::from(buffer.get_pixel(x, y + 1).0[3])
                + u32::from(buffer.get_pixel(x - 1, y).0[3])
                + u32::from(buffer.get_pixel(x + 1, y).0[3]);
            // Round half up; the sum of seven u8 values always fits.
            buffer.get_pixel_mut(x, y).0[3] = ((sum * 2 + 7) / 14) as u8;
        }
    }
}

/// Lift semi-transparent pixels that carry visible colour.
///
/// Pixels with alpha strictly between 30 and 200 whose `R + G + B`
/// exceeds 50 have their alpha scaled by 1.15, capped at 255.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn boost_colored(buffer: &mut PixelBuffer) {
    for pixel in buffer.pixels_mut() {
        let [r, g, b, alpha] = pixel.0;
        if alpha <= BOOST_BAND.0 || alpha >= BOOST_BAND.1 {
            continue;
        }
        if u16::from(r) + u16::from(g) + u16::from(b) <= BOOST_MIN_COLOR_SUM {
            continue;
        }
        let boosted = (f64::from(alpha) * BOOST_FACTOR).round().min(255.0);
        pixel.0[3] = boosted as u8;
    }
}
