//! Background segmentation.
//!
//! A [`Segmenter`] takes an RGBA image and returns the same image with
//! background pixels made transparent. Segmentation is asynchronous:
//! callers await it and must be prepared for the result to arrive after
//! they have lost interest (see the batch orchestrator).
//!
//! [`BorderKeySegmenter`] is a model-free implementation that keys out
//! the colours found along the image border:
//!
//! 1. sample a band along all four edges, weighting samples toward the
//!    middle of each side,
//! 2. cluster the samples (distance 25) and keep the five heaviest
//!    clusters as background colours,
//! 3. flood-fill from the border through pixels close to a background
//!    colour, protecting textured regions near the centre,
//! 4. drop isolated background pixels and feather the mask edge.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{PipelineError, PixelBuffer};

/// Default segmentation model identifier.
pub const DEFAULT_MODEL: &str = "isnet_fp16";

/// Raster format a segmentation result is delivered in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    /// Lossless with alpha.
    #[default]
    Png,
}

impl RasterFormat {
    /// File extension, without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
        }
    }

    #[must_use]
    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
        }
    }
}

impl fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Configuration handed to a segmentation model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Model identifier.
    pub model: String,
    /// Output raster format. Always alpha-capable.
    pub format: RasterFormat,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            format: RasterFormat::Png,
        }
    }
}

/// Separates foreground from background.
///
/// Implementations return a buffer with the same dimensions as `image`,
/// where background pixels have low alpha.
#[allow(async_fn_in_trait)]
pub trait Segmenter {
    /// Segment `image`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if the model is
    /// unavailable or fails.
    async fn segment(&self, image: &PixelBuffer) -> Result<PixelBuffer, PipelineError>;
}

/// Samples closer than this join an existing cluster.
const CLUSTER_DISTANCE: f64 = 25.0;

/// Number of background colours kept.
const MAX_BACKGROUND_COLORS: usize = 5;

/// Colour distance tolerance before adapting to border noise.
const BASE_TOLERANCE: f64 = 40.0;

const VARIANCE_RADIUS: u32 = 3;

/// Mean neighbour distance above which a region counts as textured.
const TEXTURE_VARIANCE: f64 = 15.0;

/// Textured pixels closer to the centre than this ratio are kept.
const SEED_CENTER_RATIO: f64 = 0.3;

/// Same as [`SEED_CENTER_RATIO`], for propagation to neighbours.
const SPREAD_CENTER_RATIO: f64 = 0.25;

/// Tolerance multiplier for propagation to neighbours.
const SPREAD_TOLERANCE: f64 = 0.9;

/// A background pixel with this many foreground neighbours is kept.
const ISOLATED_NEIGHBOURS: u32 = 6;

/// Alpha lost per foreground neighbour along the feathered edge.
const FEATHER_STEP: u32 = 30;

/// Colour-keyed background remover that needs no model.
#[derive(Debug, Clone, Copy, Default)]
pub struct BorderKeySegmenter;

impl Segmenter for BorderKeySegmenter {
    async fn segment(&self, image: &PixelBuffer) -> Result<PixelBuffer, PipelineError> {
        Ok(key_out_border(image))
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    rgb: [f64; 3],
    weight: f64,
}

#[derive(Debug, Clone, Copy)]
struct ColorCluster {
    rgb: [f64; 3],
    weight: f64,
}

fn rgb_of(image: &PixelBuffer, x: u32, y: u32) -> [f64; 3] {
    let [r, g, b, _] = image.get_pixel(x, y).0;
    [f64::from(r), f64::from(g), f64::from(b)]
}

fn color_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    db.mul_add(db, dr.mul_add(dr, dg * dg)).sqrt()
}

/// Width of the border band that is sampled and seeded.
fn edge_band(width: u32, height: u32) -> u32 {
    (width.min(height) / 15).max(8).min(width.min(height))
}

/// Weighted samples from all four border bands.
fn sample_border(image: &PixelBuffer, band: u32) -> Vec<Sample> {
    let (width, height) = image.dimensions();
    let (w, h) = (f64::from(width), f64::from(height));
    let weight_at = |x: u32, y: u32| {
        let (x, y) = (f64::from(x), f64::from(y));
        let corner = ((x.min(w - x)) / (w / 4.0)).min(y.min(h - y) / (h / 4.0));
        corner.mul_add(3.0, 2.0)
    };

    let mut samples = Vec::new();
    for x in 0..width {
        for y in 0..band {
            let weight = weight_at(x, y);
            for (sx, sy) in [(x, y), (x, height - 1 - y)] {
                samples.push(Sample {
                    rgb: rgb_of(image, sx, sy),
                    weight,
                });
            }
        }
    }
    for y in 0..height {
        for x in 0..band {
            let weight = weight_at(x, y);
            for (sx, sy) in [(x, y), (width - 1 - x, y)] {
                samples.push(Sample {
                    rgb: rgb_of(image, sx, sy),
                    weight,
                });
            }
        }
    }
    samples
}

/// Greedy weighted clustering; heaviest clusters first.
fn cluster_samples(samples: &[Sample]) -> Vec<ColorCluster> {
    let mut clusters: Vec<ColorCluster> = Vec::new();
    for sample in samples {
        let nearest = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (i, color_distance(sample.rgb, c.rgb)))
            .filter(|(_, d)| *d < CLUSTER_DISTANCE)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i);

        match nearest.and_then(|i| clusters.get_mut(i)) {
            Some(cluster) => {
                let total = cluster.weight + sample.weight;
                for (c, s) in cluster.rgb.iter_mut().zip(sample.rgb) {
                    *c = c.mul_add(cluster.weight, s * sample.weight) / total;
                }
                cluster.weight = total;
            }
            None => clusters.push(ColorCluster {
                rgb: sample.rgb,
                weight: sample.weight,
            }),
        }
    }
    clusters.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    clusters.truncate(MAX_BACKGROUND_COLORS);
    clusters
}

/// Base tolerance widened by half the noisiest cluster's RMS spread.
#[allow(clippy::cast_precision_loss)]
fn adaptive_tolerance(samples: &[Sample], colors: &[ColorCluster]) -> f64 {
    let max_spread = colors
        .iter()
        .filter_map(|bg| {
            let (sum, count) = samples
                .iter()
                .map(|s| color_distance(s.rgb, bg.rgb))
                .filter(|d| *d < CLUSTER_DISTANCE)
                .fold((0.0, 0usize), |(sum, n), d| (d.mul_add(d, sum), n + 1));
            (count > 0).then(|| (sum / count as f64).sqrt())
        })
        .fold(0.0, f64::max);
    max_spread.mul_add(0.5, BASE_TOLERANCE)
}

/// Mean colour distance to the 7×7 neighbourhood; zero near the border.
fn variance_map(image: &PixelBuffer) -> Vec<f64> {
    let (width, height) = image.dimensions();
    let r = VARIANCE_RADIUS;
    let mut map = vec![0.0; width as usize * height as usize];
    if width <= 2 * r || height <= 2 * r {
        return map;
    }
    let window = f64::from((2 * r + 1) * (2 * r + 1));
    for y in r..height - r {
        for x in r..width - r {
            let center = rgb_of(image, x, y);
            let mut sum = 0.0;
            for ny in y - r..=y + r {
                for nx in x - r..=x + r {
                    sum += color_distance(rgb_of(image, nx, ny), center);
                }
            }
            map[(y * width + x) as usize] = sum / window;
        }
    }
    map
}

/// Make border-coloured background transparent.
///
/// Colour channels are preserved; only alpha changes.
#[must_use]
pub fn key_out_border(image: &PixelBuffer) -> PixelBuffer {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let band = edge_band(width, height);
    let samples = sample_border(image, band);
    let colors = cluster_samples(&samples);
    let tolerance = adaptive_tolerance(&samples, &colors);
    let variance = variance_map(image);

    let is_background = |x: u32, y: u32, tolerance: f64| {
        let rgb = rgb_of(image, x, y);
        colors
            .iter()
            .any(|bg| color_distance(rgb, bg.rgb) < tolerance)
    };

    let (cx, cy) = (f64::from(width) / 2.0, f64::from(height) / 2.0);
    let max_dist = cx.hypot(cy).max(f64::EPSILON);
    let center_ratio = |x: u32, y: u32| (f64::from(x) - cx).hypot(f64::from(y) - cy) / max_dist;
    let index = |x: u32, y: u32| (y * width + x) as usize;

    let mut mask = vec![false; width as usize * height as usize];
    let mut visited = vec![false; mask.len()];
    let mut queue = VecDeque::new();

    for y in 0..height {
        for x in 0..width {
            let in_band = x < band || x >= width - band || y < band || y >= height - band;
            if in_band && is_background(x, y, tolerance) {
                queue.push_back((x, y));
                visited[index(x, y)] = true;
            }
        }
    }

    while let Some((x, y)) = queue.pop_front() {
        let textured = variance[index(x, y)] > TEXTURE_VARIANCE;
        if is_background(x, y, tolerance) && (center_ratio(x, y) > SEED_CENTER_RATIO || !textured) {
            mask[index(x, y)] = true;
        }

        let neighbours = [
            x.checked_sub(1).map(|nx| (nx, y)),
            (x + 1 < width).then_some((x + 1, y)),
            y.checked_sub(1).map(|ny| (x, ny)),
            (y + 1 < height).then_some((x, y + 1)),
        ];
        for (nx, ny) in neighbours.into_iter().flatten() {
            let n = index(nx, ny);
            if visited[n] {
                continue;
            }
            visited[n] = true;
            let textured = variance[n] > TEXTURE_VARIANCE;
            if is_background(nx, ny, tolerance * SPREAD_TOLERANCE)
                && (center_ratio(nx, ny) > SPREAD_CENTER_RATIO || !textured)
            {
                queue.push_back((nx, ny));
            }
        }
    }

    let cleaned = drop_isolated(&mask, width, height);
    let mut out = image.clone();
    feather(&mut out, &cleaned);
    out
}

/// Count of 3×3 neighbours (excluding the centre) not in `mask`.
fn foreground_neighbours(mask: &[bool], width: u32, height: u32, x: u32, y: u32) -> u32 {
    let mut count = 0;
    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
            if (nx, ny) != (x, y) && !mask[(ny * width + nx) as usize] {
                count += 1;
            }
        }
    }
    count
}

/// Keep background pixels that are mostly surrounded by foreground.
fn drop_isolated(mask: &[bool], width: u32, height: u32) -> Vec<bool> {
    let mut cleaned = mask.to_vec();
    if width < 3 || height < 3 {
        return cleaned;
    }
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let i = (y * width + x) as usize;
            if mask[i] && foreground_neighbours(mask, width, height, x, y) >= ISOLATED_NEIGHBOURS {
                cleaned[i] = false;
            }
        }
    }
    cleaned
}

/// Clear background alpha, partially keeping pixels next to foreground.
#[allow(clippy::cast_possible_truncation)]
fn feather(image: &mut PixelBuffer, mask: &[bool]) {
    let (width, height) = image.dimensions();
    for y in 0..height {
        for x in 0..width {
            if !mask[(y * width + x) as usize] {
                continue;
            }
            let n = foreground_neighbours(mask, width, height, x, y);
            let alpha = 255u32.saturating_sub(n * FEATHER_STEP);
            image.get_pixel_mut(x, y).0[3] = alpha as u8;
        }
    }
}
