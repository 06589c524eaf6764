//! Reference scanline vectorization engine.
//!
//! [`ScanlineEngine`] produces pixel-accurate, rectilinear outlines:
//!
//! 1. **Scanning** (one row per tick): each row is split into runs of
//!    equal quantized colour. A run that matches a run of the previous
//!    row exactly (same start, end, and colour) extends that rectangle
//!    downward; any other run opens a new rectangle.
//! 2. **Emitting** (one cluster per tick): rectangles are grouped by
//!    colour, clusters smaller than `filter_speckle` pixels are dropped,
//!    and the rest are appended to the document largest first.
//!
//! Fully transparent pixels never become geometry, so the document
//! cannot contain a backing shape over a transparent area. The `mode`,
//! threshold and `hierarchical` settings are accepted but do not change
//! the output.

use std::collections::BTreeMap;

use crate::document::{ShapeNode, VectorDocument};
use crate::engine::{ClusteringMode, EngineConfig, EngineFactory, VectorEngine};
use crate::types::{PipelineError, PixelBuffer, Point};

/// Luminance below which a pixel is dark in binary clustering.
const BINARY_THRESHOLD: u32 = 128;

/// Axis-aligned pixel rectangle, `x1`/`y1` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl Rect {
    const fn area(self) -> u64 {
        (self.x1 - self.x0) as u64 * (self.y1 - self.y0) as u64
    }

    fn outline(self) -> Vec<Point> {
        let (x0, y0) = (f64::from(self.x0), f64::from(self.y0));
        let (x1, y1) = (f64::from(self.x1), f64::from(self.y1));
        vec![
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ]
    }
}

/// All rectangles of one colour.
#[derive(Debug, Clone)]
struct Cluster {
    fill: [u8; 3],
    area: u64,
    rects: Vec<Rect>,
}

/// Run key: start column, end column (exclusive), colour.
type RunKey = (u32, u32, [u8; 3]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    New,
    Scanning { row: u32 },
    Emitting { next: usize },
    Done,
    Freed,
}

/// A steppable engine that traces equal-colour runs into rectangles.
#[derive(Debug)]
pub struct ScanlineEngine {
    config: EngineConfig,
    image: PixelBuffer,
    stage: Stage,
    /// Rectangles still growing, keyed by their run, valued by top row.
    open: BTreeMap<RunKey, u32>,
    closed: BTreeMap<[u8; 3], Vec<Rect>>,
    clusters: Vec<Cluster>,
    progress: u8,
}

impl ScanlineEngine {
    /// Build an engine over a copy of `image`.
    #[must_use]
    pub fn new(config: EngineConfig, image: PixelBuffer) -> Self {
        Self {
            config,
            image,
            stage: Stage::New,
            open: BTreeMap::new(),
            closed: BTreeMap::new(),
            clusters: Vec::new(),
            progress: 0,
        }
    }

    /// Quantized colour of a pixel, or `None` if it produces no geometry.
    fn classify(&self, rgba: [u8; 4]) -> Option<[u8; 3]> {
        let [r, g, b, a] = rgba;
        if a == 0 {
            return None;
        }
        match self.config.clustering_mode {
            ClusteringMode::Binary => {
                let luma = (299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000;
                (luma < BINARY_THRESHOLD).then_some([0, 0, 0])
            }
            ClusteringMode::Color => {
                let mask = u8::MAX
                    .checked_shl(u32::from(self.config.color_precision))
                    .unwrap_or(0);
                Some([r & mask, g & mask, b & mask])
            }
        }
    }

    fn scan_row(&mut self, y: u32) {
        let width = self.image.width();
        let mut runs: Vec<RunKey> = Vec::new();
        let mut current: Option<(u32, [u8; 3])> = None;

        for x in 0..width {
            let class = self.classify(self.image.get_pixel(x, y).0);
            match (current, class) {
                (Some((_, c)), Some(next)) if c == next => {}
                (Some((start, c)), _) => {
                    runs.push((start, x, c));
                    current = class.map(|next| (x, next));
                }
                (None, _) => current = class.map(|next| (x, next)),
            }
        }
        if let Some((start, c)) = current {
            runs.push((start, width, c));
        }

        let mut still_open = BTreeMap::new();
        for run in runs {
            let top = self.open.remove(&run).unwrap_or(y);
            still_open.insert(run, top);
        }
        let finished = std::mem::replace(&mut self.open, still_open);
        self.close(finished, y);
    }

    fn close(&mut self, runs: BTreeMap<RunKey, u32>, bottom: u32) {
        for ((x0, x1, color), top) in runs {
            self.closed.entry(color).or_default().push(Rect {
                x0,
                y0: top,
                x1,
                y1: bottom,
            });
        }
    }

    /// Group closed rectangles into clusters, largest first.
    fn collect_clusters(&mut self) {
        let open = std::mem::take(&mut self.open);
        self.close(open, self.image.height());

        let min_area = u64::from(self.config.filter_speckle);
        let mut clusters: Vec<Cluster> = std::mem::take(&mut self.closed)
            .into_iter()
            .map(|(fill, rects)| Cluster {
                fill,
                area: rects.iter().copied().map(Rect::area).sum::<u64>(),
                rects,
            })
            .filter(|cluster| cluster.area >= min_area)
            .collect();
        clusters.sort_by(|a, b| b.area.cmp(&a.area).then(a.fill.cmp(&b.fill)));

        tracing::debug!(
            clusters = clusters.len(),
            filter_speckle = min_area,
            "scanline engine finished scanning"
        );
        self.clusters = clusters;
        self.stage = if self.clusters.is_empty() {
            self.progress = 100;
            Stage::Done
        } else {
            self.progress = 50;
            Stage::Emitting { next: 0 }
        };
    }

    #[allow(clippy::cast_possible_truncation)]
    fn scan_progress(rows_done: u32, height: u32) -> u8 {
        (u64::from(rows_done) * 50 / u64::from(height.max(1))) as u8
    }

    #[allow(clippy::cast_possible_truncation)]
    fn emit_progress(emitted: usize, total: usize) -> u8 {
        (50 + emitted * 50 / total.max(1)) as u8
    }
}

impl VectorEngine for ScanlineEngine {
    fn init(&mut self) -> Result<(), PipelineError> {
        match self.stage {
            Stage::New => {
                self.stage = Stage::Scanning { row: 0 };
                if self.image.height() == 0 {
                    self.collect_clusters();
                }
                Ok(())
            }
            Stage::Freed => Err(PipelineError::engine("engine already freed")),
            _ => Err(PipelineError::engine("engine initialised twice")),
        }
    }

    fn tick(&mut self, document: &mut VectorDocument) -> Result<bool, PipelineError> {
        match self.stage {
            Stage::New => Err(PipelineError::engine("tick before init")),
            Stage::Freed => Err(PipelineError::engine("tick after free")),
            Stage::Done => Ok(true),
            Stage::Scanning { row } => {
                self.scan_row(row);
                let height = self.image.height();
                self.progress = Self::scan_progress(row + 1, height);
                if row + 1 >= height {
                    self.collect_clusters();
                } else {
                    self.stage = Stage::Scanning { row: row + 1 };
                }
                Ok(self.stage == Stage::Done)
            }
            Stage::Emitting { next } => {
                if let Some(cluster) = self.clusters.get(next) {
                    let subpaths = cluster.rects.iter().copied().map(Rect::outline).collect();
                    document.push(ShapeNode::new(cluster.fill, subpaths));
                }
                let emitted = next + 1;
                self.progress = Self::emit_progress(emitted, self.clusters.len());
                if emitted >= self.clusters.len() {
                    self.stage = Stage::Done;
                    self.progress = 100;
                } else {
                    self.stage = Stage::Emitting { next: emitted };
                }
                Ok(self.stage == Stage::Done)
            }
        }
    }

    fn progress(&self) -> u8 {
        self.progress
    }

    fn free(&mut self) {
        self.image = PixelBuffer::new(0, 0);
        self.open.clear();
        self.closed.clear();
        self.clusters.clear();
        self.stage = Stage::Freed;
    }
}

/// Builds [`ScanlineEngine`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanlineEngineFactory;

impl EngineFactory for ScanlineEngineFactory {
    fn create(
        &self,
        config: &EngineConfig,
        image: &PixelBuffer,
    ) -> Result<Box<dyn VectorEngine>, PipelineError> {
        Ok(Box::new(ScanlineEngine::new(*config, image.clone())))
    }
}
