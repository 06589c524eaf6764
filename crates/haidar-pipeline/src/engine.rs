//! Vectorization engine contract and configuration.
//!
//! An engine is an incrementally steppable tracer: it is built from an
//! [`EngineConfig`] and the pixels to trace, initialised once, then
//! advanced with [`VectorEngine::tick`] until it reports completion.
//! Each tick appends zero or more nodes to the [`VectorDocument`] it is
//! handed. The [`ConversionScheduler`](crate::scheduler::ConversionScheduler)
//! decides when ticks run.
//!
//! Users adjust [`EngineSettings`] (slider values in degrees and slider
//! units); [`EngineSettings::to_config`] converts them into the record
//! the engine actually consumes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::VectorDocument;
use crate::types::{PipelineError, PixelBuffer};

/// Fixed iteration cap for curve fitting.
pub const MAX_ITERATIONS: u32 = 10;

/// Default speckle filter slider value (pixels per side).
pub const DEFAULT_FILTER_SPECKLE: u32 = 4;

/// Default colour precision slider value (1..=8).
pub const DEFAULT_COLOR_PRECISION: u8 = 6;

/// Default gradient step between layers.
pub const DEFAULT_LAYER_DIFFERENCE: u32 = 16;

/// Default corner threshold in degrees.
pub const DEFAULT_CORNER_THRESHOLD: f64 = 60.0;

/// Default segment length threshold.
pub const DEFAULT_LENGTH_THRESHOLD: f64 = 4.0;

/// Default splice threshold in degrees.
pub const DEFAULT_SPLICE_THRESHOLD: f64 = 45.0;

/// Default decimal places in emitted path coordinates.
pub const DEFAULT_PATH_PRECISION: u32 = 8;

/// How traced outlines are fitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Pixel-accurate outlines, no fitting.
    None,
    /// Straight-segment polygons.
    Polygon,
    /// Smooth curves.
    #[default]
    Spline,
}

/// How pixels are grouped into layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringMode {
    /// Two layers: dark on light.
    Binary,
    /// Quantized colour layers.
    #[default]
    Color,
}

/// How colour layers relate to one another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hierarchy {
    /// Layers do not overlap.
    Cutout,
    /// Layers are stacked on top of each other.
    #[default]
    Stacked,
}

impl fmt::Display for PathMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Polygon => f.write_str("polygon"),
            Self::Spline => f.write_str("spline"),
        }
    }
}

/// The configuration record an engine is built from.
///
/// Angles are in radians. Every field is required when deserializing;
/// unknown fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mode: PathMode,
    pub clustering_mode: ClusteringMode,
    pub hierarchical: Hierarchy,
    /// Minimum angle, in radians, treated as a corner.
    pub corner_threshold: f64,
    pub length_threshold: f64,
    pub max_iterations: u32,
    /// Minimum angle displacement, in radians, at which a spline is split.
    pub splice_threshold: f64,
    /// Clusters smaller than this many pixels are discarded.
    pub filter_speckle: u32,
    /// Number of low bits dropped from each colour channel.
    pub color_precision: u8,
    pub layer_difference: u32,
    pub path_precision: u32,
}

impl EngineConfig {
    /// Parse a JSON configuration record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if the record is
    /// malformed or a required field is missing.
    pub fn from_record(record: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(record)
            .map_err(|e| PipelineError::engine(format!("invalid configuration record: {e}")))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineSettings::default().to_config()
    }
}

/// User-facing conversion settings, in slider units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub mode: PathMode,
    pub clustering_mode: ClusteringMode,
    pub hierarchical: Hierarchy,
    /// Speckle filter slider; squared to get a pixel count.
    pub filter_speckle: u32,
    /// Colour precision slider, 1 (coarse) to 8 (exact).
    pub color_precision: u8,
    pub layer_difference: u32,
    /// Corner threshold in degrees.
    pub corner_threshold: f64,
    pub length_threshold: f64,
    /// Splice threshold in degrees.
    pub splice_threshold: f64,
    pub path_precision: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: PathMode::default(),
            clustering_mode: ClusteringMode::default(),
            hierarchical: Hierarchy::default(),
            filter_speckle: DEFAULT_FILTER_SPECKLE,
            color_precision: DEFAULT_COLOR_PRECISION,
            layer_difference: DEFAULT_LAYER_DIFFERENCE,
            corner_threshold: DEFAULT_CORNER_THRESHOLD,
            length_threshold: DEFAULT_LENGTH_THRESHOLD,
            splice_threshold: DEFAULT_SPLICE_THRESHOLD,
            path_precision: DEFAULT_PATH_PRECISION,
        }
    }
}

impl EngineSettings {
    /// Settings tuned for images whose background was removed.
    ///
    /// Pixel-accurate outlines over stacked layers keep the cut-out edge
    /// intact.
    #[must_use]
    pub fn no_background() -> Self {
        Self {
            mode: PathMode::None,
            hierarchical: Hierarchy::Stacked,
            filter_speckle: 2,
            color_precision: 7,
            layer_difference: 12,
            corner_threshold: 60.0,
            length_threshold: 4.0,
            splice_threshold: 45.0,
            ..Self::default()
        }
    }

    /// Convert slider values into an engine configuration record.
    #[must_use]
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig {
            mode: self.mode,
            clustering_mode: self.clustering_mode,
            hierarchical: self.hierarchical,
            corner_threshold: self.corner_threshold.to_radians(),
            length_threshold: self.length_threshold,
            max_iterations: MAX_ITERATIONS,
            splice_threshold: self.splice_threshold.to_radians(),
            filter_speckle: self.filter_speckle.saturating_mul(self.filter_speckle),
            color_precision: 8u8.saturating_sub(self.color_precision),
            layer_difference: self.layer_difference,
            path_precision: self.path_precision,
        }
    }
}

/// An incrementally steppable vectorization engine.
pub trait VectorEngine {
    /// Prepare internal state. Called exactly once before the first tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot start.
    fn init(&mut self) -> Result<(), PipelineError>;

    /// Perform one bounded unit of work, appending any finished nodes to
    /// `document`. Returns `true` once the engine has nothing left to do.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine faulted. It must not be ticked again.
    fn tick(&mut self, document: &mut VectorDocument) -> Result<bool, PipelineError>;

    /// Completion estimate, 0 to 100.
    fn progress(&self) -> u8;

    /// Release everything the engine holds. Further ticks are invalid.
    fn free(&mut self);
}

/// Builds engines for a given configuration and source image.
pub trait EngineFactory {
    /// Construct an engine (not yet initialised).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unsupported.
    fn create(
        &self,
        config: &EngineConfig,
        image: &PixelBuffer,
    ) -> Result<Box<dyn VectorEngine>, PipelineError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn settings_convert_to_engine_units() {
        let config = EngineSettings::no_background().to_config();
        assert_eq!(config.mode, PathMode::None);
        assert_eq!(config.hierarchical, Hierarchy::Stacked);
        assert_eq!(config.filter_speckle, 4);
        assert_eq!(config.color_precision, 1);
        assert_eq!(config.layer_difference, 12);
        assert_eq!(config.max_iterations, 10);
        assert!((config.corner_threshold - std::f64::consts::FRAC_PI_3).abs() < 1e-12);
        assert!((config.splice_threshold - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn precision_slider_saturates() {
        let settings = EngineSettings {
            color_precision: 12,
            ..EngineSettings::default()
        };
        assert_eq!(settings.to_config().color_precision, 0);
    }

    #[test]
    fn record_parses_lowercase_enums() {
        let record = r#"{
            "canvas_id": "canvas",
            "mode": "polygon",
            "clustering_mode": "binary",
            "hierarchical": "cutout",
            "corner_threshold": 1.0,
            "length_threshold": 4.0,
            "max_iterations": 10,
            "splice_threshold": 0.5,
            "filter_speckle": 16,
            "color_precision": 2,
            "layer_difference": 16,
            "path_precision": 8
        }"#;
        let config = EngineConfig::from_record(record).unwrap();
        assert_eq!(config.mode, PathMode::Polygon);
        assert_eq!(config.clustering_mode, ClusteringMode::Binary);
        assert_eq!(config.hierarchical, Hierarchy::Cutout);
        assert_eq!(config.filter_speckle, 16);
    }

    #[test]
    fn record_missing_field_is_engine_failure() {
        let err = EngineConfig::from_record(r#"{"mode": "none"}"#).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CollaboratorFailure {
                collaborator: crate::types::Collaborator::Engine,
                ..
            }
        ));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineSettings::no_background().to_config();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""mode":"none""#));
        let parsed = EngineConfig::from_record(&json).unwrap();
        assert_eq!(parsed.hierarchical, config.hierarchical);
        assert_eq!(parsed.filter_speckle, config.filter_speckle);
        assert!((parsed.corner_threshold - config.corner_threshold).abs() < 1e-12);
    }
}
