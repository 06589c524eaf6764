//! Per-item outcomes of a batch run.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use haidar_export::{Archive, Artifacts, ExportError};
use haidar_pipeline::{EngineConfig, PixelBuffer, VectorDocument};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// One input of a batch run.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Original file name, used to derive output names.
    pub name: String,
    /// Encoded image bytes.
    pub source: Vec<u8>,
}

impl BatchItem {
    #[must_use]
    pub fn new(name: impl Into<String>, source: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

static NEXT_RESULT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle to a [`BatchResult`].
///
/// Unique within the process, so an id from one report never names a
/// result of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultId(pub(crate) u64);

impl ResultId {
    pub(crate) fn next() -> Self {
        Self(NEXT_RESULT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Produced by the batch run.
    Converted,
    /// Re-converted after being reopened for editing.
    Edited,
}

/// Everything produced for one successfully converted image.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub id: ResultId,
    /// File stem of the input.
    pub name: String,
    /// Input file name as given.
    pub file_name: String,
    /// Decoded input after size normalization.
    pub source: PixelBuffer,
    /// Segmented and refined image.
    pub no_background: PixelBuffer,
    pub document: VectorDocument,
    pub svg: String,
    /// Rendition of `document` over transparency.
    pub vector_raster: PixelBuffer,
    /// Rendition of `document` over the neutral backdrop.
    pub preview: PixelBuffer,
    /// Configuration the document was traced with.
    pub config: EngineConfig,
    pub status: ItemStatus,
}

impl BatchResult {
    fn artifacts(&self) -> Artifacts<'_> {
        Artifacts {
            stem: &self.name,
            no_background: &self.no_background,
            svg: &self.svg,
            vector_raster: &self.vector_raster,
        }
    }

    /// Package this result alone.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if a raster cannot be encoded.
    pub fn archive(&self) -> Result<Archive, ExportError> {
        let mut archive = Archive::new();
        archive.add(&self.artifacts())?;
        Ok(archive)
    }
}

/// An item that could not be converted.
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the item in the input.
    pub index: usize,
    pub name: String,
    pub error: BatchError,
}

/// Outcome of a whole batch run.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Successful items, in input order.
    pub results: Vec<BatchResult>,
    /// Failed items, in input order.
    pub failures: Vec<BatchFailure>,
    /// The run was stopped before every item was attempted.
    pub cancelled: bool,
}

impl BatchReport {
    #[must_use]
    pub fn result(&self, id: ResultId) -> Option<&BatchResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn result_mut(&mut self, id: ResultId) -> Option<&mut BatchResult> {
        self.results.iter_mut().find(|r| r.id == id)
    }

    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            converted: self.results.len(),
            edited: self
                .results
                .iter()
                .filter(|r| r.status == ItemStatus::Edited)
                .count(),
            failed: self.failures.len(),
            cancelled: self.cancelled,
        }
    }

    /// Package every result.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if a raster cannot be encoded.
    pub fn archive(&self) -> Result<Archive, ExportError> {
        let mut archive = Archive::new();
        for result in &self.results {
            archive.add(&result.artifacts())?;
        }
        Ok(archive)
    }
}

/// Counts for reporting a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub converted: usize,
    pub edited: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} converted, {} failed", self.converted, self.failed)?;
        if self.edited > 0 {
            write!(f, ", {} edited", self.edited)?;
        }
        if self.cancelled {
            f.write_str(" (stopped)")?;
        }
        Ok(())
    }
}
