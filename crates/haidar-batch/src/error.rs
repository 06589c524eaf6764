//! Errors surfaced by sessions and batch runs.

use haidar_export::ExportError;
use haidar_pipeline::PipelineError;

use crate::result::ResultId;

/// Everything that can go wrong while converting or packaging.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Export(#[from] ExportError),

    /// The engine configuration could not be serialized for embedding.
    #[error("failed to serialize engine configuration: {0}")]
    Record(#[from] serde_json::Error),

    /// Re-conversion was requested but no batch result is open.
    #[error("no batch result is open for editing")]
    NotEditing,

    /// The result being edited is not part of the report.
    #[error("unknown batch result {0}")]
    UnknownResult(ResultId),

    /// The conversion was stopped before it produced a document.
    #[error("conversion stopped")]
    Stopped,
}
