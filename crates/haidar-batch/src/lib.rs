//! haidar-batch: editing session and bulk conversion.
//!
//! [`Session`] is the explicit context of one editor: working buffer,
//! retouch state, published image and the batch result being re-edited.
//! [`BatchOrchestrator`] runs many images through segmentation,
//! refinement and conversion against that session, and can re-convert a
//! reopened result in place.

pub mod error;
pub mod orchestrator;
pub mod result;
pub mod session;

pub use error::BatchError;
pub use orchestrator::{BatchControl, BatchOrchestrator, BatchSettings};
pub use result::{
    BatchFailure, BatchItem, BatchReport, BatchResult, BatchSummary, ItemStatus, ResultId,
};
pub use session::{SegmentationTicket, Session};
