//! The interactive editing context.
//!
//! A [`Session`] owns everything one editor works on: the shared
//! [`Workspace`], the [`RetouchEngine`] and its original snapshot, the
//! image last published for download, and which batch result (if any)
//! is open for re-editing. Exclusive access is a `&mut Session` borrow.
//!
//! Segmentation is split in two so a slow model never holds the session:
//! [`Session::begin_segmentation`] hands out a [`SegmentationTicket`], and
//! [`Session::apply_segmentation`] only accepts the result if no newer
//! image was loaded in the meantime.

use std::rc::Rc;

use haidar_pipeline::{
    BrushMode, Conversion, ConversionScheduler, EngineConfig, EngineFactory, PipelineError,
    PixelBuffer, Point, RetouchEngine, RetouchState, Segmenter, Workspace, load_source, refine,
};

use crate::result::{BatchResult, ResultId};

/// Proof of which image a segmentation request was made for.
#[derive(Debug, Clone)]
pub struct SegmentationTicket {
    generation: u64,
    image: PixelBuffer,
}

impl SegmentationTicket {
    /// The image to hand to the segmenter.
    #[must_use]
    pub const fn image(&self) -> &PixelBuffer {
        &self.image
    }
}

/// One editor's working state.
#[derive(Debug, Default)]
pub struct Session {
    workspace: Workspace,
    retouch: RetouchEngine,
    /// Image offered for download; refreshed when retouching ends.
    published: Option<PixelBuffer>,
    /// The working buffer has been through segmentation.
    background_removed: bool,
    editing: Option<ResultId>,
    /// Bumped by every load; stale segmentation results are dropped.
    generation: u64,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub(crate) const fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    #[must_use]
    pub const fn retouch(&self) -> &RetouchEngine {
        &self.retouch
    }

    /// The image last published for download.
    #[must_use]
    pub const fn published(&self) -> Option<&PixelBuffer> {
        self.published.as_ref()
    }

    #[must_use]
    pub const fn background_removed(&self) -> bool {
        self.background_removed
    }

    /// The batch result open for re-editing.
    #[must_use]
    pub const fn editing(&self) -> Option<ResultId> {
        self.editing
    }

    /// Forget the batch result being edited.
    pub const fn stop_editing(&mut self) {
        self.editing = None;
    }

    /// Start over with a fresh image.
    ///
    /// Clears the retouch snapshot, the editing target and any pending
    /// segmentation.
    pub fn load_image(&mut self, image: PixelBuffer) {
        self.generation += 1;
        self.retouch.clear_snapshot();
        self.editing = None;
        self.background_removed = false;
        self.published = Some(image.clone());
        self.workspace.load(image);
    }

    /// Decode, normalize and load image bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputFailure`] if the bytes do not decode.
    /// The session is unchanged.
    pub fn load_bytes(&mut self, bytes: &[u8], max_dimension: u32) -> Result<(), PipelineError> {
        let image = load_source(bytes, max_dimension)?;
        self.load_image(image);
        Ok(())
    }

    /// Request segmentation of the current working buffer.
    #[must_use]
    pub fn begin_segmentation(&self) -> SegmentationTicket {
        SegmentationTicket {
            generation: self.generation,
            image: self.workspace.buffer().clone(),
        }
    }

    /// Accept a segmentation result, refine it and capture the retouch
    /// snapshot.
    ///
    /// Returns `Ok(false)` and changes nothing if another image was
    /// loaded since `ticket` was issued.
    ///
    /// # Errors
    ///
    /// Returns the segmenter's error unchanged. Nothing is committed.
    pub fn apply_segmentation(
        &mut self,
        ticket: &SegmentationTicket,
        segmented: Result<PixelBuffer, PipelineError>,
    ) -> Result<bool, PipelineError> {
        if ticket.generation != self.generation {
            tracing::debug!(
                issued = ticket.generation,
                current = self.generation,
                "discarding stale segmentation result"
            );
            return Ok(false);
        }
        let segmented = segmented?;
        if segmented.dimensions() != ticket.image.dimensions() {
            return Err(PipelineError::segmentation(format!(
                "segmenter returned {}x{}, expected {}x{}",
                segmented.width(),
                segmented.height(),
                ticket.image.width(),
                ticket.image.height(),
            )));
        }

        let refined = refine(&segmented);
        self.install_cutout(refined);
        Ok(true)
    }

    /// Segment the working buffer with `segmenter` and apply the result.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if segmentation fails.
    #[allow(clippy::future_not_send)] // single-threaded; Send is not needed
    pub async fn remove_background<S: Segmenter>(
        &mut self,
        segmenter: &S,
    ) -> Result<bool, PipelineError> {
        let ticket = self.begin_segmentation();
        let segmented = segmenter.segment(ticket.image()).await;
        self.apply_segmentation(&ticket, segmented)
    }

    /// Open a batch result for retouching and re-conversion.
    ///
    /// The result's background-removed image becomes both the working
    /// buffer and the retouch snapshot.
    pub fn reopen(&mut self, result: &BatchResult) {
        self.generation += 1;
        self.install_cutout(result.no_background.clone());
        self.editing = Some(result.id);
        tracing::debug!(id = %result.id, name = %result.name, "batch result reopened");
    }

    /// Any stroke or retouch session on the previous image ends here.
    fn install_cutout(&mut self, cutout: PixelBuffer) {
        self.workspace.load(cutout.clone());
        self.retouch.clear_snapshot();
        self.retouch.set_snapshot(Rc::new(cutout.clone()));
        self.published = Some(cutout);
        self.background_removed = true;
    }

    // --- Retouching ---

    /// Flip retouching on or off.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] when no snapshot exists.
    pub fn toggle_retouch(&mut self) -> Result<RetouchState, PipelineError> {
        let was_active = self.retouch.is_active();
        let state = self.retouch.toggle()?;
        if was_active && state == RetouchState::Idle {
            self.publish();
        }
        Ok(state)
    }

    /// Pick a brush, activating retouching if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] when no snapshot exists.
    pub fn select_brush(&mut self, mode: BrushMode) -> Result<RetouchState, PipelineError> {
        self.retouch.select_mode(mode)
    }

    pub fn set_brush_radius(&mut self, radius: u32) {
        self.retouch.set_radius(radius);
    }

    /// Leave retouching and publish the edited image.
    pub fn finish_retouch(&mut self) {
        if self.retouch.done() {
            self.publish();
        }
    }

    /// # Errors
    ///
    /// See [`RetouchEngine::begin_stroke`].
    pub fn begin_stroke(&mut self, at: Point) -> Result<bool, PipelineError> {
        self.retouch.begin_stroke(self.workspace.buffer_mut(), at)
    }

    /// # Errors
    ///
    /// See [`RetouchEngine::continue_stroke`].
    pub fn continue_stroke(&mut self, to: Point) -> Result<bool, PipelineError> {
        self.retouch.continue_stroke(self.workspace.buffer_mut(), to)
    }

    pub const fn end_stroke(&mut self) {
        self.retouch.end_stroke();
    }

    fn publish(&mut self) {
        self.published = Some(self.workspace.buffer().clone());
        tracing::debug!(dimensions = %self.workspace.dimensions(), "retouched image published");
    }

    // --- Conversion ---

    /// Start converting the working buffer.
    ///
    /// Near-invisible pixels are filtered out first when the background
    /// has been removed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if the engine cannot
    /// be built.
    pub fn begin_conversion(
        &mut self,
        factory: &dyn EngineFactory,
        config: &EngineConfig,
    ) -> Result<Rc<ConversionScheduler>, PipelineError> {
        self.workspace
            .begin_conversion(factory, config, self.background_removed)
    }

    /// Install a finished conversion. See [`Workspace::finish_conversion`].
    ///
    /// # Errors
    ///
    /// Returns the conversion's error. The document is untouched.
    pub fn finish_conversion(
        &mut self,
        scheduler: &Rc<ConversionScheduler>,
        outcome: Result<Conversion, PipelineError>,
    ) -> Result<bool, PipelineError> {
        self.workspace.finish_conversion(scheduler, outcome)
    }

    /// Convert the working buffer and install the document.
    ///
    /// Returns `Ok(false)` if the conversion was stopped.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the engine fails or the result is empty.
    #[allow(clippy::future_not_send)] // single-threaded; Send is not needed
    pub async fn convert(
        &mut self,
        factory: &dyn EngineFactory,
        config: &EngineConfig,
    ) -> Result<bool, PipelineError> {
        let scheduler = self.begin_conversion(factory, config)?;
        let outcome = scheduler.run().await;
        self.finish_conversion(&scheduler, outcome)
    }

    /// Stop the running conversion.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] if nothing is running.
    pub fn stop_conversion(&mut self) -> Result<(), PipelineError> {
        self.workspace.stop_conversion()
    }
}
