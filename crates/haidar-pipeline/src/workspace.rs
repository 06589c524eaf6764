//! The shared working buffer and the document traced from it.
//!
//! A [`Workspace`] is the single owner of the pixels being edited and of
//! the current [`VectorDocument`]. Whoever holds `&mut Workspace` has
//! exclusive mutation rights; the batch loop takes a [`WorkspaceSnapshot`]
//! first and restores it before handing the workspace back.
//!
//! At most one [`ConversionScheduler`] is live per workspace: starting a
//! conversion stops the previous one, and results from a scheduler that
//! is no longer the active one are discarded.

use std::rc::Rc;

use crate::document::VectorDocument;
use crate::engine::{EngineConfig, EngineFactory};
use crate::scheduler::{Conversion, ConversionScheduler};
use crate::types::{Dimensions, PipelineError, PixelBuffer, Resource};

/// Alpha below which pixels are cleared before tracing.
pub const VISIBILITY_THRESHOLD: u8 = 10;

/// Saved contents of a [`Workspace`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceSnapshot {
    buffer: PixelBuffer,
    document: VectorDocument,
}

impl WorkspaceSnapshot {
    #[must_use]
    pub const fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    #[must_use]
    pub const fn document(&self) -> &VectorDocument {
        &self.document
    }
}

/// Working buffer, current document, and the conversion tracing it.
#[derive(Debug)]
pub struct Workspace {
    buffer: PixelBuffer,
    document: VectorDocument,
    active: Option<Rc<ConversionScheduler>>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(PixelBuffer::new(0, 0))
    }
}

/// Set alpha to zero wherever it is below `threshold`.
pub fn filter_transparent(buffer: &mut PixelBuffer, threshold: u8) {
    for pixel in buffer.pixels_mut() {
        if pixel.0[3] < threshold {
            pixel.0[3] = 0;
        }
    }
}

impl Workspace {
    /// A workspace holding `buffer` and an empty document.
    #[must_use]
    pub fn new(buffer: PixelBuffer) -> Self {
        let document = VectorDocument::new(Dimensions::of(&buffer));
        Self {
            buffer,
            document,
            active: None,
        }
    }

    #[must_use]
    pub const fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    /// Mutable access for in-place edits such as retouch strokes.
    pub const fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    #[must_use]
    pub const fn document(&self) -> &VectorDocument {
        &self.document
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.buffer)
    }

    /// The scheduler currently converting this workspace, if any.
    #[must_use]
    pub const fn active_conversion(&self) -> Option<&Rc<ConversionScheduler>> {
        self.active.as_ref()
    }

    /// Replace the working buffer and clear the document.
    ///
    /// Any running conversion is stopped: it was tracing the old pixels.
    pub fn load(&mut self, buffer: PixelBuffer) {
        self.stop_active();
        self.document.reset(Dimensions::of(&buffer));
        self.buffer = buffer;
    }

    /// Copy the buffer and document.
    #[must_use]
    pub fn snapshot(&self) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            buffer: self.buffer.clone(),
            document: self.document.clone(),
        }
    }

    /// Put back a previously taken snapshot.
    ///
    /// Any conversion started since the snapshot is stopped.
    pub fn restore(&mut self, snapshot: WorkspaceSnapshot) {
        self.stop_active();
        self.buffer = snapshot.buffer;
        self.document = snapshot.document;
    }

    /// Start converting the working buffer.
    ///
    /// Stops and releases the previous scheduler before building the new
    /// one. With `filter_alpha`, pixels below [`VISIBILITY_THRESHOLD`]
    /// are cleared first so near-invisible noise is not traced; the
    /// filtered pixels are only committed once the engine has been built.
    /// The current document stays in place until
    /// [`finish_conversion`](Self::finish_conversion) replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if the engine cannot
    /// be built. The buffer and document are left unchanged.
    pub fn begin_conversion(
        &mut self,
        factory: &dyn EngineFactory,
        config: &EngineConfig,
        filter_alpha: bool,
    ) -> Result<Rc<ConversionScheduler>, PipelineError> {
        self.stop_active();

        let scheduler = if filter_alpha {
            let mut filtered = self.buffer.clone();
            filter_transparent(&mut filtered, VISIBILITY_THRESHOLD);
            let scheduler = ConversionScheduler::new(factory, config, &filtered)?;
            self.buffer = filtered;
            scheduler
        } else {
            ConversionScheduler::new(factory, config, &self.buffer)?
        };

        let scheduler = Rc::new(scheduler);
        self.active = Some(Rc::clone(&scheduler));
        tracing::debug!(dimensions = %self.dimensions(), filter_alpha, "conversion started");
        Ok(scheduler)
    }

    /// Install the outcome of `scheduler`'s run.
    ///
    /// Returns `Ok(true)` if a new document was installed. Outcomes from
    /// a scheduler that is no longer active are discarded with `Ok(false)`,
    /// as are stopped runs.
    ///
    /// # Errors
    ///
    /// Returns the run's error if it failed. The document is untouched.
    pub fn finish_conversion(
        &mut self,
        scheduler: &Rc<ConversionScheduler>,
        outcome: Result<Conversion, PipelineError>,
    ) -> Result<bool, PipelineError> {
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| Rc::ptr_eq(active, scheduler));
        if !is_active {
            tracing::debug!("discarding result from a superseded conversion");
            return Ok(false);
        }
        self.active = None;

        match outcome? {
            Conversion::Completed(document) => {
                tracing::debug!(nodes = document.len(), "document installed");
                self.document = document;
                Ok(true)
            }
            Conversion::Stopped => Ok(false),
        }
    }

    /// Stop the active conversion.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] if nothing is running.
    pub fn stop_conversion(&mut self) -> Result<(), PipelineError> {
        if self.stop_active() {
            Ok(())
        } else {
            Err(PipelineError::ResourceUnavailable(Resource::ActiveEngine))
        }
    }

    fn stop_active(&mut self) -> bool {
        self.active.take().is_some_and(|scheduler| {
            scheduler.stop();
            true
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use image::Rgba;

    use crate::engine::EngineSettings;
    use crate::scheduler::EngineState;
    use crate::trace::ScanlineEngineFactory;

    /// Opaque subject on a transparent field, with faint noise around it.
    fn cutout() -> PixelBuffer {
        PixelBuffer::from_fn(12, 10, |x, y| match (x, y) {
            (3..=8, 2..=7) => Rgba([180, 60, 20, 255]),
            (0, _) => Rgba([90, 90, 90, 6]),
            _ => Rgba([0, 0, 0, 0]),
        })
    }

    fn config() -> EngineConfig {
        EngineSettings::no_background().to_config()
    }

    #[tokio::test]
    async fn conversion_installs_document() {
        let mut ws = Workspace::new(cutout());
        let scheduler = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), true)
            .unwrap();
        let outcome = scheduler.run().await;
        assert!(ws.finish_conversion(&scheduler, outcome).unwrap());
        assert_eq!(ws.document().len(), 1);
        assert!(ws.active_conversion().is_none());
        // The faint column was filtered out of the working buffer.
        assert_eq!(ws.buffer().get_pixel(0, 0).0[3], 0);
    }

    #[tokio::test]
    async fn unfiltered_noise_is_traced() {
        let mut ws = Workspace::new(cutout());
        let scheduler = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), false)
            .unwrap();
        let outcome = scheduler.run().await;
        ws.finish_conversion(&scheduler, outcome).unwrap();
        assert_eq!(ws.document().len(), 2);
        assert_eq!(ws.buffer().get_pixel(0, 0).0[3], 6);
    }

    #[tokio::test]
    async fn new_conversion_stops_previous_and_discards_its_result() {
        let mut ws = Workspace::new(cutout());
        let first = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), true)
            .unwrap();
        let second = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), true)
            .unwrap();
        assert_eq!(first.state(), EngineState::Released);
        assert!(first.is_stopped());

        let stale = first.run().await;
        assert_eq!(stale.as_ref().unwrap(), &Conversion::Stopped);
        assert!(!ws.finish_conversion(&first, stale).unwrap());
        assert!(Rc::ptr_eq(ws.active_conversion().unwrap(), &second));

        let outcome = second.run().await;
        assert!(ws.finish_conversion(&second, outcome).unwrap());
    }

    #[test]
    fn stop_without_active_engine_is_an_error() {
        let mut ws = Workspace::new(cutout());
        assert!(matches!(
            ws.stop_conversion(),
            Err(PipelineError::ResourceUnavailable(Resource::ActiveEngine))
        ));

        let scheduler = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), false)
            .unwrap();
        ws.stop_conversion().unwrap();
        assert!(scheduler.is_stopped());
        assert!(ws.stop_conversion().is_err());
    }

    #[tokio::test]
    async fn failed_conversion_keeps_previous_document() {
        let mut ws = Workspace::new(cutout());
        let scheduler = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), true)
            .unwrap();
        let outcome = scheduler.run().await;
        ws.finish_conversion(&scheduler, outcome).unwrap();
        let traced = ws.document().clone();

        // Fade everything below the visibility threshold: the filtered
        // buffer traces to nothing.
        for pixel in ws.buffer_mut().pixels_mut() {
            pixel.0[3] = 5;
        }
        let scheduler = ws
            .begin_conversion(&ScanlineEngineFactory, &config(), true)
            .unwrap();
        let outcome = scheduler.run().await;
        assert!(matches!(
            ws.finish_conversion(&scheduler, outcome),
            Err(PipelineError::EmptyResult { nodes: 0 })
        ));
        assert_eq!(ws.document(), &traced);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut ws = Workspace::new(cutout());
        let saved = ws.snapshot();
        ws.load(PixelBuffer::from_pixel(3, 3, Rgba([255, 0, 0, 255])));
        assert_eq!(ws.dimensions(), Dimensions { width: 3, height: 3 });
        ws.restore(saved.clone());
        assert_eq!(ws.buffer(), saved.buffer());
        assert_eq!(ws.document(), saved.document());
    }

    #[test]
    fn filter_clears_only_faint_pixels() {
        let mut buffer = PixelBuffer::from_fn(3, 1, |x, _| Rgba([50, 50, 50, [9, 10, 200][x as usize]]));
        filter_transparent(&mut buffer, VISIBILITY_THRESHOLD);
        let alphas: Vec<u8> = buffer.pixels().map(|p| p.0[3]).collect();
        assert_eq!(alphas, [0, 10, 200]);
    }
}
