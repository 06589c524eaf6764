//! Bulk background removal and vectorization.
//!
//! [`BatchOrchestrator::run`] pushes items through decode, segmentation,
//! refinement and conversion one at a time, in input order. Conversion
//! borrows the session's working buffer: the workspace is snapshotted
//! before the refined image is written into it and restored afterwards,
//! whether the item succeeded or not. An interactive conversion that was
//! running when the batch took the buffer is stopped.
//!
//! A failing item becomes a [`BatchFailure`] and the batch moves on.
//! [`BatchControl::stop`] is cooperative: it is observed between stages
//! and between items, and it stops the scheduler of the item in flight.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use haidar_export::{SvgMetadata, file_stem, to_svg};
use haidar_pipeline::{
    Backdrop, Conversion, ConversionScheduler, DEFAULT_MAX_DIMENSION, EngineConfig,
    EngineFactory, EngineSettings, NEUTRAL_BACKDROP, PipelineError, PixelBuffer, Segmenter,
    VectorDocument, Workspace, load_source, refine, render,
};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::result::{BatchFailure, BatchItem, BatchReport, BatchResult, ItemStatus, ResultId};
use crate::session::Session;

/// Embedded in every exported SVG.
const SVG_DESCRIPTION: &str = "Background removed and vectorized with haidar";

/// How every item of a batch is processed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Longest side after size normalization, in pixels.
    pub max_dimension: u32,
    /// Engine configuration applied to every item.
    pub engine: EngineConfig,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            engine: EngineSettings::no_background().to_config(),
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    stopped: Cell<bool>,
    active: RefCell<Option<Rc<ConversionScheduler>>>,
}

/// Shared stop switch for a batch run.
///
/// Clones share state, so one clone can be handed to whatever asks the
/// batch to stop while another is passed to the run.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    state: Rc<ControlState>,
}

impl BatchControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the run to stop and stop the conversion in flight.
    pub fn stop(&self) {
        if !self.state.stopped.replace(true) {
            tracing::info!("batch stop requested");
        }
        if let Some(scheduler) = self.state.active.borrow().as_ref() {
            scheduler.stop();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.get()
    }

    /// Clear a previous stop so the control can be reused.
    pub fn reset(&self) {
        self.state.stopped.set(false);
    }

    fn attach(&self, scheduler: &Rc<ConversionScheduler>) {
        *self.state.active.borrow_mut() = Some(Rc::clone(scheduler));
        if self.is_stopped() {
            scheduler.stop();
        }
    }

    fn detach(&self) {
        self.state.active.borrow_mut().take();
    }

    #[allow(clippy::future_not_send)] // single-threaded; Send is not needed
    async fn drive(
        &self,
        scheduler: &Rc<ConversionScheduler>,
    ) -> Result<Conversion, PipelineError> {
        self.attach(scheduler);
        let outcome = scheduler.run().await;
        self.detach();
        outcome
    }
}

/// Serialized and rasterized forms of a document.
struct Renditions {
    svg: String,
    vector_raster: PixelBuffer,
    preview: PixelBuffer,
}

impl Renditions {
    fn new(name: &str, document: &VectorDocument, config: &EngineConfig) -> Result<Self, BatchError> {
        let record = serde_json::to_string(config)?;
        let metadata = SvgMetadata {
            title: Some(name),
            description: Some(SVG_DESCRIPTION),
            config_json: Some(&record),
        };
        Ok(Self {
            svg: to_svg(document, &metadata, config.path_precision),
            vector_raster: render(document, Backdrop::Transparent),
            preview: render(document, Backdrop::Solid(NEUTRAL_BACKDROP)),
        })
    }
}

/// Runs batches against one segmenter and one engine factory.
#[derive(Debug)]
pub struct BatchOrchestrator<S, F> {
    segmenter: S,
    factory: F,
    settings: BatchSettings,
}

impl<S: Segmenter, F: EngineFactory> BatchOrchestrator<S, F> {
    #[must_use]
    pub const fn new(segmenter: S, factory: F, settings: BatchSettings) -> Self {
        Self {
            segmenter,
            factory,
            settings,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Convert every item, in order.
    ///
    /// Never fails as a whole: per-item errors land in
    /// [`BatchReport::failures`]. The session's workspace is the same
    /// before and after.
    #[allow(clippy::future_not_send)] // single-threaded; Send is not needed
    pub async fn run(
        &self,
        session: &mut Session,
        items: &[BatchItem],
        control: &BatchControl,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        tracing::info!(items = items.len(), "batch started");

        for (index, item) in items.iter().enumerate() {
            if control.is_stopped() {
                report.cancelled = true;
                break;
            }
            match self.process(session, item, control).await {
                Ok(Some(result)) => {
                    tracing::info!(index, id = %result.id, name = %result.name, "batch item converted");
                    report.results.push(result);
                }
                Ok(None) => {
                    report.cancelled = true;
                    break;
                }
                Err(error) => {
                    tracing::warn!(index, name = %item.name, %error, "batch item failed");
                    report.failures.push(BatchFailure {
                        index,
                        name: item.name.clone(),
                        error,
                    });
                }
            }
            tokio::task::yield_now().await;
        }

        tracing::info!(summary = %report.summary(), "batch finished");
        report
    }

    /// Returns `Ok(None)` if the run was stopped while the item was in
    /// flight.
    #[allow(clippy::future_not_send)]
    async fn process(
        &self,
        session: &mut Session,
        item: &BatchItem,
        control: &BatchControl,
    ) -> Result<Option<BatchResult>, BatchError> {
        let source = load_source(&item.source, self.settings.max_dimension)?;
        tokio::task::yield_now().await;
        if control.is_stopped() {
            return Ok(None);
        }

        let segmented = self.segmenter.segment(&source).await?;
        if control.is_stopped() {
            tracing::debug!(name = %item.name, "discarding segmentation result after stop");
            return Ok(None);
        }
        if segmented.dimensions() != source.dimensions() {
            return Err(PipelineError::segmentation("segmenter changed the image size").into());
        }
        let no_background = refine(&segmented);

        let workspace = session.workspace_mut();
        let saved = workspace.snapshot();
        let converted = self
            .convert_in(workspace, no_background.clone(), control)
            .await;
        workspace.restore(saved);
        let Some(document) = converted? else {
            return Ok(None);
        };

        let name = file_stem(&item.name).to_owned();
        let config = self.settings.engine;
        let renditions = Renditions::new(&name, &document, &config)?;
        Ok(Some(BatchResult {
            id: ResultId::next(),
            name,
            file_name: item.name.clone(),
            source,
            no_background,
            document,
            svg: renditions.svg,
            vector_raster: renditions.vector_raster,
            preview: renditions.preview,
            config,
            status: ItemStatus::Converted,
        }))
    }

    #[allow(clippy::future_not_send)]
    async fn convert_in(
        &self,
        workspace: &mut Workspace,
        image: PixelBuffer,
        control: &BatchControl,
    ) -> Result<Option<VectorDocument>, BatchError> {
        workspace.load(image);
        let scheduler = workspace.begin_conversion(&self.factory, &self.settings.engine, true)?;
        let outcome = control.drive(&scheduler).await;
        if workspace.finish_conversion(&scheduler, outcome)? {
            Ok(Some(workspace.document().clone()))
        } else {
            Ok(None)
        }
    }

    /// Convert the batch result open in `session` again and patch it in
    /// place.
    ///
    /// Uses the result's stored configuration and the session's current
    /// (possibly retouched) working buffer. Any retouching in progress is
    /// finished first.
    ///
    /// # Errors
    ///
    /// - [`BatchError::NotEditing`] if no result was reopened.
    /// - [`BatchError::UnknownResult`] if it is not part of `report`.
    /// - [`BatchError::Stopped`] if `control` stopped the conversion.
    /// - [`BatchError::Pipeline`] if the conversion failed. The result is
    ///   unchanged.
    #[allow(clippy::future_not_send)] // single-threaded; Send is not needed
    pub async fn reconvert(
        &self,
        session: &mut Session,
        report: &mut BatchReport,
        control: &BatchControl,
    ) -> Result<ResultId, BatchError> {
        let id = session.editing().ok_or(BatchError::NotEditing)?;
        let config = report
            .result(id)
            .ok_or(BatchError::UnknownResult(id))?
            .config;

        session.finish_retouch();
        let no_background = session
            .published()
            .cloned()
            .unwrap_or_else(|| session.workspace().buffer().clone());

        let scheduler = session.begin_conversion(&self.factory, &config)?;
        let outcome = control.drive(&scheduler).await;
        if !session.finish_conversion(&scheduler, outcome)? {
            return Err(BatchError::Stopped);
        }
        let document = session.workspace().document().clone();

        let result = report.result_mut(id).ok_or(BatchError::UnknownResult(id))?;
        let renditions = Renditions::new(&result.name, &document, &config)?;
        result.no_background = no_background;
        result.document = document;
        result.svg = renditions.svg;
        result.vector_raster = renditions.vector_raster;
        result.preview = renditions.preview;
        result.status = ItemStatus::Edited;

        session.stop_editing();
        tracing::info!(%id, name = %result.name, "batch result updated");
        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use haidar_export::encode_png;
    use haidar_pipeline::{BorderKeySegmenter, BrushMode, Point, RetouchState, ScanlineEngineFactory};
    use image::Rgba;

    fn photo(subject: [u8; 3]) -> PixelBuffer {
        let [r, g, b] = subject;
        PixelBuffer::from_fn(40, 40, |x, y| {
            if (13..27).contains(&x) && (13..27).contains(&y) {
                Rgba([r, g, b, 255])
            } else {
                Rgba([250, 250, 245, 255])
            }
        })
    }

    fn item(name: &str, subject: [u8; 3]) -> BatchItem {
        BatchItem::new(name, encode_png(&photo(subject)).unwrap())
    }

    fn orchestrator() -> BatchOrchestrator<BorderKeySegmenter, ScanlineEngineFactory> {
        BatchOrchestrator::new(
            BorderKeySegmenter,
            ScanlineEngineFactory,
            BatchSettings::default(),
        )
    }

    /// A session the user was working in before starting the batch.
    fn busy_session() -> Session {
        let mut session = Session::new();
        session.load_image(PixelBuffer::from_pixel(7, 5, Rgba([9, 8, 7, 255])));
        session
    }

    struct Unavailable;

    impl Segmenter for Unavailable {
        async fn segment(&self, _image: &PixelBuffer) -> Result<PixelBuffer, PipelineError> {
            Err(PipelineError::segmentation("model unavailable"))
        }
    }

    /// Marks everything as background, so nothing is left to trace.
    struct EraseAll;

    impl Segmenter for EraseAll {
        async fn segment(&self, image: &PixelBuffer) -> Result<PixelBuffer, PipelineError> {
            Ok(PixelBuffer::new(image.width(), image.height()))
        }
    }

    /// Fails only the second image it is given.
    #[derive(Default)]
    struct FailsSecond {
        calls: Cell<u32>,
    }

    impl Segmenter for FailsSecond {
        async fn segment(&self, image: &PixelBuffer) -> Result<PixelBuffer, PipelineError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if call == 2 {
                return Err(PipelineError::segmentation("down"));
            }
            BorderKeySegmenter.segment(image).await
        }
    }

    /// Stops the batch while a segmentation is in flight.
    struct StopsDuring(BatchControl);

    impl Segmenter for StopsDuring {
        async fn segment(&self, image: &PixelBuffer) -> Result<PixelBuffer, PipelineError> {
            self.0.stop();
            BorderKeySegmenter.segment(image).await
        }
    }

    #[tokio::test]
    async fn failing_item_does_not_stop_the_batch() {
        let items = [
            item("red.png", [200, 30, 30]),
            BatchItem::new("broken.png", b"not an image".to_vec()),
            item("photos/blue.jpg", [30, 90, 200]),
        ];
        let mut session = busy_session();
        let report = orchestrator()
            .run(&mut session, &items, &BatchControl::new())
            .await;

        assert!(!report.cancelled);
        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["red", "blue"]);
        assert_ne!(report.results[0].id, report.results[1].id);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].name, "broken.png");
        assert!(matches!(
            report.failures[0].error,
            BatchError::Pipeline(PipelineError::InputFailure(_))
        ));
    }

    #[tokio::test]
    async fn segmenter_failure_on_one_item_does_not_stop_the_batch() {
        let flaky = BatchOrchestrator::new(
            FailsSecond::default(),
            ScanlineEngineFactory,
            BatchSettings::default(),
        );
        let mut session = busy_session();
        let before = session.workspace().snapshot();
        let report = flaky
            .run(
                &mut session,
                &[
                    item("one.png", [200, 30, 30]),
                    item("two.png", [30, 160, 60]),
                    item("three.png", [30, 90, 200]),
                ],
                &BatchControl::new(),
            )
            .await;

        assert!(!report.cancelled);
        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["one", "three"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].name, "two.png");
        assert!(matches!(
            report.failures[0].error,
            BatchError::Pipeline(PipelineError::CollaboratorFailure { .. })
        ));
        assert_eq!(session.workspace().snapshot(), before);
    }

    #[tokio::test]
    async fn results_carry_backdrop_free_outputs() {
        let mut session = busy_session();
        let report = orchestrator()
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        let result = &report.results[0];

        assert_eq!(result.status, ItemStatus::Converted);
        assert_eq!(result.file_name, "red.png");
        assert_eq!(result.config, BatchSettings::default().engine);
        assert_eq!(result.source.dimensions(), (40, 40));
        assert_eq!(result.no_background.get_pixel(0, 0).0[3], 0);
        assert!(result.document.find_backdrop().is_none());

        assert!(!result.svg.contains("<rect"));
        assert!(result.svg.contains("<title>red</title>"));
        assert!(result.svg.contains(r##"fill="#c81e1e""##));

        assert_eq!(result.vector_raster.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(result.preview.get_pixel(0, 0).0, [255, 255, 255, 255]);
        assert_eq!(result.preview.get_pixel(20, 20).0, [200, 30, 30, 255]);
    }

    #[tokio::test]
    async fn workspace_is_restored_after_success_and_failure() {
        let mut session = busy_session();
        let before = session.workspace().snapshot();

        orchestrator()
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        assert_eq!(session.workspace().snapshot(), before);

        // Everything erased: the conversion fails after taking the buffer.
        let erasing = BatchOrchestrator::new(EraseAll, ScanlineEngineFactory, BatchSettings::default());
        let report = erasing
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        assert!(matches!(
            report.failures[0].error,
            BatchError::Pipeline(PipelineError::EmptyResult { nodes: 0 })
        ));
        assert_eq!(session.workspace().snapshot(), before);
    }

    #[tokio::test]
    async fn segmentation_failure_is_recorded() {
        let failing = BatchOrchestrator::new(Unavailable, ScanlineEngineFactory, BatchSettings::default());
        let mut session = Session::new();
        let report = failing
            .run(
                &mut session,
                &[item("a.png", [1, 2, 3]), item("b.png", [4, 5, 6])],
                &BatchControl::new(),
            )
            .await;
        assert!(report.results.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(
            report.failures[1].error,
            BatchError::Pipeline(PipelineError::CollaboratorFailure { .. })
        ));
    }

    #[tokio::test]
    async fn stop_before_run_attempts_nothing() {
        let control = BatchControl::new();
        control.stop();
        let mut session = Session::new();
        let report = orchestrator()
            .run(&mut session, &[item("red.png", [200, 30, 30])], &control)
            .await;
        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn segmentation_result_after_stop_is_discarded() {
        let control = BatchControl::new();
        let stopping = BatchOrchestrator::new(
            StopsDuring(control.clone()),
            ScanlineEngineFactory,
            BatchSettings::default(),
        );
        let mut session = busy_session();
        let before = session.workspace().snapshot();
        let report = stopping
            .run(
                &mut session,
                &[item("a.png", [200, 30, 30]), item("b.png", [30, 90, 200])],
                &control,
            )
            .await;

        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(session.workspace().snapshot(), before);
    }

    #[test]
    fn control_stops_attached_scheduler() {
        let image = photo([200, 30, 30]);
        let config = BatchSettings::default().engine;

        let control = BatchControl::new();
        let scheduler = Rc::new(ConversionScheduler::new(&ScanlineEngineFactory, &config, &image).unwrap());
        control.attach(&scheduler);
        control.stop();
        assert!(scheduler.is_stopped());

        // Attaching after a stop stops immediately.
        let late = Rc::new(ConversionScheduler::new(&ScanlineEngineFactory, &config, &image).unwrap());
        control.attach(&late);
        assert!(late.is_stopped());

        control.reset();
        assert!(!control.is_stopped());
    }

    #[tokio::test]
    async fn reopen_and_reconvert_patches_in_place() {
        let orchestrator = orchestrator();
        let mut session = Session::new();
        let mut report = orchestrator
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        let original = report.results[0].clone();
        let paths_before: Vec<String> = report
            .archive()
            .unwrap()
            .into_entries()
            .into_iter()
            .map(|e| e.path)
            .collect();

        session.reopen(&original);
        assert_eq!(session.editing(), Some(original.id));
        assert_eq!(session.workspace().buffer(), &original.no_background);

        // Erase the left part of the subject.
        session.select_brush(BrushMode::Remove).unwrap();
        session.set_brush_radius(3);
        session.begin_stroke(Point::new(14.0, 14.0)).unwrap();
        session.continue_stroke(Point::new(14.0, 26.0)).unwrap();
        session.end_stroke();

        let id = orchestrator
            .reconvert(&mut session, &mut report, &BatchControl::new())
            .await
            .unwrap();
        assert_eq!(id, original.id);
        assert_eq!(report.results.len(), 1);

        let edited = &report.results[0];
        assert_eq!(edited.status, ItemStatus::Edited);
        assert_eq!(edited.name, original.name);
        assert_ne!(edited.no_background, original.no_background);
        assert_ne!(edited.svg, original.svg);
        assert!(session.editing().is_none());

        let paths_after: Vec<String> = report
            .archive()
            .unwrap()
            .into_entries()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths_after, paths_before);
        assert_eq!(
            paths_after,
            ["no-background/red.png", "vectorized/red.svg", "vectorized/red.png"]
        );
    }

    #[tokio::test]
    async fn reconvert_of_reloaded_export_without_edits_is_unchanged() {
        let orchestrator = orchestrator();
        let mut session = Session::new();
        let mut report = orchestrator
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        let original = report.results[0].clone();

        // Reload the downloaded cut-out as the editor would.
        let png = encode_png(&original.no_background).unwrap();
        let reloaded = image::load_from_memory_with_format(&png, image::ImageFormat::Png)
            .unwrap()
            .to_rgba8();
        assert_eq!(reloaded, original.no_background);

        session.reopen(&BatchResult {
            no_background: reloaded,
            ..original.clone()
        });
        orchestrator
            .reconvert(&mut session, &mut report, &BatchControl::new())
            .await
            .unwrap();

        let edited = &report.results[0];
        assert_eq!(edited.status, ItemStatus::Edited);
        assert_eq!(edited.document, original.document);
        assert_eq!(edited.svg, original.svg);
    }

    #[tokio::test]
    async fn reopen_ends_the_stroke_on_the_previous_image() {
        let mut session = Session::new();
        let report = orchestrator()
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        let result = &report.results[0];

        session.reopen(result);
        session.select_brush(BrushMode::Remove).unwrap();
        assert!(session.begin_stroke(Point::new(14.0, 14.0)).unwrap());

        session.reopen(result);
        assert_eq!(session.retouch().state(), RetouchState::Idle);
        assert!(!session.continue_stroke(Point::new(26.0, 26.0)).unwrap());
        assert_eq!(session.workspace().buffer(), &result.no_background);
    }

    #[tokio::test]
    async fn reconvert_rejects_a_result_from_another_report() {
        let mut session = Session::new();
        let first = orchestrator()
            .run(&mut session, &[item("red.png", [200, 30, 30])], &BatchControl::new())
            .await;
        let other = orchestrator();
        let mut second = other
            .run(&mut session, &[item("blue.png", [30, 90, 200])], &BatchControl::new())
            .await;
        assert_ne!(first.results[0].id, second.results[0].id);

        session.reopen(&first.results[0]);
        let id = first.results[0].id;
        assert!(matches!(
            other
                .reconvert(&mut session, &mut second, &BatchControl::new())
                .await,
            Err(BatchError::UnknownResult(unknown)) if unknown == id
        ));
        assert_eq!(second.results[0].status, ItemStatus::Converted);
    }

    #[tokio::test]
    async fn reconvert_requires_an_open_result() {
        let mut session = Session::new();
        let mut report = BatchReport::default();
        assert!(matches!(
            orchestrator()
                .reconvert(&mut session, &mut report, &BatchControl::new())
                .await,
            Err(BatchError::NotEditing)
        ));
    }

    #[tokio::test]
    async fn duplicate_names_get_distinct_archive_paths() {
        let mut session = Session::new();
        let report = orchestrator()
            .run(
                &mut session,
                &[item("a/cat.png", [200, 30, 30]), item("b/cat.png", [30, 90, 200])],
                &BatchControl::new(),
            )
            .await;
        let archive = report.archive().unwrap();
        let svgs: Vec<&str> = archive
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .filter(|p| p.ends_with(".svg"))
            .collect();
        assert_eq!(svgs, ["vectorized/cat.svg", "vectorized/cat-2.svg"]);
        assert_eq!(report.summary().converted, 2);
    }
}
