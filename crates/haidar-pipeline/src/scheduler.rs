//! Cooperative driver for a vectorization engine.
//!
//! A [`ConversionScheduler`] owns exactly one engine. [`run`] advances it
//! in steps: each step waits [`STEP_DELAY`], then ticks the engine
//! repeatedly until [`TICK_BUDGET`] of wall-clock time has passed, then
//! yields to the runtime. Nothing else on the thread is starved for
//! longer than one budget.
//!
//! Cancellation is polled: [`stop`] sets a flag and frees the engine at
//! once; the next step sees the flag and resolves [`run`] with
//! [`Conversion::Stopped`] without ticking again.
//!
//! All state lives in `Cell`/`RefCell`, so `run` and `stop` both take
//! `&self` and can be interleaved on a single-threaded runtime. The
//! futures are not `Send`.
//!
//! [`run`]: ConversionScheduler::run
//! [`stop`]: ConversionScheduler::stop

use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::Duration;

use web_time::Instant;

use crate::document::VectorDocument;
use crate::engine::{EngineConfig, EngineFactory, VectorEngine};
use crate::types::{Collaborator, Dimensions, PipelineError, PixelBuffer, Resource};

/// Wall-clock time one step may spend ticking the engine.
pub const TICK_BUDGET: Duration = Duration::from_millis(25);

/// Delay before each step.
pub const STEP_DELAY: Duration = Duration::from_millis(1);

/// Fewest nodes a completed document may hold.
pub const MIN_NODES: usize = 1;

/// Lifecycle of the engine a scheduler wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not yet initialised.
    Uninitialized,
    /// Initialised and accepting ticks.
    Running,
    /// Freed; no further ticks are possible.
    Released,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    /// The engine finished and produced this document.
    Completed(VectorDocument),
    /// [`ConversionScheduler::stop`] was called first.
    Stopped,
}

struct Inner {
    engine: Option<Box<dyn VectorEngine>>,
    document: VectorDocument,
    state: EngineState,
}

/// Outcome of one tick budget.
enum Step {
    Pending,
    Finished,
}

type ProgressObserver = Box<dyn Fn(u8)>;

/// Drives one engine to completion without blocking the thread.
pub struct ConversionScheduler {
    inner: RefCell<Inner>,
    /// The source had transparent pixels, so a full-canvas node is a fault.
    reject_backdrop: bool,
    stopped: Cell<bool>,
    progress: Cell<u8>,
    observer: RefCell<Option<ProgressObserver>>,
}

impl fmt::Debug for ConversionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionScheduler")
            .field("state", &self.state())
            .field("stopped", &self.stopped.get())
            .field("progress", &self.progress.get())
            .finish_non_exhaustive()
    }
}

/// Attribute any engine-side error to the engine collaborator.
fn engine_failure(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::CollaboratorFailure {
            collaborator: Collaborator::Engine,
            ..
        } => err,
        other => PipelineError::engine(other.to_string()),
    }
}

impl ConversionScheduler {
    /// Build and initialise an engine for `image`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if the factory or
    /// the engine's `init` fails. A partially built engine is freed.
    pub fn new(
        factory: &dyn EngineFactory,
        config: &EngineConfig,
        image: &PixelBuffer,
    ) -> Result<Self, PipelineError> {
        let dimensions = Dimensions::of(image);
        let mut engine = factory.create(config, image).map_err(engine_failure)?;
        if let Err(err) = engine.init() {
            engine.free();
            tracing::warn!(%err, "engine initialisation failed");
            return Err(engine_failure(err));
        }

        tracing::debug!(
            %dimensions,
            mode = %config.mode,
            filter_speckle = config.filter_speckle,
            color_precision = config.color_precision,
            "conversion engine initialised"
        );

        Ok(Self {
            inner: RefCell::new(Inner {
                engine: Some(engine),
                document: VectorDocument::new(dimensions),
                state: EngineState::Running,
            }),
            reject_backdrop: image.pixels().any(|p| p.0[3] == 0),
            stopped: Cell::new(false),
            progress: Cell::new(0),
            observer: RefCell::new(None),
        })
    }

    /// Build from a JSON configuration record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollaboratorFailure`] if the record does
    /// not parse or the engine cannot be built.
    pub fn from_record(
        factory: &dyn EngineFactory,
        record: &str,
        image: &PixelBuffer,
    ) -> Result<Self, PipelineError> {
        let config = EngineConfig::from_record(record)?;
        Self::new(factory, &config, image)
    }

    /// Call `observer` with every new progress value.
    pub fn set_observer(&self, observer: impl Fn(u8) + 'static) {
        *self.observer.borrow_mut() = Some(Box::new(observer));
    }

    /// Highest progress seen so far, 0 to 100.
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress.get()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.borrow().state
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Request cancellation and free the engine.
    ///
    /// Safe to call any number of times, before, during or after [`run`](Self::run).
    pub fn stop(&self) {
        if !self.stopped.replace(true) {
            tracing::debug!(progress = self.progress.get(), "conversion stopped");
        }
        self.release();
    }

    /// Drive the engine until it finishes or is stopped.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::CollaboratorFailure`] if a tick faults, or the
    ///   document paints a full-canvas backdrop over a transparent source.
    /// - [`PipelineError::EmptyResult`] if the document has too few nodes.
    #[allow(clippy::future_not_send)] // single-threaded; Send is not needed
    pub async fn run(&self) -> Result<Conversion, PipelineError> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(STEP_DELAY).await;
            if self.stopped.get() {
                return Ok(Conversion::Stopped);
            }
            match self.step()? {
                Step::Pending => {}
                Step::Finished => {
                    let document = self.finish()?;
                    tracing::info!(
                        nodes = document.len(),
                        elapsed_ms = started.elapsed().as_millis(),
                        "conversion complete"
                    );
                    return Ok(Conversion::Completed(document));
                }
            }
        }
    }

    /// Tick until done or out of budget.
    fn step(&self) -> Result<Step, PipelineError> {
        let budget_start = Instant::now();
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            let Inner {
                engine, document, ..
            } = &mut *inner;
            let Some(engine) = engine.as_mut() else {
                return Err(PipelineError::ResourceUnavailable(Resource::ActiveEngine));
            };

            loop {
                match engine.tick(document) {
                    Err(err) => break Err(err),
                    Ok(done) => {
                        let progress = engine.progress();
                        if done || progress >= 100 {
                            break Ok((Step::Finished, 100));
                        }
                        if budget_start.elapsed() >= TICK_BUDGET {
                            break Ok((Step::Pending, progress));
                        }
                    }
                }
            }
        };

        match outcome {
            Ok((step, progress)) => {
                self.observe(progress);
                Ok(step)
            }
            Err(err) => {
                tracing::warn!(%err, "engine faulted during tick");
                self.stopped.set(true);
                self.release();
                Err(engine_failure(err))
            }
        }
    }

    /// Release the engine and validate the finished document.
    fn finish(&self) -> Result<VectorDocument, PipelineError> {
        self.stopped.set(true);
        self.release();

        let document = {
            let mut inner = self.inner.borrow_mut();
            let dimensions = inner.document.dimensions();
            std::mem::replace(&mut inner.document, VectorDocument::new(dimensions))
        };

        if self.reject_backdrop && document.find_backdrop().is_some() {
            return Err(PipelineError::engine(
                "document paints an opaque backdrop over a transparent source",
            ));
        }
        if document.len() < MIN_NODES {
            return Err(PipelineError::EmptyResult {
                nodes: document.len(),
            });
        }
        Ok(document)
    }

    fn release(&self) {
        let engine = {
            let mut inner = self.inner.borrow_mut();
            inner.state = EngineState::Released;
            inner.engine.take()
        };
        if let Some(mut engine) = engine {
            engine.free();
        }
    }

    /// Record progress, keeping it non-decreasing, and notify the observer.
    fn observe(&self, progress: u8) {
        let clamped = progress.min(100);
        if clamped <= self.progress.get() {
            return;
        }
        self.progress.set(clamped);
        if let Some(observer) = self.observer.borrow().as_ref() {
            observer(clamped);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::rc::Rc;

    use image::Rgba;

    use crate::document::ShapeNode;
    use crate::engine::EngineSettings;
    use crate::trace::ScanlineEngineFactory;
    use crate::types::Point;

    /// Shared counters a scripted engine reports into.
    #[derive(Default)]
    struct Probe {
        ticks: Cell<usize>,
        frees: Cell<usize>,
        ticks_after_free: Cell<usize>,
    }

    #[derive(Clone, Copy)]
    enum Script {
        /// Never finishes on its own.
        Endless,
        /// Fails on the given tick.
        FailOn(usize),
        /// Reports progress 100 but never returns done.
        ProgressOnly,
        /// Emits one full-canvas rectangle and finishes.
        Backdrop,
        /// Fails in init.
        BadInit,
    }

    struct ScriptedEngine {
        script: Script,
        probe: Rc<Probe>,
        dimensions: Dimensions,
        freed: bool,
        progress: u8,
    }

    impl VectorEngine for ScriptedEngine {
        fn init(&mut self) -> Result<(), PipelineError> {
            match self.script {
                Script::BadInit => Err(PipelineError::engine("no memory")),
                _ => Ok(()),
            }
        }

        fn tick(&mut self, document: &mut VectorDocument) -> Result<bool, PipelineError> {
            if self.freed {
                self.probe
                    .ticks_after_free
                    .set(self.probe.ticks_after_free.get() + 1);
            }
            let n = self.probe.ticks.get() + 1;
            self.probe.ticks.set(n);
            match self.script {
                Script::Endless | Script::BadInit => Ok(false),
                Script::FailOn(k) if n >= k => Err(PipelineError::engine("tick fault")),
                Script::FailOn(_) => Ok(false),
                Script::ProgressOnly => {
                    self.progress = 100;
                    document.push(ShapeNode::new([1, 1, 1], vec![vec![Point::new(0.0, 0.0)]]));
                    Ok(false)
                }
                Script::Backdrop => {
                    let w = f64::from(self.dimensions.width);
                    let h = f64::from(self.dimensions.height);
                    document.push(ShapeNode::new(
                        [255, 255, 255],
                        vec![vec![
                            Point::new(0.0, 0.0),
                            Point::new(w, 0.0),
                            Point::new(w, h),
                            Point::new(0.0, h),
                        ]],
                    ));
                    Ok(true)
                }
            }
        }

        fn progress(&self) -> u8 {
            self.progress
        }

        fn free(&mut self) {
            self.freed = true;
            self.probe.frees.set(self.probe.frees.get() + 1);
        }
    }

    struct ScriptedFactory {
        script: Script,
        probe: Rc<Probe>,
    }

    impl ScriptedFactory {
        fn new(script: Script) -> Self {
            Self {
                script,
                probe: Rc::new(Probe::default()),
            }
        }
    }

    impl EngineFactory for ScriptedFactory {
        fn create(
            &self,
            _config: &EngineConfig,
            image: &PixelBuffer,
        ) -> Result<Box<dyn VectorEngine>, PipelineError> {
            Ok(Box::new(ScriptedEngine {
                script: self.script,
                probe: Rc::clone(&self.probe),
                dimensions: Dimensions::of(image),
                freed: false,
                progress: 0,
            }))
        }
    }

    fn opaque_image() -> PixelBuffer {
        PixelBuffer::from_fn(16, 12, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgba([220, 40, 40, 255])
            } else {
                Rgba([30, 30, 200, 255])
            }
        })
    }

    fn config() -> EngineConfig {
        EngineSettings::no_background().to_config()
    }

    #[tokio::test]
    async fn runs_scanline_engine_to_completion() {
        let image = opaque_image();
        let scheduler = ConversionScheduler::new(&ScanlineEngineFactory, &config(), &image).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        scheduler.set_observer(move |p| sink.borrow_mut().push(p));

        let doc = match scheduler.run().await.unwrap() {
            Conversion::Completed(doc) => doc,
            Conversion::Stopped => unreachable!("nothing stopped the scheduler"),
        };
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.dimensions(), Dimensions::of(&image));
        assert_eq!(scheduler.state(), EngineState::Released);
        assert_eq!(scheduler.progress(), 100);

        let seen = seen.borrow();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn stop_before_run_resolves_without_ticking() {
        let factory = ScriptedFactory::new(Script::Endless);
        let scheduler = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap();
        scheduler.stop();
        assert_eq!(scheduler.run().await.unwrap(), Conversion::Stopped);
        assert_eq!(factory.probe.ticks.get(), 0);
        assert_eq!(factory.probe.frees.get(), 1);
    }

    #[tokio::test]
    async fn stop_mid_run_halts_ticking() {
        let factory = ScriptedFactory::new(Script::Endless);
        let scheduler = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            scheduler.stop();
            factory.probe.ticks.get()
        };
        let (outcome, ticks_at_stop) = tokio::join!(scheduler.run(), stopper);

        assert_eq!(outcome.unwrap(), Conversion::Stopped);
        assert!(ticks_at_stop > 0);
        assert_eq!(factory.probe.ticks.get(), ticks_at_stop);
        assert_eq!(factory.probe.ticks_after_free.get(), 0);
        assert_eq!(scheduler.state(), EngineState::Released);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let factory = ScriptedFactory::new(Script::Endless);
        let scheduler = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap();
        scheduler.stop();
        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.is_stopped());
        assert_eq!(factory.probe.frees.get(), 1);
        assert_eq!(scheduler.run().await.unwrap(), Conversion::Stopped);
    }

    #[tokio::test]
    async fn tick_fault_releases_engine() {
        let factory = ScriptedFactory::new(Script::FailOn(3));
        let scheduler = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap();
        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CollaboratorFailure {
                collaborator: Collaborator::Engine,
                ..
            }
        ));
        assert!(scheduler.is_stopped());
        assert_eq!(factory.probe.frees.get(), 1);
        assert_eq!(factory.probe.ticks.get(), 3);
    }

    #[test]
    fn init_fault_is_collaborator_failure() {
        let factory = ScriptedFactory::new(Script::BadInit);
        let err = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap_err();
        assert!(err.to_string().contains("no memory"));
        assert_eq!(factory.probe.frees.get(), 1);
    }

    #[tokio::test]
    async fn full_progress_completes_without_done() {
        let factory = ScriptedFactory::new(Script::ProgressOnly);
        let scheduler = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap();
        let outcome = scheduler.run().await.unwrap();
        assert!(matches!(outcome, Conversion::Completed(ref doc) if doc.len() == 1));
        assert_eq!(factory.probe.ticks.get(), 1);
    }

    #[tokio::test]
    async fn empty_document_is_an_error() {
        let image = PixelBuffer::new(6, 6);
        let scheduler = ConversionScheduler::new(&ScanlineEngineFactory, &config(), &image).unwrap();
        assert!(matches!(
            scheduler.run().await,
            Err(PipelineError::EmptyResult { nodes: 0 })
        ));
    }

    #[tokio::test]
    async fn backdrop_over_transparency_is_rejected() {
        let mut image = opaque_image();
        image.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        let factory = ScriptedFactory::new(Script::Backdrop);
        let scheduler = ConversionScheduler::new(&factory, &config(), &image).unwrap();
        assert!(matches!(
            scheduler.run().await,
            Err(PipelineError::CollaboratorFailure { .. })
        ));
    }

    #[tokio::test]
    async fn backdrop_over_opaque_source_is_allowed() {
        let factory = ScriptedFactory::new(Script::Backdrop);
        let scheduler = ConversionScheduler::new(&factory, &config(), &opaque_image()).unwrap();
        assert!(matches!(
            scheduler.run().await,
            Ok(Conversion::Completed(_))
        ));
    }

    #[test]
    fn malformed_record_is_rejected() {
        let err =
            ConversionScheduler::from_record(&ScanlineEngineFactory, "{", &opaque_image()).unwrap_err();
        assert!(matches!(err, PipelineError::CollaboratorFailure { .. }));
    }
}
