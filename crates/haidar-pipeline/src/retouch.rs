//! Interactive mask retouching.
//!
//! A [`RetouchEngine`] paints corrections into the working buffer after
//! segmentation. Remove strokes fade alpha toward zero; restore strokes
//! blend every channel back toward the [original snapshot] captured
//! right after refinement. Restore can never push a pixel past its
//! snapshot value.
//!
//! The engine never owns the working buffer: each stroke borrows it
//! mutably for the duration of the call, so the buffer is updated
//! immediately for live feedback.
//!
//! [original snapshot]: RetouchEngine::set_snapshot

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::types::{PipelineError, PixelBuffer, Point, Resource};

/// Default brush radius in pixels.
pub const DEFAULT_BRUSH_RADIUS: u32 = 20;

/// Fraction of alpha removed at the brush centre.
const REMOVE_STRENGTH: f64 = 0.9;

/// What a stroke does to the pixels under the brush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrushMode {
    /// Fade alpha toward zero.
    #[default]
    Remove,
    /// Blend back toward the original snapshot.
    Restore,
}

/// Retouch session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetouchState {
    /// Strokes are ignored.
    #[default]
    Idle,
    /// Strokes paint with the given mode.
    Active(BrushMode),
}

/// Stateful brush compositor over the working buffer.
#[derive(Debug, Clone)]
pub struct RetouchEngine {
    state: RetouchState,
    mode: BrushMode,
    radius: u32,
    snapshot: Option<Rc<PixelBuffer>>,
    last_point: Option<Point>,
}

impl Default for RetouchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RetouchEngine {
    /// An idle engine with no snapshot and the default brush radius.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: RetouchState::Idle,
            mode: BrushMode::Remove,
            radius: DEFAULT_BRUSH_RADIUS,
            snapshot: None,
            last_point: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RetouchState {
        self.state
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, RetouchState::Active(_))
    }

    /// The mode the next activation will use.
    #[must_use]
    pub const fn mode(&self) -> BrushMode {
        self.mode
    }

    #[must_use]
    pub const fn radius(&self) -> u32 {
        self.radius
    }

    /// Set the brush radius. Values below 1 are raised to 1.
    pub fn set_radius(&mut self, radius: u32) {
        self.radius = radius.max(1);
    }

    /// The snapshot restore strokes blend toward, if one was captured.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&Rc<PixelBuffer>> {
        self.snapshot.as_ref()
    }

    /// Install the original snapshot for this retouch session.
    pub fn set_snapshot(&mut self, snapshot: Rc<PixelBuffer>) {
        self.snapshot = Some(snapshot);
    }

    /// Drop the snapshot and return to idle.
    ///
    /// Called when a fresh image replaces the working buffer.
    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
        self.state = RetouchState::Idle;
        self.last_point = None;
    }

    /// Flip between idle and active with the current mode.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] when activating
    /// without a snapshot. The state is left unchanged.
    pub fn toggle(&mut self) -> Result<RetouchState, PipelineError> {
        match self.state {
            RetouchState::Active(_) => {
                self.done();
                Ok(self.state)
            }
            RetouchState::Idle => self.activate(self.mode),
        }
    }

    /// Choose a brush mode, activating the engine if it is idle.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] without a snapshot.
    pub fn select_mode(&mut self, mode: BrushMode) -> Result<RetouchState, PipelineError> {
        self.activate(mode)
    }

    /// Return to idle. Returns whether the engine was active.
    pub fn done(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = RetouchState::Idle;
        self.last_point = None;
        was_active
    }

    fn activate(&mut self, mode: BrushMode) -> Result<RetouchState, PipelineError> {
        if self.snapshot.is_none() {
            return Err(PipelineError::ResourceUnavailable(Resource::OriginalSnapshot));
        }
        self.mode = mode;
        self.state = RetouchState::Active(mode);
        Ok(self.state)
    }

    /// Start a stroke with a single stamp at `at`.
    ///
    /// Returns `Ok(false)` without touching the buffer while idle.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceUnavailable`] if the snapshot is
    /// missing or its dimensions differ from `buffer`.
    pub fn begin_stroke(
        &mut self,
        buffer: &mut PixelBuffer,
        at: Point,
    ) -> Result<bool, PipelineError> {
        let RetouchState::Active(mode) = self.state else {
            return Ok(false);
        };
        let original = self.checked_snapshot(buffer)?;
        stamp(buffer, &original, at, self.radius, mode)?;
        self.last_point = Some(at);
        Ok(true)
    }

    /// Extend the stroke to `to`, stamping at unit intervals.
    ///
    /// The segment from the previous position is sampled with
    /// `ceil(max(|dx|, |dy|))` steps; the previous position itself was
    /// already stamped and is skipped. Without a previous position this
    /// behaves like [`begin_stroke`](Self::begin_stroke).
    ///
    /// # Errors
    ///
    /// Same as [`begin_stroke`](Self::begin_stroke).
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn continue_stroke(
        &mut self,
        buffer: &mut PixelBuffer,
        to: Point,
    ) -> Result<bool, PipelineError> {
        let RetouchState::Active(mode) = self.state else {
            return Ok(false);
        };
        let Some(from) = self.last_point else {
            return self.begin_stroke(buffer, to);
        };
        let original = self.checked_snapshot(buffer)?;

        let steps = (to.x - from.x).abs().max((to.y - from.y).abs()).ceil() as u32;
        for i in 1..=steps {
            let t = f64::from(i) / f64::from(steps);
            stamp(buffer, &original, from.lerp(to, t), self.radius, mode)?;
        }
        self.last_point = Some(to);
        Ok(true)
    }

    /// Finish the current stroke.
    pub const fn end_stroke(&mut self) {
        self.last_point = None;
    }

    fn checked_snapshot(&self, buffer: &PixelBuffer) -> Result<Rc<PixelBuffer>, PipelineError> {
        match &self.snapshot {
            Some(snapshot) if snapshot.dimensions() == buffer.dimensions() => {
                Ok(Rc::clone(snapshot))
            }
            _ => Err(PipelineError::ResourceUnavailable(Resource::OriginalSnapshot)),
        }
    }
}

/// Apply one brush stamp centred on the rounded position of `center`.
///
/// Every pixel within `radius` gets the quadratic falloff weight
/// `w = 1 − (d / radius)²`. Remove sets `alpha = floor(alpha · (1 − 0.9·w))`;
/// restore sets each channel to `round(orig · w + current · (1 − w))`.
/// Pixels outside the buffer are skipped.
///
/// # Errors
///
/// Returns [`PipelineError::ResourceUnavailable`] if `original` and
/// `buffer` differ in size. Nothing is modified in that case.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn stamp(
    buffer: &mut PixelBuffer,
    original: &PixelBuffer,
    center: Point,
    radius: u32,
    mode: BrushMode,
) -> Result<(), PipelineError> {
    if original.dimensions() != buffer.dimensions() {
        return Err(PipelineError::ResourceUnavailable(Resource::OriginalSnapshot));
    }

    let (width, height) = buffer.dimensions();
    let radius = i64::from(radius.max(1));
    let r = radius as f64;
    let cx = center.x.round() as i64;
    let cy = center.y.round() as i64;

    for dy in -radius..=radius {
        let y = cy + dy;
        if y < 0 || y >= i64::from(height) {
            continue;
        }
        for dx in -radius..=radius {
            let x = cx + dx;
            if x < 0 || x >= i64::from(width) {
                continue;
            }
            let d = (dx as f64).hypot(dy as f64);
            if d > r {
                continue;
            }
            let w = 1.0 - (d / r).powi(2);
            let (x, y) = (x as u32, y as u32);

            match mode {
                BrushMode::Remove => {
                    let pixel = buffer.get_pixel_mut(x, y);
                    let alpha = f64::from(pixel.0[3]);
                    pixel.0[3] = (alpha * REMOVE_STRENGTH.mul_add(-w, 1.0)).floor() as u8;
                }
                BrushMode::Restore => {
                    let orig = original.get_pixel(x, y).0;
                    let pixel = buffer.get_pixel_mut(x, y);
                    for (c, o) in pixel.0.iter_mut().zip(orig) {
                        *c = f64::from(o).mul_add(w, f64::from(*c) * (1.0 - w)).round() as u8;
                    }
                }
            }
        }
    }
    Ok(())
}
