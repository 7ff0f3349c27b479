//! Frame-level emission policy
//!
//! Decides, for each dequeued frame, whether the shaped damage list goes
//! out as-is or is promoted to a single full-frame update, and assigns the
//! per-rectangle quantization metadata. Owns the refinement state machine:
//! after a burst of motion settles, one full-frame pass at the highest
//! fidelity sharpens the picture.

use std::time::{Duration, Instant};

use wayrdp_egfx::pdu::{QuantQuality, Rect16};

use crate::activity::ActivityGrid;
use crate::damage::to_rdp_rect;
use crate::frame::{Rect, VideoFrame};
use crate::quality::{select_quality, QualityContext};

/// Damage coverage at which a frame counts as high motion.
const HIGH_MOTION_COVERAGE: f64 = 0.15;
/// Rectangle count above which a frame counts as high motion.
const HIGH_MOTION_RECT_COUNT: usize = 8;
/// Coverage under which a pending refinement counts the frame as stable.
const STABLE_COVERAGE: f64 = 0.03;
const REFINEMENT_STABLE_FRAMES: u32 = 3;
/// Minimum spacing between refinement emissions.
const REFINEMENT_INTERVAL: Duration = Duration::from_millis(600);
/// Partial updates emitted before forcing a full-frame refresh.
const FULL_DAMAGE_REFRESH_FRAMES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefinementState {
    Idle,
    Pending,
    ReadyToSend,
}

/// Emission plan for one frame.
#[derive(Debug)]
pub struct FramePlan {
    pub rectangles: Vec<Rect16>,
    pub quant_quality: Vec<QuantQuality>,
    pub is_refinement: bool,
    pub full_frame: bool,
}

/// Per-session emission policy state, owned by the submission worker.
#[derive(Debug)]
pub struct FramePolicy {
    activity: ActivityGrid,
    refinement_state: RefinementState,
    stable_frames_since_motion: u32,
    last_refinement_time: Option<Instant>,
    frames_since_full_damage: u32,
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePolicy {
    pub fn new() -> Self {
        Self {
            activity: ActivityGrid::new(),
            refinement_state: RefinementState::Idle,
            stable_frames_since_motion: 0,
            last_refinement_time: None,
            frames_since_full_damage: 0,
        }
    }

    /// Plans the emission of one frame.
    ///
    /// `shaped` is the tracked damage list produced by the damage shaper;
    /// the activity grid is boosted with it even when the plan promotes the
    /// frame to full damage, so activity scores keep reflecting real motion.
    pub fn plan(
        &mut self,
        frame: &VideoFrame,
        shaped: &[Rect16],
        delayed_frames: i64,
        congestion_qp_bias: u8,
        now: Instant,
    ) -> FramePlan {
        let frame_area = frame.size.area();
        let damage_area: u64 = shaped.iter().map(|rect| rect.area()).sum();
        let coverage = if frame_area == 0 {
            0.0
        } else {
            damage_area as f64 / frame_area as f64
        };

        let high_motion = coverage >= HIGH_MOTION_COVERAGE || shaped.len() > HIGH_MOTION_RECT_COUNT;
        let is_refinement = self.update_refinement(high_motion, coverage, delayed_frames, frame.is_key_frame, now);

        let full_frame = frame.is_key_frame
            || is_refinement
            || coverage >= HIGH_MOTION_COVERAGE
            || delayed_frames >= 1
            || shaped.len() > HIGH_MOTION_RECT_COUNT
            || self.frames_since_full_damage >= FULL_DAMAGE_REFRESH_FRAMES;

        let rectangles = if full_frame {
            self.frames_since_full_damage = 0;
            vec![to_rdp_rect(Rect::from_size(frame.size))]
        } else {
            self.frames_since_full_damage += 1;
            shaped.to_vec()
        };

        self.activity.reset_if_size_changed(frame.size);
        self.activity.decay();

        let context = QualityContext {
            is_key_frame: frame.is_key_frame,
            is_refinement_frame: is_refinement,
            congestion_qp_bias,
        };
        let quant_quality = rectangles
            .iter()
            .map(|rect| select_quality(rect.area(), frame_area, self.activity.score(*rect), &context))
            .collect();

        self.activity.boost(shaped);

        FramePlan {
            rectangles,
            quant_quality,
            is_refinement,
            full_frame,
        }
    }

    fn update_refinement(
        &mut self,
        high_motion: bool,
        coverage: f64,
        delayed_frames: i64,
        is_key_frame: bool,
        now: Instant,
    ) -> bool {
        if self.refinement_state == RefinementState::ReadyToSend {
            if high_motion || delayed_frames >= 1 {
                // Motion resumed before the refinement went out.
                self.refinement_state = RefinementState::Pending;
                self.stable_frames_since_motion = 0;
                return false;
            }
            if !is_key_frame {
                self.refinement_state = RefinementState::Idle;
                self.last_refinement_time = Some(now);
                return true;
            }
            // A key frame already repaints everything at full coverage;
            // stay armed for the next delta frame.
            return false;
        }

        if high_motion || delayed_frames >= 1 {
            self.refinement_state = RefinementState::Pending;
            self.stable_frames_since_motion = 0;
            return false;
        }

        if self.refinement_state == RefinementState::Pending {
            if coverage <= STABLE_COVERAGE && delayed_frames == 0 {
                self.stable_frames_since_motion += 1;
            } else {
                self.stable_frames_since_motion = 0;
            }

            let cooled_down = self
                .last_refinement_time
                .map_or(true, |last| now.duration_since(last) >= REFINEMENT_INTERVAL);
            if self.stable_frames_since_motion >= REFINEMENT_STABLE_FRAMES && !is_key_frame && cooled_down {
                self.refinement_state = RefinementState::ReadyToSend;
            }
        }

        false
    }
}
