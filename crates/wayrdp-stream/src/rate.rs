//! Frame rate and congestion control
//!
//! Every RTT update produces one frame-rate estimate from the measured
//! round trip, the client's decode backlog and the RTT trend. Estimates
//! are averaged over a trailing one-second window, and the requested rate
//! is recomputed from that average at most once per second: rising slowly,
//! falling fast under pressure.
//!
//! The controller also maintains the congestion quantization bias fed to
//! per-rectangle quality selection. The bias rises instantly with
//! congestion and drains one step per update.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const ESTIMATE_AVERAGE_PERIOD: Duration = Duration::from_secs(1);
const RATE_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(1);

const MIN_FRAME_RATE: f64 = 5.0;
const MAX_FRAME_RATE: f64 = 120.0;
pub const DEFAULT_FRAME_RATE: u32 = 60;

/// Fraction of the averaged estimate actually requested, leaving headroom
/// to clear the current load.
const TARGET_RATE_SATURATION: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
struct FrameRateEstimate {
    timestamp: Instant,
    estimate: f64,
}

/// Congestion inputs sampled from the acknowledgement state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CongestionSample {
    /// Frames emitted but not yet decoded by the client.
    pub delayed_frames: i64,
    pub queue_depth: u32,
}

/// Outcome of one controller tick.
#[derive(Debug, Clone, Copy)]
pub struct RateUpdate {
    /// New requested frame rate, present only when the value changed.
    pub requested_frame_rate: Option<u32>,
    pub congestion_qp_bias: u8,
}

#[derive(Debug)]
pub struct RateController {
    estimates: VecDeque<FrameRateEstimate>,
    last_estimation: Option<Instant>,
    requested_frame_rate: u32,
    congestion_qp_bias: u8,
    previous_rtt_ms: Option<f64>,
}

impl Default for RateController {
    fn default() -> Self {
        Self::new()
    }
}

impl RateController {
    pub fn new() -> Self {
        Self {
            estimates: VecDeque::new(),
            last_estimation: None,
            requested_frame_rate: DEFAULT_FRAME_RATE,
            congestion_qp_bias: 0,
            previous_rtt_ms: None,
        }
    }

    pub fn requested_frame_rate(&self) -> u32 {
        self.requested_frame_rate
    }

    pub fn congestion_qp_bias(&self) -> u8 {
        self.congestion_qp_bias
    }

    /// Feeds one RTT observation through the controller.
    pub fn handle_rtt_update(&mut self, rtt: Duration, sample: CongestionSample, now: Instant) -> RateUpdate {
        let rtt_ms = (rtt.as_secs_f64() * 1_000.0).max(1.0);
        let rtt_rise_ms = self
            .previous_rtt_ms
            .map_or(0.0, |previous| (rtt_ms - previous).max(0.0));
        self.previous_rtt_ms = Some(rtt_ms);

        let delayed_frames = sample.delayed_frames.max(0) as f64;

        let baseline = 1_000.0 / rtt_ms;
        let delay_penalty = 1.0 + 0.75 * delayed_frames;
        let queue_penalty = 1.0 + 0.25 * f64::from(sample.queue_depth.min(12));
        let trend_penalty = 1.0 + rtt_rise_ms.clamp(0.0, 20.0) / 20.0;

        let estimate = (baseline / (delay_penalty * queue_penalty * trend_penalty)).clamp(MIN_FRAME_RATE, MAX_FRAME_RATE);
        self.estimates.push_back(FrameRateEstimate {
            timestamp: now,
            estimate,
        });
        self.expire_estimates(now);

        self.update_bias(sample, rtt_rise_ms);

        RateUpdate {
            requested_frame_rate: self.recompute_rate(sample, rtt_rise_ms, now),
            congestion_qp_bias: self.congestion_qp_bias,
        }
    }

    fn expire_estimates(&mut self, now: Instant) {
        while let Some(front) = self.estimates.front() {
            if now.duration_since(front.timestamp) > ESTIMATE_AVERAGE_PERIOD {
                self.estimates.pop_front();
            } else {
                break;
            }
        }
    }

    /// The bias rises instantly but drains at one step per tick.
    fn update_bias(&mut self, sample: CongestionSample, rtt_rise_ms: f64) {
        let delayed = sample.delayed_frames;
        let depth = sample.queue_depth;

        let target = if delayed >= 6 || depth >= 8 || rtt_rise_ms >= 12.0 {
            8
        } else if delayed >= 3 || depth >= 5 || rtt_rise_ms >= 8.0 {
            5
        } else if delayed >= 1 || depth >= 2 || rtt_rise_ms >= 4.0 {
            2
        } else {
            0
        };

        self.congestion_qp_bias = if target >= self.congestion_qp_bias {
            target
        } else {
            self.congestion_qp_bias - 1
        };
    }

    fn recompute_rate(&mut self, sample: CongestionSample, rtt_rise_ms: f64, now: Instant) -> Option<u32> {
        if self
            .last_estimation
            .is_some_and(|last| now.duration_since(last) < RATE_RECOMPUTE_INTERVAL)
        {
            return None;
        }
        self.last_estimation = Some(now);

        let sum: f64 = self.estimates.iter().map(|e| e.estimate).sum();
        let average = sum / self.estimates.len().max(1) as f64;

        let mut target = (TARGET_RATE_SATURATION * average).clamp(MIN_FRAME_RATE, MAX_FRAME_RATE);

        // Hard clamps, most severe first.
        let delayed = sample.delayed_frames;
        let depth = sample.queue_depth;
        if delayed >= 8 || depth >= 10 {
            target = target.min(10.0);
        } else if delayed >= 4 || depth >= 6 {
            target = target.min(20.0);
        } else if delayed >= 2 || depth >= 3 {
            target = target.min(30.0);
        }
        if rtt_rise_ms >= 12.0 {
            target = target.min(24.0);
        } else if rtt_rise_ms >= 6.0 {
            target = target.min(36.0);
        }

        let target = target.round() as u32;
        let current = self.requested_frame_rate;

        let heavy_congestion = delayed >= 2 || depth >= 3 || rtt_rise_ms >= 8.0;
        let next = if target < current {
            if heavy_congestion {
                target
            } else {
                current.saturating_sub(5).max(target)
            }
        } else {
            (current + 2).min(target)
        };
        let next = next.clamp(MIN_FRAME_RATE as u32, MAX_FRAME_RATE as u32);

        if next != current {
            self.requested_frame_rate = next;
            Some(next)
        } else {
            None
        }
    }
}
