//! Per-rectangle encoding quality
//!
//! Picks the quantization parameter and quality level for one damage
//! rectangle from its frame coverage, the recent activity of the region
//! and the current congestion bias. Small static regions stay crisp,
//! busy regions give up fidelity first when the network tightens.

use wayrdp_egfx::pdu::QuantQuality;

const QP_MIN: i32 = 10;
const QP_MAX: i32 = 40;
const QUALITY_MIN: i32 = 70;
const QUALITY_MAX: i32 = 100;

/// Coverage below which a rectangle counts as a small UI update.
const TINY_COVERAGE: f64 = 0.03;
const MODERATE_COVERAGE: f64 = 0.20;

/// Frame-level inputs shared by every rectangle of one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityContext {
    pub is_key_frame: bool,
    pub is_refinement_frame: bool,
    /// Additive QP offset applied under network pressure.
    pub congestion_qp_bias: u8,
}

/// Quantization and quality for one rectangle.
pub fn select_quality(rect_area: u64, frame_area: u64, activity_score: u32, context: &QualityContext) -> QuantQuality {
    if context.is_key_frame || frame_area == 0 {
        return quant(22, 100);
    }

    if context.is_refinement_frame {
        // Highest-fidelity pass over a stabilized scene.
        return quant(16, 100);
    }

    let coverage = rect_area as f64 / frame_area as f64;

    let (mut qp, mut quality): (i32, i32) = if coverage <= TINY_COVERAGE {
        (18, 100)
    } else if coverage <= MODERATE_COVERAGE {
        (21, 92)
    } else {
        (22, 90)
    };

    if activity_score <= 2 && coverage <= MODERATE_COVERAGE {
        // Static region bonus.
        qp -= 3;
        quality += 8;
    }

    if activity_score >= 8 {
        qp += 3;
        quality -= 8;
        if activity_score >= 16 {
            qp += 2;
            quality -= 6;
        }
    }

    // Tiny rectangles only take half the congestion bias.
    let applied_bias = if coverage <= TINY_COVERAGE {
        i32::from(context.congestion_qp_bias) / 2
    } else {
        i32::from(context.congestion_qp_bias)
    };
    qp += applied_bias;
    quality -= 2 * applied_bias;

    quant(
        qp.clamp(QP_MIN, QP_MAX) as u8,
        quality.clamp(QUALITY_MIN, QUALITY_MAX) as u8,
    )
}

fn quant(qp: u8, quality: u8) -> QuantQuality {
    QuantQuality { qp, p: false, quality }
}
