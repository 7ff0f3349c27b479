//! Damage shaping
//!
//! Translates arbitrary damage regions into the bounded, clipped rectangle
//! list the graphics channel accepts. Oversized or degenerate input is
//! repaired to a single full-frame rectangle rather than rejected.

use wayrdp_egfx::pdu::Rect16;
use wayrdp_egfx::PixelSize;

use crate::frame::Rect;

/// Target rectangle count after coalescing.
const MAX_COALESCED_DAMAGE_RECTS: usize = 64;
/// Above this count the region degrades to a full-frame update.
const MAX_DAMAGE_RECT_COUNT: usize = 128;
const MAX_RDP_COORDINATE: i32 = u16::MAX as i32;

/// Clamps a rectangle into the RDP coordinate domain.
///
/// A side that clipping would collapse is widened back to a one-pixel span
/// so the output is never degenerate.
pub fn to_rdp_rect(rect: Rect) -> Rect16 {
    let left = rect.x.clamp(0, MAX_RDP_COORDINATE);
    let top = rect.y.clamp(0, MAX_RDP_COORDINATE);
    let mut right = rect.right().clamp(0, MAX_RDP_COORDINATE);
    let mut bottom = rect.bottom().clamp(0, MAX_RDP_COORDINATE);

    if right <= left {
        right = (left + 1).min(MAX_RDP_COORDINATE);
    }
    if bottom <= top {
        bottom = (top + 1).min(MAX_RDP_COORDINATE);
    }

    Rect16 {
        left: left as u16,
        top: top as u16,
        right: right as u16,
        bottom: bottom as u16,
    }
}

/// Shapes a damage region into the channel rectangle list.
///
/// Returns an empty vector only for an empty frame size, in which case the
/// caller drops the frame. Otherwise the result is non-empty, clipped to
/// the frame and at most [`MAX_DAMAGE_RECT_COUNT`] entries long.
pub fn shape_damage(damage: &[Rect], size: PixelSize, is_key_frame: bool) -> Vec<Rect16> {
    if size.is_empty() {
        return Vec::new();
    }

    let bounds = Rect::from_size(size);
    let full_rect = to_rdp_rect(bounds);

    if is_key_frame || damage.is_empty() {
        return vec![full_rect];
    }

    let mut rects: Vec<Rect> = damage
        .iter()
        .map(|rect| rect.intersected(bounds))
        .filter(|rect| !rect.is_empty())
        .collect();

    if rects.is_empty() || rects.len() > MAX_DAMAGE_RECT_COUNT {
        return vec![full_rect];
    }

    // Merge nearby rectangles to bound metadata overhead while preserving
    // partial updates. First fit: join the first pair whose union grows the
    // covered area by at most half.
    let mut merged = true;
    while merged && rects.len() > MAX_COALESCED_DAMAGE_RECTS {
        merged = false;
        'scan: for i in 0..rects.len() - 1 {
            for j in i + 1..rects.len() {
                let joined = rects[i].united(rects[j]);
                if joined.area() * 2 <= (rects[i].area() + rects[j].area()) * 3 {
                    rects[i] = joined;
                    rects.remove(j);
                    merged = true;
                    break 'scan;
                }
            }
        }
    }

    if rects.len() > MAX_DAMAGE_RECT_COUNT {
        return vec![full_rect];
    }

    let mut shaped = Vec::with_capacity(rects.len());
    for rect in rects {
        let bounded = rect.intersected(bounds);
        if bounded.is_empty() {
            continue;
        }
        shaped.push(to_rdp_rect(bounded));
    }

    if shaped.is_empty() {
        shaped.push(full_rect);
    }

    shaped
}
