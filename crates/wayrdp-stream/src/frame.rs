//! Capture-side value types

use std::time::SystemTime;

use tracing::{debug, warn};
use wayrdp_egfx::PixelSize;

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_size(size: PixelSize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width as i32,
            height: size.height as i32,
        }
    }

    pub const fn right(self) -> i32 {
        self.x + self.width
    }

    pub const fn bottom(self) -> i32 {
        self.y + self.height
    }

    pub const fn is_empty(self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub const fn area(self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Smallest rectangle containing both inputs; empty inputs are ignored.
    pub fn united(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }

        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Self {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    /// Overlap of both rectangles; empty (all-zero) when they do not meet.
    pub fn intersected(self, other: Self) -> Self {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= x || bottom <= y {
            return Self::default();
        }

        Self {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

/// One monitor in the streamed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMonitor {
    pub geometry: Rect,
    pub primary: bool,
}

/// Encoded H.264 packet as produced by the capture source.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub is_key_frame: bool,
}

/// Per-frame metadata emitted separately by the capture source.
///
/// Every field is independently optional; the pairer fills gaps from
/// session state.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub size: Option<PixelSize>,
    pub damage: Option<Vec<Rect>>,
    pub presentation_timestamp: Option<SystemTime>,
}

/// A fully described frame, ready for the submission queue.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub size: PixelSize,
    pub is_key_frame: bool,
    /// Non-overlapping damaged regions. Key frames are always treated as
    /// fully damaged regardless of this list.
    pub damage: Vec<Rect>,
    pub presentation_timestamp: Option<SystemTime>,
    pub monitors: Vec<VideoMonitor>,
}

/// What the capture source can deliver, probed once by the host.
///
/// Missing capabilities default to unsupported and the session falls back
/// to full-frame updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureCapabilities {
    /// The source emits a per-frame metadata callback.
    pub frame_metadata: bool,
    /// Metadata includes damage regions.
    pub damage_metadata: bool,
    /// The source encodes in full color range.
    pub full_color_range: bool,
}

impl CaptureCapabilities {
    /// Logs degraded modes, once, at session start.
    pub(crate) fn log_missing(&self) {
        if !self.frame_metadata || !self.damage_metadata {
            warn!("Capture source does not expose encoded damage metadata, using full-frame updates");
        }
        if !self.full_color_range {
            debug!("Capture source encodes in limited color range");
        }
    }
}
