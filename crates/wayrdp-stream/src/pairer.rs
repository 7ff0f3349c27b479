//! Encoded-packet ↔ metadata pairing
//!
//! The capture source emits encoded packets and, when it supports it, a
//! separate per-frame metadata callback carrying size, damage and the
//! presentation timestamp. The two arrive on the same thread but not in
//! lockstep, so packets wait briefly for their metadata and degrade to a
//! full-frame update when it never shows up.
//!
//! Pairing is strictly FIFO: metadata is never matched with a later packet.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;
use wayrdp_egfx::PixelSize;

use crate::frame::{FrameMetadata, Packet, Rect, VideoFrame, VideoMonitor};

const MAX_PENDING_FRAME_METADATA: usize = 128;
const MAX_PENDING_PACKETS_WITHOUT_METADATA: usize = 8;
/// How long a packet may wait for its metadata before going out full-frame.
const METADATA_PAIR_WAIT_BUDGET: Duration = Duration::from_millis(12);
const MISS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct PendingPacket {
    packet: Packet,
    queued_at: Instant,
}

#[derive(Debug, Default)]
struct PairerInner {
    packets: VecDeque<PendingPacket>,
    metadata: VecDeque<FrameMetadata>,
    metadata_signal_available: bool,
    metadata_seen: bool,
    last_miss_log: Option<Instant>,
    frame_size: PixelSize,
    monitors: Vec<VideoMonitor>,
}

/// Pairs encoded packets with their per-frame metadata.
///
/// All methods take the current monotonic instant from the caller so tests
/// can drive the wait budget deterministically.
#[derive(Debug, Default)]
pub struct MetadataPairer {
    inner: Mutex<PairerInner>,
}

impl MetadataPairer {
    pub fn new(metadata_signal_available: bool) -> Self {
        Self {
            inner: Mutex::new(PairerInner {
                metadata_signal_available,
                ..PairerInner::default()
            }),
        }
    }

    /// Records the frame size used for full-frame fallbacks.
    pub fn set_frame_size(&self, size: PixelSize) {
        self.inner.lock().expect("pairer state poisoned").frame_size = size;
    }

    pub fn set_monitor_layout(&self, monitors: Vec<VideoMonitor>) {
        self.inner.lock().expect("pairer state poisoned").monitors = monitors;
    }

    /// Drops buffered packets and metadata, e.g. when the source restarts.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("pairer state poisoned");
        inner.packets.clear();
        inner.metadata.clear();
        inner.metadata_seen = false;
        inner.last_miss_log = None;
    }

    /// Queues a packet and returns every frame that became emittable.
    pub fn handle_packet(&self, packet: Packet, now: Instant) -> Vec<VideoFrame> {
        let mut inner = self.inner.lock().expect("pairer state poisoned");
        inner.packets.push_back(PendingPacket { packet, queued_at: now });
        drain(&mut inner, now)
    }

    /// Queues metadata and returns every frame that became emittable.
    pub fn handle_metadata(&self, metadata: FrameMetadata, now: Instant) -> Vec<VideoFrame> {
        let mut inner = self.inner.lock().expect("pairer state poisoned");
        inner.metadata.push_back(metadata);
        while inner.metadata.len() > MAX_PENDING_FRAME_METADATA {
            inner.metadata.pop_front();
        }
        inner.metadata_seen = true;
        drain(&mut inner, now)
    }
}

fn drain(inner: &mut PairerInner, now: Instant) -> Vec<VideoFrame> {
    let mut emitted = Vec::new();

    while let Some(head) = inner.packets.front() {
        let head_is_key_frame = head.packet.is_key_frame;
        let head_queued_at = head.queued_at;

        if !inner.metadata.is_empty() {
            let packet = inner.packets.pop_front().map(|pending| pending.packet);
            let metadata = inner.metadata.pop_front();
            if let Some(packet) = packet {
                emitted.push(build_frame(inner, packet, metadata.as_ref()));
            }
            continue;
        }

        let send_without_metadata = !inner.metadata_signal_available || !inner.metadata_seen || head_is_key_frame;
        if send_without_metadata {
            if let Some(pending) = inner.packets.pop_front() {
                emitted.push(build_frame(inner, pending.packet, None));
            }
            continue;
        }

        let waited_too_long = now.duration_since(head_queued_at) >= METADATA_PAIR_WAIT_BUDGET;
        let queue_too_deep = inner.packets.len() > MAX_PENDING_PACKETS_WITHOUT_METADATA;
        if waited_too_long || queue_too_deep {
            if inner.last_miss_log.map_or(true, |last| now.duration_since(last) >= MISS_LOG_INTERVAL) {
                debug!("No matching damage metadata for encoded packet, using full-frame update");
                inner.last_miss_log = Some(now);
            }
            if let Some(pending) = inner.packets.pop_front() {
                emitted.push(build_frame(inner, pending.packet, None));
            }
            continue;
        }

        // Leave the packet queued briefly so late metadata can still pair.
        break;
    }

    emitted
}

fn full_frame_damage(size: PixelSize) -> Vec<Rect> {
    if size.is_empty() {
        Vec::new()
    } else {
        vec![Rect::from_size(size)]
    }
}

fn clipped_damage(damage: &[Rect], size: PixelSize) -> Vec<Rect> {
    if size.is_empty() {
        return Vec::new();
    }

    let bounds = Rect::from_size(size);
    let clipped: Vec<Rect> = damage
        .iter()
        .map(|rect| rect.intersected(bounds))
        .filter(|rect| !rect.is_empty())
        .collect();

    if clipped.is_empty() {
        full_frame_damage(size)
    } else {
        clipped
    }
}

fn build_frame(inner: &PairerInner, packet: Packet, metadata: Option<&FrameMetadata>) -> VideoFrame {
    let mut frame = VideoFrame {
        size: inner.frame_size,
        data: packet.data,
        is_key_frame: packet.is_key_frame,
        monitors: inner.monitors.clone(),
        damage: full_frame_damage(inner.frame_size),
        presentation_timestamp: Some(SystemTime::now()),
    };

    if frame.monitors.is_empty() && !frame.size.is_empty() {
        frame.monitors.push(VideoMonitor {
            geometry: Rect::from_size(frame.size),
            primary: true,
        });
    }

    let mut damage_applied = false;
    if let Some(metadata) = metadata {
        if let Some(size) = metadata.size {
            if !size.is_empty() {
                frame.size = size;
            }
        }
        if let Some(timestamp) = metadata.presentation_timestamp {
            frame.presentation_timestamp = Some(timestamp);
        }
        if let Some(damage) = &metadata.damage {
            frame.damage = clipped_damage(damage, frame.size);
            damage_applied = true;
        }
    }

    if !damage_applied || frame.is_key_frame || frame.damage.is_empty() {
        frame.damage = full_frame_damage(frame.size);
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: PixelSize = PixelSize::new(1280, 720);

    fn packet(tag: u8, key: bool) -> Packet {
        Packet {
            data: vec![tag],
            is_key_frame: key,
        }
    }

    fn metadata_with_damage(damage: Vec<Rect>) -> FrameMetadata {
        FrameMetadata {
            size: Some(SIZE),
            damage: Some(damage),
            presentation_timestamp: None,
        }
    }

    fn pairer() -> MetadataPairer {
        let pairer = MetadataPairer::new(true);
        pairer.set_frame_size(SIZE);
        pairer
    }

    #[test]
    fn pairs_fifo_in_arrival_order() {
        let pairer = pairer();
        let now = Instant::now();

        assert!(pairer.handle_metadata(metadata_with_damage(vec![Rect::new(0, 0, 8, 8)]), now).is_empty());

        let first = pairer.handle_packet(packet(1, false), now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].data, vec![1]);
        assert_eq!(first[0].damage, vec![Rect::new(0, 0, 8, 8)]);

        // Second packet must wait for second metadata.
        assert!(pairer.handle_packet(packet(2, false), now).is_empty());
        let second = pairer.handle_metadata(metadata_with_damage(vec![Rect::new(8, 8, 8, 8)]), now);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, vec![2]);
        assert_eq!(second[0].damage, vec![Rect::new(8, 8, 8, 8)]);
    }

    #[test]
    fn emits_immediately_without_metadata_signal() {
        let pairer = MetadataPairer::new(false);
        pairer.set_frame_size(SIZE);

        let frames = pairer.handle_packet(packet(1, false), Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].size, SIZE);
        assert_eq!(frames[0].damage, vec![Rect::from_size(SIZE)]);
    }

    #[test]
    fn emits_immediately_before_first_metadata() {
        // The signal exists but has not fired yet.
        let pairer = pairer();
        let frames = pairer.handle_packet(packet(1, false), Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].damage, vec![Rect::from_size(SIZE)]);
    }

    #[test]
    fn key_frames_never_wait() {
        let pairer = pairer();
        let now = Instant::now();
        pairer.handle_metadata(metadata_with_damage(vec![Rect::new(0, 0, 4, 4)]), now);
        pairer.handle_packet(packet(1, false), now);

        let frames = pairer.handle_packet(packet(2, true), now);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_key_frame);
        // Key frames force full-frame damage even when metadata paired.
        assert_eq!(frames[0].damage, vec![Rect::from_size(SIZE)]);
    }

    #[test]
    fn wait_budget_expires_to_full_frame() {
        let pairer = pairer();
        let start = Instant::now();
        // Metadata flow established, then stalls.
        pairer.handle_metadata(metadata_with_damage(vec![Rect::new(0, 0, 4, 4)]), start);
        pairer.handle_packet(packet(1, false), start);

        assert!(pairer.handle_packet(packet(2, false), start).is_empty());

        let later = start + Duration::from_millis(13);
        let frames = pairer.handle_packet(packet(3, false), later);
        // Both waited past the budget.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![2]);
        assert_eq!(frames[0].damage, vec![Rect::from_size(SIZE)]);
    }

    #[test]
    fn deep_packet_queue_flushes_without_metadata() {
        let pairer = pairer();
        let now = Instant::now();
        pairer.handle_metadata(metadata_with_damage(vec![Rect::new(0, 0, 4, 4)]), now);
        pairer.handle_packet(packet(0, false), now);

        let mut emitted = 0;
        for i in 1..=9 {
            emitted += pairer.handle_packet(packet(i, false), now).len();
        }
        // The tenth enqueue pushes the queue over its depth bound.
        assert!(emitted > 0);
    }

    #[test]
    fn metadata_queue_is_bounded() {
        let pairer = pairer();
        let now = Instant::now();
        for i in 0..200 {
            pairer.handle_metadata(metadata_with_damage(vec![Rect::new(i, 0, 1, 1)]), now);
        }

        // Oldest metadata was dropped; the head of the queue pairs next.
        let frames = pairer.handle_packet(packet(1, false), now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].damage, vec![Rect::new(72, 0, 1, 1)]);
    }

    #[test]
    fn no_metadata_frame_uses_last_known_size() {
        let pairer = MetadataPairer::new(false);
        pairer.set_frame_size(PixelSize::new(800, 600));
        pairer.set_frame_size(SIZE);

        let frames = pairer.handle_packet(packet(1, false), Instant::now());
        assert_eq!(frames[0].size, SIZE);
        assert!(frames[0].presentation_timestamp.is_some());
    }

    #[test]
    fn metadata_without_damage_forces_full_frame() {
        let pairer = pairer();
        let now = Instant::now();
        pairer.handle_metadata(
            FrameMetadata {
                size: Some(SIZE),
                damage: None,
                presentation_timestamp: None,
            },
            now,
        );

        let frames = pairer.handle_packet(packet(1, false), now);
        assert_eq!(frames[0].damage, vec![Rect::from_size(SIZE)]);
    }

    #[test]
    fn synthesizes_primary_monitor_when_layout_missing() {
        let pairer = pairer();
        let frames = pairer.handle_packet(packet(1, true), Instant::now());
        assert_eq!(frames[0].monitors.len(), 1);
        assert!(frames[0].monitors[0].primary);
        assert_eq!(frames[0].monitors[0].geometry, Rect::from_size(SIZE));
    }
}
