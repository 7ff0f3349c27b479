//! Adaptive H.264 video streaming core
//!
//! Turns encoded packets from a capture source into a paced stream of
//! graphics-channel frames, continuously adapting frame rate and per-region
//! quality to what the network and the client decoder can absorb.
//!
//! **Video path:** capture source → [`pairer`] (packet ↔ metadata) →
//! [`session`] worker → [`policy`] (damage + quality) → `wayrdp-egfx`
//! emitter → RDP client. Acknowledgements and RTT updates flow back through
//! [`rate`] into pacing and the congestion quantization bias.
//!
//! The crate is transport- and capture-agnostic: hosts connect a capture
//! source, a network detector and a message sink through the traits in
//! [`session`].

pub mod activity;
pub mod damage;
pub mod frame;
pub mod pairer;
pub mod policy;
pub mod quality;
pub mod rate;
pub mod session;

pub use frame::{CaptureCapabilities, FrameMetadata, Packet, Rect, VideoFrame, VideoMonitor};
pub use session::{
    CaptureSourceControl, CloseReason, GfxServerHandle, GfxSink, NetworkDetection, SessionError, VideoStream,
    VideoStreamConfig,
};

/// Graphics channel layer (convenience re-export).
pub use wayrdp_egfx as egfx;
pub use wayrdp_egfx::{CodecPreferences, PixelSize, SelectedCodec};
