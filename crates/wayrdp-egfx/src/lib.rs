//! Server-side Graphics Pipeline Extension (MS-RDPEGFX) channel
//!
//! This crate carries H.264 video surfaces to RDP clients over the graphics
//! dynamic virtual channel:
//!
//! - [`pdu`]: wire types for the PDUs the server produces and consumes
//! - [`zgfx`]: RDP8 segment wrapping applied to every outgoing PDU
//! - [`server`]: the [`server::GraphicsPipelineServer`] channel processor
//!   handling capability negotiation, surface lifecycle, frame emission
//!   and acknowledgement bookkeeping
//!
//! # Message flow
//!
//! ```text
//! Client                                  Server
//!    |--- CapabilitiesAdvertise ------------>|  (codec selection)
//!    |<----------- CapabilitiesConfirm ------|
//!    |<----------- ResetGraphics ------------|
//!    |<----------- CreateSurface ------------|
//!    |<----------- MapSurfaceToOutput -------|
//!    |  (per frame)                          |
//!    |<----------- StartFrame ---------------|
//!    |<----------- WireToSurface1 -----------|  (AVC bitmap stream)
//!    |<----------- EndFrame -----------------|
//!    |--- FrameAcknowledge ----------------->|  (flow control)
//!    |--- QoeFrameAcknowledge -------------->|  (accepted, ignored)
//! ```

pub mod pdu;
pub mod server;
pub mod zgfx;

pub use server::{
    AvcFrame, CodecPreferences, FrameFlow, GraphicsPipelineHandler, GraphicsPipelineServer,
    NegotiationError, SelectedCodec, Surface,
};

/// Name of the graphics pipeline dynamic virtual channel.
pub const CHANNEL_NAME: &str = "Microsoft::Windows::RDS::Graphics";

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}
