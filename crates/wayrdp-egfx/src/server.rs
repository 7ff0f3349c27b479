//! Graphics pipeline channel server
//!
//! [`GraphicsPipelineServer`] owns the server side of the EGFX dynamic
//! virtual channel: it negotiates a codec from the client's advertised
//! capability sets, manages the single output surface, serializes frames
//! into `StartFrame` / `WireToSurface1` / `EndFrame` sequences and keeps
//! the acknowledgement bookkeeping that feeds frame pacing.
//!
//! Outgoing PDUs accumulate in an output queue and are drained as
//! pre-encoded, ZGFX-wrapped DVC messages; client messages arrive through
//! the [`DvcProcessor`] implementation.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ironrdp_core::{decode, impl_as_any, invalid_field_err, DecodeError, Encode, EncodeResult, WriteCursor};
use ironrdp_dvc::{DvcEncode, DvcMessage, DvcProcessor, DvcServerProcessor};
use ironrdp_pdu::gcc::{Monitor, MonitorFlags};
use ironrdp_pdu::{decode_err, PduResult};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::pdu::{
    Avc420BitmapStream, Avc444BitmapStream, Avc444Encoding, CapabilitiesAdvertisePdu, CapabilitiesConfirmPdu,
    CapabilitySet, Codec1Type, CreateSurfacePdu, EndFramePdu, FrameAcknowledgePdu, GfxCapsFlags, GfxPdu,
    MapSurfaceToOutputPdu, PixelFormat, QuantQuality, QueueDepth, Rect16, ResetGraphicsPdu, StartFramePdu, Timestamp,
    WireToSurface1Pdu, CAPVERSION_10, CAPVERSION_101, CAPVERSION_102, CAPVERSION_103, CAPVERSION_104, CAPVERSION_105,
    CAPVERSION_106, CAPVERSION_106_ERR, CAPVERSION_107, CAPVERSION_8, CAPVERSION_81,
};
use crate::{zgfx, PixelSize, CHANNEL_NAME};

/// Decoder queue depth stored when the client suspends acknowledgements.
const SUSPENDED_QUEUE_DEPTH: u32 = 16;

/// Wrapper around pre-encoded, ZGFX-wrapped channel bytes.
///
/// ZGFX wrapping happens in `drain_output()` where the queue is consumed;
/// this type carries the finished bytes through the `DvcMessage` interface.
struct ZgfxWrappedBytes {
    bytes: Vec<u8>,
    pdu_name: &'static str,
}

impl ZgfxWrappedBytes {
    fn new(bytes: Vec<u8>, pdu_name: &'static str) -> Self {
        Self { bytes, pdu_name }
    }
}

impl Encode for ZgfxWrappedBytes {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        dst.write_slice(&self.bytes);
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.pdu_name
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl DvcEncode for ZgfxWrappedBytes {}

/// The one live output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub id: u16,
    pub size: PixelSize,
}

/// Shared acknowledgement bookkeeping.
///
/// The submission worker inserts frame ids and bumps the encoded counter;
/// the transport thread erases ids and refreshes the delay and queue depth.
/// The counters are plain relaxed atomics: they only feed pacing heuristics.
#[derive(Debug, Default)]
pub struct FrameFlow {
    pending: Mutex<HashSet<u32>>,
    encoded_frames: AtomicI64,
    frame_delay: AtomicI64,
    decoder_queue_depth: AtomicU32,
}

impl FrameFlow {
    fn begin_frame(&self, frame_id: u32) {
        self.encoded_frames.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .expect("pending frame set poisoned")
            .insert(frame_id);
    }

    /// Applies a frame acknowledgement. Returns `false` for unknown ids.
    fn acknowledge(&self, ack: &FrameAcknowledgePdu) -> bool {
        let mut pending = self.pending.lock().expect("pending frame set poisoned");
        if !pending.contains(&ack.frame_id) {
            return false;
        }

        match ack.queue_depth {
            QueueDepth::Suspend => self.decoder_queue_depth.store(SUSPENDED_QUEUE_DEPTH, Ordering::Relaxed),
            QueueDepth::Available(depth) => self.decoder_queue_depth.store(depth, Ordering::Relaxed),
            QueueDepth::Unavailable => {}
        }

        let encoded = self.encoded_frames.load(Ordering::Relaxed);
        self.frame_delay
            .store(encoded - i64::from(ack.total_frames_decoded), Ordering::Relaxed);

        pending.remove(&ack.frame_id);
        true
    }

    /// Frames emitted but not yet decoded by the client.
    pub fn frame_delay(&self) -> i64 {
        self.frame_delay.load(Ordering::Relaxed)
    }

    pub fn decoder_queue_depth(&self) -> u32 {
        self.decoder_queue_depth.load(Ordering::Relaxed)
    }

    pub fn encoded_frames(&self) -> i64 {
        self.encoded_frames.load(Ordering::Relaxed)
    }

    pub fn is_pending(&self, frame_id: u32) -> bool {
        self.pending
            .lock()
            .expect("pending frame set poisoned")
            .contains(&frame_id)
    }
}

/// Codec carried inside `WireToSurface1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedCodec {
    Avc420,
    Avc444,
    Avc444v2,
}

impl SelectedCodec {
    fn codec_id(self) -> Codec1Type {
        match self {
            Self::Avc420 => Codec1Type::Avc420,
            Self::Avc444 => Codec1Type::Avc444,
            Self::Avc444v2 => Codec1Type::Avc444v2,
        }
    }
}

/// Session codec wishes, fixed at construction time.
///
/// The host process decides these once (its experimental switches and the
/// reach of the local encoding path); the channel only consults the booleans.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecPreferences {
    pub wants_avc444: bool,
    pub wants_avc444v2: bool,
    /// Whether the local encoder path can produce AVC444/AVC444v2 payloads.
    pub local_avc444_encoding: bool,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("client advertised no capability set supporting H.264 AVC420 in YUV420 mode")]
    NoCommonCodec,
}

/// Capability information derived from one advertised set.
#[derive(Debug, Clone)]
struct CapsInformation {
    version: u32,
    set: CapabilitySet,
    avc_supported: bool,
    yuv420_supported: bool,
    avc444_supported: bool,
    avc444v2_supported: bool,
}

fn version_name(version: u32) -> &'static str {
    match version {
        CAPVERSION_107 => "RDPGFX_CAPVERSION_107",
        CAPVERSION_106_ERR => "RDPGFX_CAPVERSION_106ERR",
        CAPVERSION_106 => "RDPGFX_CAPVERSION_106",
        CAPVERSION_105 => "RDPGFX_CAPVERSION_105",
        CAPVERSION_104 => "RDPGFX_CAPVERSION_104",
        CAPVERSION_103 => "RDPGFX_CAPVERSION_103",
        CAPVERSION_102 => "RDPGFX_CAPVERSION_102",
        CAPVERSION_101 => "RDPGFX_CAPVERSION_101",
        CAPVERSION_10 => "RDPGFX_CAPVERSION_10",
        CAPVERSION_81 => "RDPGFX_CAPVERSION_81",
        CAPVERSION_8 => "RDPGFX_CAPVERSION_8",
        _ => "UNKNOWN_VERSION",
    }
}

fn derive_caps_information(set: &CapabilitySet) -> CapsInformation {
    let flags = set.flags();
    let mut info = CapsInformation {
        version: set.version,
        set: set.clone(),
        avc_supported: false,
        yuv420_supported: false,
        avc444_supported: false,
        avc444v2_supported: false,
    };

    // Grouping is by numeric range so revisions between the known dwords
    // classify with their family.
    if (CAPVERSION_104..=CAPVERSION_107).contains(&info.version) {
        info.yuv420_supported = true;
        if !flags.contains(GfxCapsFlags::AVC_DISABLED) {
            info.avc_supported = true;
            info.avc444_supported = true;
            info.avc444v2_supported = true;
        }
    } else if (CAPVERSION_10..CAPVERSION_104).contains(&info.version) {
        if !flags.contains(GfxCapsFlags::AVC_DISABLED) {
            info.avc_supported = true;
            if info.version >= CAPVERSION_101 {
                info.avc444_supported = true;
                info.avc444v2_supported = true;
            }
        }
    } else if info.version == CAPVERSION_81 {
        if flags.contains(GfxCapsFlags::AVC420_ENABLED) {
            info.avc_supported = true;
            info.yuv420_supported = true;
        }
    }
    // CAPVERSION_8 and unknown versions: no H.264.

    info
}

fn supports_codec(info: &CapsInformation, codec: SelectedCodec) -> bool {
    match codec {
        SelectedCodec::Avc420 => info.avc_supported && info.yuv420_supported,
        SelectedCodec::Avc444 => info.avc444_supported,
        SelectedCodec::Avc444v2 => info.avc444v2_supported,
    }
}

fn negotiate(
    advertised: &[CapabilitySet],
    preferences: CodecPreferences,
) -> Result<(SelectedCodec, CapabilitySet), NegotiationError> {
    let information: Vec<CapsInformation> = advertised.iter().map(derive_caps_information).collect();

    debug!("Received caps:");
    for info in &information {
        debug!(
            "  {} AVC: {} YUV420: {} AVC444: {} AVC444v2: {}",
            version_name(info.version),
            info.avc_supported,
            info.yuv420_supported,
            info.avc444_supported,
            info.avc444v2_supported,
        );
    }

    let mut preferred = if preferences.wants_avc444v2 {
        SelectedCodec::Avc444v2
    } else if preferences.wants_avc444 {
        SelectedCodec::Avc444
    } else {
        SelectedCodec::Avc420
    };

    if preferred != SelectedCodec::Avc420 && !preferences.local_avc444_encoding {
        debug!("Local encoding cannot produce AVC444, downgrading to AVC420");
        preferred = SelectedCodec::Avc420;
    }

    for codec in [preferred, SelectedCodec::Avc420] {
        let winner = information
            .iter()
            .filter(|info| supports_codec(info, codec))
            .max_by_key(|info| info.version);

        if let Some(winner) = winner {
            debug!(codec = ?codec, "Selected caps: {}", version_name(winner.version));
            return Ok((codec, winner.set.clone()));
        }

        if codec == SelectedCodec::Avc420 {
            break;
        }
        debug!(codec = ?codec, "No advertised capset supports the preferred codec, retrying with AVC420");
    }

    Err(NegotiationError::NoCommonCodec)
}

/// Callbacks raised by the channel server.
pub trait GraphicsPipelineHandler: Send {
    /// Capability negotiation succeeded; the confirm is queued and frames
    /// may be submitted.
    fn ready(&mut self, codec: SelectedCodec);

    /// No advertised capability set supports even AVC420. The session
    /// should close with a video-initialization failure.
    fn initialization_failed(&mut self);

    /// A tracked frame was acknowledged by the client.
    fn frame_acknowledged(&mut self, _frame_id: u32) {}
}

/// One encoded H.264 frame ready for the wire, with its shaped damage.
#[derive(Debug, Clone, Copy)]
pub struct AvcFrame<'a> {
    pub data: &'a [u8],
    pub size: PixelSize,
    pub rectangles: &'a [Rect16],
    pub quant_quality: &'a [QuantQuality],
}

/// Server for the graphics pipeline virtual channel.
pub struct GraphicsPipelineServer {
    handler: Box<dyn GraphicsPipelineHandler>,
    preferences: CodecPreferences,

    flow: Arc<FrameFlow>,

    selected_codec: Option<SelectedCodec>,
    confirmed_caps: Option<CapabilitySet>,

    surface: Option<Surface>,
    next_surface_id: u16,
    next_frame_id: u32,
    pending_reset: bool,

    output_queue: VecDeque<GfxPdu>,
    channel_id: Option<u32>,
}

impl GraphicsPipelineServer {
    pub fn new(handler: Box<dyn GraphicsPipelineHandler>, preferences: CodecPreferences) -> Self {
        Self {
            handler,
            preferences,
            flow: Arc::new(FrameFlow::default()),
            selected_codec: None,
            confirmed_caps: None,
            surface: None,
            next_surface_id: 1,
            next_frame_id: 0,
            pending_reset: true,
            output_queue: VecDeque::new(),
            channel_id: None,
        }
    }

    /// Shared acknowledgement state, read by the pacing controller.
    pub fn frame_flow(&self) -> Arc<FrameFlow> {
        Arc::clone(&self.flow)
    }

    /// Whether capability negotiation has completed.
    pub fn is_ready(&self) -> bool {
        self.confirmed_caps.is_some()
    }

    pub fn selected_codec(&self) -> Option<SelectedCodec> {
        self.selected_codec
    }

    pub fn confirmed_capability(&self) -> Option<&CapabilitySet> {
        self.confirmed_caps.as_ref()
    }

    pub fn surface(&self) -> Option<Surface> {
        self.surface
    }

    pub fn channel_id(&self) -> Option<u32> {
        self.channel_id
    }

    /// Schedules the reset sequence before the next submitted frame.
    pub fn reset(&mut self) {
        self.pending_reset = true;
    }

    /// Serializes one frame into the output queue.
    ///
    /// Performs the pending reset sequence first when one is scheduled.
    /// Returns the assigned frame id, or `None` when the channel is not
    /// ready or the frame is degenerate.
    pub fn submit_frame(&mut self, frame: AvcFrame<'_>) -> Option<u32> {
        if !self.is_ready() {
            debug!("Graphics channel not ready, dropping frame");
            return None;
        }

        if frame.data.is_empty() || frame.size.is_empty() || frame.rectangles.is_empty() {
            return None;
        }

        if self.pending_reset {
            self.pending_reset = false;
            self.perform_reset(frame.size);
        }

        let surface = self.surface?;

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        self.flow.begin_frame(frame_id);

        let bitmap_data = match self.encode_bitmap_stream(&frame) {
            Ok(data) => data,
            Err(error) => {
                warn!(%error, "Failed to encode AVC bitmap stream, dropping frame");
                return None;
            }
        };

        let mut destination_rectangle = frame.rectangles[0];
        for rectangle in &frame.rectangles[1..] {
            destination_rectangle = destination_rectangle.union(*rectangle);
        }

        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        self.output_queue.push_back(GfxPdu::StartFrame(StartFramePdu {
            timestamp: Timestamp::from_epoch_millis(epoch_millis),
            frame_id,
        }));

        self.output_queue.push_back(GfxPdu::WireToSurface1(WireToSurface1Pdu {
            surface_id: surface.id,
            codec_id: self.selected_codec.unwrap_or(SelectedCodec::Avc420).codec_id(),
            pixel_format: PixelFormat::XRgb,
            destination_rectangle,
            bitmap_data,
        }));

        self.output_queue.push_back(GfxPdu::EndFrame(EndFramePdu { frame_id }));

        trace!(frame_id, rects = frame.rectangles.len(), "Queued frame");
        Some(frame_id)
    }

    fn encode_bitmap_stream(&self, frame: &AvcFrame<'_>) -> EncodeResult<Vec<u8>> {
        let stream1 = Avc420BitmapStream {
            rectangles: frame.rectangles,
            quant_quality: frame.quant_quality,
            data: frame.data,
        };

        match self.selected_codec.unwrap_or(SelectedCodec::Avc420) {
            SelectedCodec::Avc420 => encode_to_vec(&stream1),
            // The capture source hands over a single bitstream, so AVC444
            // frames carry the luma view only and the client reuses its
            // cached auxiliary view.
            SelectedCodec::Avc444 | SelectedCodec::Avc444v2 => encode_to_vec(&Avc444BitmapStream {
                encoding: Avc444Encoding::Luma,
                stream1,
                stream2: None,
            }),
        }
    }

    fn perform_reset(&mut self, size: PixelSize) {
        self.output_queue.push_back(GfxPdu::ResetGraphics(ResetGraphicsPdu {
            width: size.width,
            height: size.height,
            monitors: vec![Monitor {
                left: 0,
                top: 0,
                right: size.width as i32,
                bottom: size.height as i32,
                flags: MonitorFlags::PRIMARY,
            }],
        }));

        let surface_id = self.next_surface_id;
        self.next_surface_id = self.next_surface_id.wrapping_add(1);

        self.output_queue.push_back(GfxPdu::CreateSurface(CreateSurfacePdu {
            surface_id,
            width: size.width.min(u16::MAX as u32) as u16,
            height: size.height.min(u16::MAX as u32) as u16,
            pixel_format: PixelFormat::XRgb,
        }));

        self.surface = Some(Surface { id: surface_id, size });

        self.output_queue.push_back(GfxPdu::MapSurfaceToOutput(MapSurfaceToOutputPdu {
            surface_id,
            output_origin_x: 0,
            output_origin_y: 0,
        }));

        debug!(surface_id, width = size.width, height = size.height, "Reset graphics output");
    }

    /// Drains queued PDUs as ZGFX-wrapped DVC messages.
    pub fn drain_output(&mut self) -> Vec<DvcMessage> {
        let mut messages: Vec<DvcMessage> = Vec::with_capacity(self.output_queue.len());

        for pdu in self.output_queue.drain(..) {
            let pdu_name = match &pdu {
                GfxPdu::CapabilitiesConfirm(_) => "CapabilitiesConfirm",
                GfxPdu::ResetGraphics(_) => "ResetGraphics",
                GfxPdu::CreateSurface(_) => "CreateSurface",
                GfxPdu::MapSurfaceToOutput(_) => "MapSurfaceToOutput",
                GfxPdu::StartFrame(_) => "StartFrame",
                GfxPdu::WireToSurface1(_) => "WireToSurface1",
                GfxPdu::EndFrame(_) => "EndFrame",
                _ => "GfxPdu",
            };

            let encoded = match encode_to_vec(&pdu) {
                Ok(encoded) => encoded,
                Err(error) => {
                    warn!(%error, pdu_name, "Failed to encode GFX PDU, skipping");
                    continue;
                }
            };

            trace!(pdu_name, size = encoded.len(), "Draining GFX PDU");
            messages.push(Box::new(ZgfxWrappedBytes::new(zgfx::wrap_uncompressed(&encoded), pdu_name)));
        }

        messages
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output_queue.is_empty()
    }

    fn handle_capabilities_advertise(&mut self, pdu: CapabilitiesAdvertisePdu) -> Result<(), NegotiationError> {
        let (codec, winning_set) = negotiate(&pdu.0, self.preferences)?;

        self.selected_codec = Some(codec);
        self.confirmed_caps = Some(winning_set.clone());

        // The winning set is echoed verbatim.
        self.output_queue
            .push_back(GfxPdu::CapabilitiesConfirm(CapabilitiesConfirmPdu(winning_set)));

        self.handler.ready(codec);
        Ok(())
    }

    fn handle_frame_acknowledge(&mut self, pdu: FrameAcknowledgePdu) {
        if !self.flow.acknowledge(&pdu) {
            warn!(frame_id = pdu.frame_id, "Got frame acknowledge for an unknown frame");
            return;
        }

        trace!(
            frame_id = pdu.frame_id,
            frame_delay = self.flow.frame_delay(),
            "Frame acknowledged"
        );
        self.handler.frame_acknowledged(pdu.frame_id);
    }
}

impl_as_any!(GraphicsPipelineServer);

impl DvcProcessor for GraphicsPipelineServer {
    fn channel_name(&self) -> &str {
        CHANNEL_NAME
    }

    fn start(&mut self, channel_id: u32) -> PduResult<Vec<DvcMessage>> {
        self.channel_id = Some(channel_id);
        debug!(channel_id, "Graphics channel started");
        // Nothing to send until the client advertises its capabilities.
        Ok(vec![])
    }

    fn close(&mut self, _channel_id: u32) {
        debug!("Graphics channel closed");
        self.confirmed_caps = None;
        self.selected_codec = None;
        self.pending_reset = true;
    }

    fn process(&mut self, _channel_id: u32, payload: &[u8]) -> PduResult<Vec<DvcMessage>> {
        let pdu = decode(payload).map_err(|e| decode_err!(e))?;

        match pdu {
            GfxPdu::CapabilitiesAdvertise(pdu) => {
                if let Err(error) = self.handle_capabilities_advertise(pdu) {
                    warn!(%error, "Capability negotiation failed");
                    self.handler.initialization_failed();
                    let field_err: DecodeError = invalid_field_err!("capsSets", "no capability set supports AVC420");
                    return Err(decode_err!(field_err));
                }
            }
            GfxPdu::FrameAcknowledge(pdu) => {
                self.handle_frame_acknowledge(pdu);
            }
            GfxPdu::QoeFrameAcknowledge(pdu) => {
                // Accepted for protocol completeness; the metrics are unused.
                trace!(?pdu, "Ignoring QoE frame acknowledge");
            }
            _ => {
                warn!(?pdu, "Unhandled client GFX PDU");
            }
        }

        Ok(self.drain_output())
    }
}

impl DvcServerProcessor for GraphicsPipelineServer {}

fn encode_to_vec<T: Encode>(value: &T) -> EncodeResult<Vec<u8>> {
    let mut buf = vec![0u8; value.size()];
    let mut cursor = WriteCursor::new(&mut buf);
    value.encode(&mut cursor)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[derive(Default)]
    struct Events {
        ready: Mutex<Option<SelectedCodec>>,
        init_failed: AtomicBool,
        acked: Mutex<Vec<u32>>,
    }

    struct TestHandler(Arc<Events>);

    impl GraphicsPipelineHandler for TestHandler {
        fn ready(&mut self, codec: SelectedCodec) {
            *self.0.ready.lock().unwrap() = Some(codec);
        }

        fn initialization_failed(&mut self) {
            self.0.init_failed.store(true, Ordering::Relaxed);
        }

        fn frame_acknowledged(&mut self, frame_id: u32) {
            self.0.acked.lock().unwrap().push(frame_id);
        }
    }

    fn server_with(preferences: CodecPreferences) -> (GraphicsPipelineServer, Arc<Events>) {
        let events = Arc::new(Events::default());
        let server = GraphicsPipelineServer::new(Box::new(TestHandler(Arc::clone(&events))), preferences);
        (server, events)
    }

    fn advertise(server: &mut GraphicsPipelineServer, sets: Vec<CapabilitySet>) -> PduResult<Vec<DvcMessage>> {
        let payload = encode_to_vec(&GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu(sets))).unwrap();
        server.process(0, &payload)
    }

    fn acknowledge(server: &mut GraphicsPipelineServer, frame_id: u32, decoded: u32, queue_depth: QueueDepth) {
        let payload = encode_to_vec(&GfxPdu::FrameAcknowledge(FrameAcknowledgePdu {
            queue_depth,
            frame_id,
            total_frames_decoded: decoded,
        }))
        .unwrap();
        server.process(0, &payload).unwrap();
    }

    fn message_bytes(message: &DvcMessage) -> Vec<u8> {
        let mut buf = vec![0u8; message.size()];
        let mut cursor = WriteCursor::new(&mut buf);
        message.encode(&mut cursor).unwrap();
        buf
    }

    fn wrapped_cmd_id(message: &DvcMessage) -> u16 {
        let bytes = message_bytes(message);
        // Skip the two-byte ZGFX single-segment wrapper.
        assert_eq!(bytes[0], 0xE0);
        u16::from_le_bytes([bytes[2], bytes[3]])
    }

    fn test_frame<'a>(data: &'a [u8], rects: &'a [Rect16], quants: &'a [QuantQuality]) -> AvcFrame<'a> {
        AvcFrame {
            data,
            size: PixelSize::new(1920, 1080),
            rectangles: rects,
            quant_quality: quants,
        }
    }

    const FULL_RECT: Rect16 = Rect16 {
        left: 0,
        top: 0,
        right: 1920,
        bottom: 1080,
    };
    const DEFAULT_QUANT: QuantQuality = QuantQuality {
        qp: 22,
        p: false,
        quality: 100,
    };

    #[test]
    fn negotiates_avc420_from_version_81() {
        let (mut server, events) = server_with(CodecPreferences::default());

        let advertised = CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED);
        let messages = advertise(&mut server, vec![advertised.clone()]).unwrap();

        assert_eq!(*events.ready.lock().unwrap(), Some(SelectedCodec::Avc420));
        assert_eq!(server.selected_codec(), Some(SelectedCodec::Avc420));
        assert_eq!(server.confirmed_capability(), Some(&advertised));
        assert!(server.is_ready());

        // The confirm is on the wire, ZGFX wrapped.
        assert_eq!(messages.len(), 1);
        assert_eq!(wrapped_cmd_id(&messages[0]), 0x0013);

        // Confirm payload echoes the advertised set verbatim.
        let bytes = message_bytes(&messages[0]);
        let version = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        assert_eq!(version, CAPVERSION_81);
    }

    #[test]
    fn downgrades_to_avc420_without_local_avc444() {
        let (mut server, events) = server_with(CodecPreferences {
            wants_avc444: true,
            wants_avc444v2: false,
            local_avc444_encoding: false,
        });

        advertise(
            &mut server,
            vec![
                CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED),
                CapabilitySet::new(CAPVERSION_105, GfxCapsFlags::empty()),
            ],
        )
        .unwrap();

        assert_eq!(*events.ready.lock().unwrap(), Some(SelectedCodec::Avc420));
        // Highest-version AVC420-capable set wins.
        assert_eq!(server.confirmed_capability().map(|set| set.version), Some(CAPVERSION_105));
    }

    #[test]
    fn selects_avc444v2_when_wanted_and_supported() {
        let (mut server, _) = server_with(CodecPreferences {
            wants_avc444: true,
            wants_avc444v2: true,
            local_avc444_encoding: true,
        });

        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_107, GfxCapsFlags::empty())]).unwrap();

        assert_eq!(server.selected_codec(), Some(SelectedCodec::Avc444v2));
    }

    #[test]
    fn falls_back_to_avc420_when_preferred_codec_unsupported() {
        let (mut server, _) = server_with(CodecPreferences {
            wants_avc444: true,
            wants_avc444v2: false,
            local_avc444_encoding: true,
        });

        // V8.1 supports AVC420 only.
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        assert_eq!(server.selected_codec(), Some(SelectedCodec::Avc420));
    }

    #[test]
    fn fails_negotiation_without_avc_support() {
        let (mut server, events) = server_with(CodecPreferences::default());

        let result = advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_8, GfxCapsFlags::SMALL_CACHE)]);

        assert!(result.is_err());
        assert!(events.init_failed.load(Ordering::Relaxed));
        assert!(!server.is_ready());
        assert!(!server.has_pending_output());
    }

    #[test]
    fn first_frame_emits_reset_sequence() {
        let (mut server, _) = server_with(CodecPreferences::default());
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        let data = [0x42u8; 16];
        let frame_id = server
            .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
            .unwrap();
        assert_eq!(frame_id, 0);

        let messages = server.drain_output();
        let cmd_ids: Vec<u16> = messages.iter().map(wrapped_cmd_id).collect();
        // ResetGraphics, CreateSurface, MapSurfaceToOutput, then the frame.
        assert_eq!(cmd_ids, vec![0x000e, 0x0009, 0x000f, 0x000b, 0x0001, 0x000c]);

        assert_eq!(server.surface().map(|s| s.id), Some(1));
        assert!(server.flow.is_pending(0));

        // The reset sequence is one-shot.
        let second = server
            .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
            .unwrap();
        assert_eq!(second, 1);
        let cmd_ids: Vec<u16> = server.drain_output().iter().map(wrapped_cmd_id).collect();
        assert_eq!(cmd_ids, vec![0x000b, 0x0001, 0x000c]);
    }

    #[test]
    fn frame_ids_strictly_increase() {
        let (mut server, _) = server_with(CodecPreferences::default());
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        let data = [0u8; 8];
        let mut last = None;
        for _ in 0..5 {
            let id = server
                .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
                .unwrap();
            if let Some(previous) = last {
                assert!(id > previous);
            }
            last = Some(id);
        }
    }

    #[test]
    fn acknowledge_updates_flow_state() {
        let (mut server, events) = server_with(CodecPreferences::default());
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        let data = [0u8; 8];
        for _ in 0..3 {
            server
                .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
                .unwrap();
        }

        let flow = server.frame_flow();
        acknowledge(&mut server, 1, 2, QueueDepth::Available(4));

        assert!(!flow.is_pending(1));
        assert!(flow.is_pending(0));
        assert_eq!(flow.frame_delay(), 1); // 3 encoded - 2 decoded
        assert_eq!(flow.decoder_queue_depth(), 4);
        assert_eq!(*events.acked.lock().unwrap(), vec![1]);
    }

    #[test]
    fn suspend_sentinel_saturates_queue_depth() {
        let (mut server, _) = server_with(CodecPreferences::default());
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        let data = [0u8; 8];
        server
            .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
            .unwrap();

        let flow = server.frame_flow();
        acknowledge(&mut server, 0, 1, QueueDepth::Suspend);
        assert_eq!(flow.decoder_queue_depth(), SUSPENDED_QUEUE_DEPTH);
    }

    #[test]
    fn unavailable_queue_depth_keeps_previous_value() {
        let (mut server, _) = server_with(CodecPreferences::default());
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        let data = [0u8; 8];
        server
            .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
            .unwrap();
        server
            .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
            .unwrap();

        let flow = server.frame_flow();
        acknowledge(&mut server, 0, 1, QueueDepth::Available(7));
        acknowledge(&mut server, 1, 2, QueueDepth::Unavailable);
        assert_eq!(flow.decoder_queue_depth(), 7);
    }

    #[test]
    fn stray_acknowledge_is_tolerated() {
        let (mut server, events) = server_with(CodecPreferences::default());
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_81, GfxCapsFlags::AVC420_ENABLED)]).unwrap();

        acknowledge(&mut server, 99, 1, QueueDepth::Available(1));
        assert!(events.acked.lock().unwrap().is_empty());
    }

    #[test]
    fn avc444_frames_carry_lc_header() {
        let (mut server, _) = server_with(CodecPreferences {
            wants_avc444: true,
            wants_avc444v2: false,
            local_avc444_encoding: true,
        });
        advertise(&mut server, vec![CapabilitySet::new(CAPVERSION_107, GfxCapsFlags::empty())]).unwrap();
        assert_eq!(server.selected_codec(), Some(SelectedCodec::Avc444));

        let data = [0u8; 8];
        server
            .submit_frame(test_frame(&data, &[FULL_RECT], &[DEFAULT_QUANT]))
            .unwrap();

        let messages = server.drain_output();
        let wire_to_surface = &messages[4];
        assert_eq!(wrapped_cmd_id(wire_to_surface), 0x0001);

        let bytes = message_bytes(wire_to_surface);
        // 2 (zgfx) + 8 (header) + 13 (fixed fields) = bitmap data offset.
        let codec_id = u16::from_le_bytes([bytes[2 + 8 + 2], bytes[2 + 8 + 3]]);
        assert_eq!(codec_id, 0x000e);
        let info = u32::from_le_bytes([bytes[23], bytes[24], bytes[25], bytes[26]]);
        assert_eq!(info >> 30, 1); // luma-only view
    }
}
