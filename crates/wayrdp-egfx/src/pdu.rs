//! Wire types for the graphics pipeline channel
//!
//! Every PDU is prefixed with an `RDPGFX_HEADER` (cmdId, flags, length).
//! Only the PDUs this server produces or consumes are modelled: the server
//! encodes the surface/frame PDUs and decodes the three client messages
//! (CapabilitiesAdvertise, FrameAcknowledge, QoeFrameAcknowledge).
//!
//! Capability sets are kept generic as `{version, data}` so the winning set
//! can be confirmed back to the client byte for byte.

use core::fmt;

use bit_field::BitField as _;
use bitflags::bitflags;
use ironrdp_core::{
    ensure_fixed_part_size, invalid_field_err, Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor,
};
use ironrdp_pdu::gcc::Monitor;
use ironrdp_pdu::{cast_length, ensure_size, write_padding};

const RDPGFX_CMDID_WIRETOSURFACE_1: u16 = 0x0001;
const RDPGFX_CMDID_CREATESURFACE: u16 = 0x0009;
const RDPGFX_CMDID_STARTFRAME: u16 = 0x000b;
const RDPGFX_CMDID_ENDFRAME: u16 = 0x000c;
const RDPGFX_CMDID_FRAMEACKNOWLEDGE: u16 = 0x000d;
const RDPGFX_CMDID_RESETGRAPHICS: u16 = 0x000e;
const RDPGFX_CMDID_MAPSURFACETOOUTPUT: u16 = 0x000f;
const RDPGFX_CMDID_CAPSADVERTISE: u16 = 0x0012;
const RDPGFX_CMDID_CAPSCONFIRM: u16 = 0x0013;
const RDPGFX_CMDID_QOEFRAMEACKNOWLEDGE: u16 = 0x0016;

/// `RDPGFX_RESET_GRAPHICS_PDU` is zero-padded to a fixed 340 bytes on the
/// wire, header included.
const RESET_GRAPHICS_PDU_SIZE: usize = 340 - GfxPdu::FIXED_PART_SIZE;

/// Capability set version dwords (`RDPGFX_CAPVERSION_*`).
pub const CAPVERSION_8: u32 = 0x0008_0004;
pub const CAPVERSION_81: u32 = 0x0008_0105;
pub const CAPVERSION_10: u32 = 0x000A_0002;
pub const CAPVERSION_101: u32 = 0x000A_0100;
pub const CAPVERSION_102: u32 = 0x000A_0200;
pub const CAPVERSION_103: u32 = 0x000A_0301;
pub const CAPVERSION_104: u32 = 0x000A_0400;
pub const CAPVERSION_105: u32 = 0x000A_0502;
pub const CAPVERSION_106: u32 = 0x000A_0600;
pub const CAPVERSION_106_ERR: u32 = 0x000A_0601;
pub const CAPVERSION_107: u32 = 0x000A_0701;

/// Graphics pipeline message (PDU prefixed with `RDPGFX_HEADER`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GfxPdu {
    WireToSurface1(WireToSurface1Pdu),
    CreateSurface(CreateSurfacePdu),
    StartFrame(StartFramePdu),
    EndFrame(EndFramePdu),
    FrameAcknowledge(FrameAcknowledgePdu),
    ResetGraphics(ResetGraphicsPdu),
    MapSurfaceToOutput(MapSurfaceToOutputPdu),
    CapabilitiesAdvertise(CapabilitiesAdvertisePdu),
    CapabilitiesConfirm(CapabilitiesConfirmPdu),
    QoeFrameAcknowledge(QoeFrameAcknowledgePdu),
}

impl GfxPdu {
    const NAME: &'static str = "RDPGFX_HEADER";

    const FIXED_PART_SIZE: usize = 2 /* CmdId */ + 2 /* Flags */ + 4 /* Length */;
}

impl Encode for GfxPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        let (cmd_id, payload_length) = match self {
            GfxPdu::WireToSurface1(pdu) => (RDPGFX_CMDID_WIRETOSURFACE_1, pdu.size()),
            GfxPdu::CreateSurface(pdu) => (RDPGFX_CMDID_CREATESURFACE, pdu.size()),
            GfxPdu::StartFrame(pdu) => (RDPGFX_CMDID_STARTFRAME, pdu.size()),
            GfxPdu::EndFrame(pdu) => (RDPGFX_CMDID_ENDFRAME, pdu.size()),
            GfxPdu::FrameAcknowledge(pdu) => (RDPGFX_CMDID_FRAMEACKNOWLEDGE, pdu.size()),
            GfxPdu::ResetGraphics(pdu) => (RDPGFX_CMDID_RESETGRAPHICS, pdu.size()),
            GfxPdu::MapSurfaceToOutput(pdu) => (RDPGFX_CMDID_MAPSURFACETOOUTPUT, pdu.size()),
            GfxPdu::CapabilitiesAdvertise(pdu) => (RDPGFX_CMDID_CAPSADVERTISE, pdu.size()),
            GfxPdu::CapabilitiesConfirm(pdu) => (RDPGFX_CMDID_CAPSCONFIRM, pdu.size()),
            GfxPdu::QoeFrameAcknowledge(pdu) => (RDPGFX_CMDID_QOEFRAMEACKNOWLEDGE, pdu.size()),
        };

        dst.write_u16(cmd_id);
        dst.write_u16(0); // flags
        dst.write_u32(cast_length!("Length", payload_length + Self::FIXED_PART_SIZE)?);

        match self {
            GfxPdu::WireToSurface1(pdu) => pdu.encode(dst),
            GfxPdu::CreateSurface(pdu) => pdu.encode(dst),
            GfxPdu::StartFrame(pdu) => pdu.encode(dst),
            GfxPdu::EndFrame(pdu) => pdu.encode(dst),
            GfxPdu::FrameAcknowledge(pdu) => pdu.encode(dst),
            GfxPdu::ResetGraphics(pdu) => pdu.encode(dst),
            GfxPdu::MapSurfaceToOutput(pdu) => pdu.encode(dst),
            GfxPdu::CapabilitiesAdvertise(pdu) => pdu.encode(dst),
            GfxPdu::CapabilitiesConfirm(pdu) => pdu.encode(dst),
            GfxPdu::QoeFrameAcknowledge(pdu) => pdu.encode(dst),
        }
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        let payload_length = match self {
            GfxPdu::WireToSurface1(pdu) => pdu.size(),
            GfxPdu::CreateSurface(pdu) => pdu.size(),
            GfxPdu::StartFrame(pdu) => pdu.size(),
            GfxPdu::EndFrame(pdu) => pdu.size(),
            GfxPdu::FrameAcknowledge(pdu) => pdu.size(),
            GfxPdu::ResetGraphics(pdu) => pdu.size(),
            GfxPdu::MapSurfaceToOutput(pdu) => pdu.size(),
            GfxPdu::CapabilitiesAdvertise(pdu) => pdu.size(),
            GfxPdu::CapabilitiesConfirm(pdu) => pdu.size(),
            GfxPdu::QoeFrameAcknowledge(pdu) => pdu.size(),
        };

        Self::FIXED_PART_SIZE + payload_length
    }
}

impl<'de> Decode<'de> for GfxPdu {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let cmd_id = src.read_u16();
        let _flags = src.read_u16();
        let _length = src.read_u32();

        // The server only ever receives the client-side messages.
        match cmd_id {
            RDPGFX_CMDID_CAPSADVERTISE => Ok(GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu::decode(src)?)),
            RDPGFX_CMDID_FRAMEACKNOWLEDGE => Ok(GfxPdu::FrameAcknowledge(FrameAcknowledgePdu::decode(src)?)),
            RDPGFX_CMDID_QOEFRAMEACKNOWLEDGE => Ok(GfxPdu::QoeFrameAcknowledge(QoeFrameAcknowledgePdu::decode(src)?)),
            _ => Err(invalid_field_err!("cmdId", "unexpected GFX PDU from client")),
        }
    }
}

/// Rectangle in surface coordinates, right/bottom exclusive (`RDPGFX_RECT16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect16 {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl Rect16 {
    const NAME: &'static str = "GfxRect16";

    const FIXED_PART_SIZE: usize = 4 * 2;

    pub const fn width(self) -> u16 {
        self.right.saturating_sub(self.left)
    }

    pub const fn height(self) -> u16 {
        self.bottom.saturating_sub(self.top)
    }

    pub const fn area(self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(self, other: Self) -> Self {
        Self {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

impl Encode for Rect16 {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u16(self.left);
        dst.write_u16(self.top);
        dst.write_u16(self.right);
        dst.write_u16(self.bottom);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// `RDPGFX_PIXELFORMAT`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    XRgb = 0x20,
    ARgb = 0x21,
}

/// Bitmap codecs usable with `WireToSurface1` (`RDPGFX_CODECID_*`).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec1Type {
    Avc420 = 0x000b,
    Avc444 = 0x000e,
    Avc444v2 = 0x000f,
}

/// Per-rectangle H.264 quantization metadata (`RDPGFX_H264_QUANT_QUALITY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantQuality {
    /// Quantization parameter, 0..=51 in 6 bits.
    pub qp: u8,
    /// Progressively encoded flag.
    pub p: bool,
    /// Quality level, 0..=100.
    pub quality: u8,
}

impl QuantQuality {
    const NAME: &'static str = "GfxQuantQuality";

    const FIXED_PART_SIZE: usize = 2;
}

impl Encode for QuantQuality {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        let mut qp_val = self.qp & 0x3f;
        qp_val.set_bit(7, self.p);
        dst.write_u8(qp_val);
        dst.write_u8(self.quality);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// `RFX_AVC420_BITMAP_STREAM`: region metadata followed by the H.264 payload.
pub struct Avc420BitmapStream<'a> {
    pub rectangles: &'a [Rect16],
    pub quant_quality: &'a [QuantQuality],
    pub data: &'a [u8],
}

impl fmt::Debug for Avc420BitmapStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Avc420BitmapStream")
            .field("rectangles", &self.rectangles)
            .field("quant_quality", &self.quant_quality)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl Avc420BitmapStream<'_> {
    const NAME: &'static str = "Avc420BitmapStream";

    const FIXED_PART_SIZE: usize = 4 /* numRegionRects */;
}

impl Encode for Avc420BitmapStream<'_> {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u32(cast_length!("numRegionRects", self.rectangles.len())?);
        for rectangle in self.rectangles {
            rectangle.encode(dst)?;
        }
        for quant in self.quant_quality {
            quant.encode(dst)?;
        }
        dst.write_slice(self.data);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
            + self.rectangles.len() * Rect16::FIXED_PART_SIZE
            + self.quant_quality.len() * QuantQuality::FIXED_PART_SIZE
            + self.data.len()
    }
}

/// LC field of `RFX_AVC444_BITMAP_STREAM`: which views the payload carries.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Avc444Encoding {
    /// Both luma and chroma views present.
    LumaAndChroma = 0,
    /// Luma view only; the client reuses its cached chroma view.
    Luma = 1,
    /// Chroma view only.
    Chroma = 2,
}

/// `RFX_AVC444_BITMAP_STREAM` / `RFX_AVC444V2_BITMAP_STREAM`
///
/// Both v1 and v2 share this container layout; they differ only in how the
/// encoder packed the chroma planes.
#[derive(Debug)]
pub struct Avc444BitmapStream<'a> {
    pub encoding: Avc444Encoding,
    pub stream1: Avc420BitmapStream<'a>,
    pub stream2: Option<Avc420BitmapStream<'a>>,
}

impl Avc444BitmapStream<'_> {
    const NAME: &'static str = "Avc444BitmapStream";

    const FIXED_PART_SIZE: usize = 4 /* avc420EncodedBitstreamInfo */;
}

impl Encode for Avc444BitmapStream<'_> {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        // cbAvc420EncodedBitstream1 in the low 30 bits, LC in the top two.
        let stream1_length: u32 = cast_length!("cbAvc420EncodedBitstream1", self.stream1.size())?;
        dst.write_u32(stream1_length | (self.encoding as u32) << 30);

        self.stream1.encode(dst)?;
        if let Some(stream2) = &self.stream2 {
            stream2.encode(dst)?;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.stream1.size() + self.stream2.as_ref().map_or(0, |s| s.size())
    }
}

/// 2.2.2.1 `RDPGFX_WIRE_TO_SURFACE_PDU_1`
#[derive(Clone, PartialEq, Eq)]
pub struct WireToSurface1Pdu {
    pub surface_id: u16,
    pub codec_id: Codec1Type,
    pub pixel_format: PixelFormat,
    pub destination_rectangle: Rect16,
    pub bitmap_data: Vec<u8>,
}

impl fmt::Debug for WireToSurface1Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireToSurface1Pdu")
            .field("surface_id", &self.surface_id)
            .field("codec_id", &self.codec_id)
            .field("pixel_format", &self.pixel_format)
            .field("destination_rectangle", &self.destination_rectangle)
            .field("bitmap_data_len", &self.bitmap_data.len())
            .finish()
    }
}

impl WireToSurface1Pdu {
    const NAME: &'static str = "WireToSurface1Pdu";

    const FIXED_PART_SIZE: usize = 2 /* SurfaceId */ + 2 /* CodecId */ + 1 /* PixelFormat */ + 8 /* DestRect */;
}

impl Encode for WireToSurface1Pdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u16(self.surface_id);
        dst.write_u16(self.codec_id as u16);
        dst.write_u8(self.pixel_format as u8);
        self.destination_rectangle.encode(dst)?;
        dst.write_slice(&self.bitmap_data);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.bitmap_data.len()
    }
}

/// 2.2.2.9 `RDPGFX_CREATE_SURFACE_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSurfacePdu {
    pub surface_id: u16,
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
}

impl CreateSurfacePdu {
    const NAME: &'static str = "CreateSurfacePdu";

    const FIXED_PART_SIZE: usize = 2 /* SurfaceId */ + 2 /* Width */ + 2 /* Height */ + 1 /* PixelFormat */;
}

impl Encode for CreateSurfacePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u16(self.surface_id);
        dst.write_u16(self.width);
        dst.write_u16(self.height);
        dst.write_u8(self.pixel_format as u8);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// 2.2.2.11 `RDPGFX_START_FRAME_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFramePdu {
    pub timestamp: Timestamp,
    pub frame_id: u32,
}

impl StartFramePdu {
    const NAME: &'static str = "StartFramePdu";

    const FIXED_PART_SIZE: usize = Timestamp::FIXED_PART_SIZE + 4 /* FrameId */;
}

impl Encode for StartFramePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        self.timestamp.encode(dst)?;
        dst.write_u32(self.frame_id);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// Wall-clock time of day packed into 32 bits:
/// `hours << 22 | minutes << 16 | seconds << 10 | milliseconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub milliseconds: u16,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u16,
}

impl Timestamp {
    const NAME: &'static str = "GfxTimestamp";

    const FIXED_PART_SIZE: usize = 4;

    /// Time of day derived from a Unix-epoch millisecond count (UTC).
    pub fn from_epoch_millis(epoch_millis: u64) -> Self {
        let ms_of_day = epoch_millis % 86_400_000;

        Self {
            milliseconds: (ms_of_day % 1_000) as u16,
            seconds: ((ms_of_day / 1_000) % 60) as u8,
            minutes: ((ms_of_day / 60_000) % 60) as u8,
            hours: (ms_of_day / 3_600_000) as u16,
        }
    }
}

impl Encode for Timestamp {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        let mut timestamp: u32 = 0;

        timestamp.set_bits(..10, u32::from(self.milliseconds));
        timestamp.set_bits(10..16, u32::from(self.seconds));
        timestamp.set_bits(16..22, u32::from(self.minutes));
        timestamp.set_bits(22.., u32::from(self.hours));

        dst.write_u32(timestamp);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// 2.2.2.12 `RDPGFX_END_FRAME_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndFramePdu {
    pub frame_id: u32,
}

impl EndFramePdu {
    const NAME: &'static str = "EndFramePdu";

    const FIXED_PART_SIZE: usize = 4;
}

impl Encode for EndFramePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u32(self.frame_id);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// 2.2.2.13 `RDPGFX_FRAME_ACKNOWLEDGE_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameAcknowledgePdu {
    pub queue_depth: QueueDepth,
    pub frame_id: u32,
    pub total_frames_decoded: u32,
}

impl FrameAcknowledgePdu {
    const NAME: &'static str = "FrameAcknowledgePdu";

    const FIXED_PART_SIZE: usize = 4 /* QueueDepth */ + 4 /* FrameId */ + 4 /* TotalFramesDecoded */;
}

impl Encode for FrameAcknowledgePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u32(self.queue_depth.to_u32());
        dst.write_u32(self.frame_id);
        dst.write_u32(self.total_frames_decoded);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

impl<'a> Decode<'a> for FrameAcknowledgePdu {
    fn decode(src: &mut ReadCursor<'a>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let queue_depth = QueueDepth::from_u32(src.read_u32());
        let frame_id = src.read_u32();
        let total_frames_decoded = src.read_u32();

        Ok(Self {
            queue_depth,
            frame_id,
            total_frames_decoded,
        })
    }
}

/// Decoded frame queue depth reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepth {
    /// `QUEUE_DEPTH_UNAVAILABLE`: the client does not track its queue.
    Unavailable,
    Available(u32),
    /// `SUSPEND_FRAME_ACKNOWLEDGEMENT`: the client stops acknowledging.
    Suspend,
}

impl QueueDepth {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x0000_0000 => Self::Unavailable,
            0xFFFF_FFFF => Self::Suspend,
            _ => Self::Available(value),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Unavailable => 0x0000_0000,
            Self::Available(value) => value,
            Self::Suspend => 0xFFFF_FFFF,
        }
    }
}

/// 2.2.2.14 `RDPGFX_RESET_GRAPHICS_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetGraphicsPdu {
    pub width: u32,
    pub height: u32,
    pub monitors: Vec<Monitor>,
}

impl ResetGraphicsPdu {
    const NAME: &'static str = "ResetGraphicsPdu";

    const FIXED_PART_SIZE: usize = 4 /* Width */ + 4 /* Height */ + 4 /* MonitorCount */;

    fn padding_size(&self) -> usize {
        RESET_GRAPHICS_PDU_SIZE - Self::FIXED_PART_SIZE - self.monitors.iter().map(|m| m.size()).sum::<usize>()
    }
}

impl Encode for ResetGraphicsPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u32(self.width);
        dst.write_u32(self.height);
        dst.write_u32(cast_length!("MonitorCount", self.monitors.len())?);

        for monitor in &self.monitors {
            monitor.encode(dst)?;
        }

        write_padding!(dst, self.padding_size());

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        RESET_GRAPHICS_PDU_SIZE
    }
}

/// 2.2.2.15 `RDPGFX_MAP_SURFACE_TO_OUTPUT_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSurfaceToOutputPdu {
    pub surface_id: u16,
    pub output_origin_x: u32,
    pub output_origin_y: u32,
}

impl MapSurfaceToOutputPdu {
    const NAME: &'static str = "MapSurfaceToOutputPdu";

    const FIXED_PART_SIZE: usize = 2 /* SurfaceId */ + 2 /* Reserved */ + 4 /* OriginX */ + 4 /* OriginY */;
}

impl Encode for MapSurfaceToOutputPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u16(self.surface_id);
        dst.write_u16(0); // reserved
        dst.write_u32(self.output_origin_x);
        dst.write_u32(self.output_origin_y);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

bitflags! {
    /// Flag bits appearing in `RDPGFX_CAPSET` data across versions.
    ///
    /// The same bit positions keep their meaning in every version that
    /// defines them, so one set covers the whole family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfxCapsFlags: u32 {
        const THIN_CLIENT = 0x01;
        const SMALL_CACHE = 0x02;
        const AVC420_ENABLED = 0x10;
        const AVC_DISABLED = 0x20;
        const AVC_THIN_CLIENT = 0x40;
    }
}

/// 2.2.1.6 `RDPGFX_CAPSET`
///
/// Kept generic: the version dword plus the raw capability data. The
/// confirmed set is echoed back to the client exactly as advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    pub version: u32,
    pub data: Vec<u8>,
}

impl CapabilitySet {
    const NAME: &'static str = "GfxCapabilitySet";

    const FIXED_PART_SIZE: usize = 4 /* Version */ + 4 /* CapsDataLength */;

    pub fn new(version: u32, flags: GfxCapsFlags) -> Self {
        Self {
            version,
            data: flags.bits().to_le_bytes().to_vec(),
        }
    }

    /// Flag bits from the first dword of the capability data; versions with
    /// no flag dword (or none advertised) read as empty.
    pub fn flags(&self) -> GfxCapsFlags {
        match self.data.first_chunk::<4>() {
            Some(bytes) => GfxCapsFlags::from_bits_truncate(u32::from_le_bytes(*bytes)),
            None => GfxCapsFlags::empty(),
        }
    }
}

impl Encode for CapabilitySet {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u32(self.version);
        dst.write_u32(cast_length!("CapsDataLength", self.data.len())?);
        dst.write_slice(&self.data);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.data.len()
    }
}

impl<'a> Decode<'a> for CapabilitySet {
    fn decode(src: &mut ReadCursor<'a>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let version = src.read_u32();
        let data_length: usize = cast_length!("CapsDataLength", src.read_u32())?;

        ensure_size!(in: src, size: data_length);
        let data = src.read_slice(data_length).to_vec();

        Ok(Self { version, data })
    }
}

/// 2.2.2.18 `RDPGFX_CAPS_ADVERTISE_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitiesAdvertisePdu(pub Vec<CapabilitySet>);

impl CapabilitiesAdvertisePdu {
    const NAME: &'static str = "CapabilitiesAdvertisePdu";

    const FIXED_PART_SIZE: usize = 2 /* Count */;
}

impl Encode for CapabilitiesAdvertisePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u16(cast_length!("Count", self.0.len())?);

        for capability_set in &self.0 {
            capability_set.encode(dst)?;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.0.iter().map(|c| c.size()).sum::<usize>()
    }
}

impl<'a> Decode<'a> for CapabilitiesAdvertisePdu {
    fn decode(src: &mut ReadCursor<'a>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let count: usize = cast_length!("Count", src.read_u16())?;

        let mut capability_sets = Vec::with_capacity(count.min(32));
        for _ in 0..count {
            capability_sets.push(CapabilitySet::decode(src)?);
        }

        Ok(Self(capability_sets))
    }
}

/// 2.2.2.19 `RDPGFX_CAPS_CONFIRM_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitiesConfirmPdu(pub CapabilitySet);

impl CapabilitiesConfirmPdu {
    const NAME: &'static str = "CapabilitiesConfirmPdu";
}

impl Encode for CapabilitiesConfirmPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        self.0.encode(dst)
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        self.0.size()
    }
}

/// 2.2.2.21 `RDPGFX_QOE_FRAME_ACKNOWLEDGE_PDU`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QoeFrameAcknowledgePdu {
    pub frame_id: u32,
    pub timestamp: u32,
    pub time_diff_se: u16,
    pub time_diff_dr: u16,
}

impl QoeFrameAcknowledgePdu {
    const NAME: &'static str = "QoeFrameAcknowledgePdu";

    const FIXED_PART_SIZE: usize = 4 /* FrameId */ + 4 /* Timestamp */ + 2 /* TimeDiffSE */ + 2 /* TimeDiffEDR */;
}

impl Encode for QoeFrameAcknowledgePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u32(self.frame_id);
        dst.write_u32(self.timestamp);
        dst.write_u16(self.time_diff_se);
        dst.write_u16(self.time_diff_dr);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

impl<'a> Decode<'a> for QoeFrameAcknowledgePdu {
    fn decode(src: &mut ReadCursor<'a>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let frame_id = src.read_u32();
        let timestamp = src.read_u32();
        let time_diff_se = src.read_u16();
        let time_diff_dr = src.read_u16();

        Ok(Self {
            frame_id,
            timestamp,
            time_diff_se,
            time_diff_dr,
        })
    }
}
