//! ZGFX (RDP8) segment wrapping
//!
//! Every PDU sent on the graphics channel travels inside a ZGFX segment
//! structure (MS-RDPEGFX 2.2.1.1). H.264 payloads are already compressed,
//! so data is wrapped uncompressed: the flags byte carries the RDP8
//! compression type without the COMPRESSED bit, and the client consumes the
//! bytes directly.
//!
//! Single segment layout (data up to 65535 bytes):
//!
//! ```text
//! Descriptor (1 byte): 0xE0
//! Flags      (1 byte): 0x04 (RDP8 type, not compressed)
//! Data:                raw bytes
//! ```
//!
//! Larger data is split into multipart segments:
//!
//! ```text
//! Descriptor        (1 byte):     0xE1
//! SegmentCount      (2 bytes LE)
//! UncompressedSize  (4 bytes LE)
//! Per segment: Size (4 bytes LE, includes flags byte), Flags, Data
//! ```

use byteorder::{LittleEndian, WriteBytesExt as _};

const ZGFX_SEGMENTED_SINGLE: u8 = 0xE0;
const ZGFX_SEGMENTED_MULTIPART: u8 = 0xE1;

/// RDP8 compression type, lower four bits of the flags byte.
const ZGFX_PACKET_COMPR_TYPE_RDP8: u8 = 0x04;

/// Maximum data bytes carried by one segment.
pub const ZGFX_SEGMENTED_MAX_SIZE: usize = 65535;

/// Wrap channel PDU bytes in ZGFX segment structure, uncompressed.
pub fn wrap_uncompressed(data: &[u8]) -> Vec<u8> {
    if data.len() <= ZGFX_SEGMENTED_MAX_SIZE {
        wrap_single_segment(data)
    } else {
        wrap_multipart_segments(data)
    }
}

fn wrap_single_segment(data: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len() + 2);

    output.push(ZGFX_SEGMENTED_SINGLE);
    output.push(ZGFX_PACKET_COMPR_TYPE_RDP8);
    output.extend_from_slice(data);

    output
}

fn wrap_multipart_segments(data: &[u8]) -> Vec<u8> {
    let segment_count = data.len().div_ceil(ZGFX_SEGMENTED_MAX_SIZE);

    // Header: descriptor(1) + count(2) + uncompressed size(4);
    // per segment: size(4) + flags(1) + data.
    let mut output = Vec::with_capacity(data.len() + 7 + segment_count * 5);

    output.push(ZGFX_SEGMENTED_MULTIPART);

    output
        .write_u16::<LittleEndian>(segment_count as u16)
        .expect("write to Vec cannot fail");
    output
        .write_u32::<LittleEndian>(data.len() as u32)
        .expect("write to Vec cannot fail");

    for segment in data.chunks(ZGFX_SEGMENTED_MAX_SIZE) {
        // Segment size includes the flags byte.
        output
            .write_u32::<LittleEndian>(segment.len() as u32 + 1)
            .expect("write to Vec cannot fail");
        output.push(ZGFX_PACKET_COMPR_TYPE_RDP8);
        output.extend_from_slice(segment);
    }

    output
}
