//! MJPEG RTP packetization (RFC 2435).
//!
//! Each RTP packet carries an 8-byte main JPEG header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Type-specific |              Fragment Offset                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Type     |       Q       |     Width     |     Height    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The first packet of a frame additionally carries a 4-byte
//! quantization-table header (MBZ, precision, length=128) followed by
//! the 128-byte luminance+chrominance tables; later fragments carry only
//! the main header. Width and height travel in 8-pixel blocks. The
//! marker bit is set on the frame's last packet.

use bytes::Bytes;

use super::{MTU, RTP_HEADER_LEN};
use super::rtp::RtpWriter;

/// Main JPEG header length.
const MAIN_HEADER_LEN: usize = 8;
/// Quantization-table header length (first packet only).
const QTABLE_HEADER_LEN: usize = 4;

/// JPEG type field carried in every packet.
const JPEG_TYPE: u8 = 1;
/// Q field: ≥128 signals in-band quantization tables.
const JPEG_Q: u8 = 255;

/// Block dimensions substituted when the frame reports a zero dimension.
const FALLBACK_WIDTH_BLOCKS: u8 = 160; // 1280 px
const FALLBACK_HEIGHT_BLOCKS: u8 = 90; // 720 px

/// JPEG payload capacity of a continuation packet.
const FRAGMENT_MAX: usize = MTU - RTP_HEADER_LEN - MAIN_HEADER_LEN;
/// JPEG payload capacity of a first packet (tables included).
const FIRST_FRAGMENT_MAX: usize =
    FRAGMENT_MAX - QTABLE_HEADER_LEN - QUANTIZATION_TABLES.len();

/// The two 64-byte JPEG Annex-K quantization matrices, luminance then
/// chrominance. Invariant constants of the payload format.
pub const QUANTIZATION_TABLES: [u8; 128] = [
    // Luminance
    16, 11, 10, 16, 24, 40, 51, 61, //
    12, 12, 14, 19, 26, 58, 60, 55, //
    14, 13, 16, 24, 40, 57, 69, 56, //
    14, 17, 22, 29, 51, 87, 80, 62, //
    18, 22, 37, 56, 68, 109, 103, 77, //
    24, 35, 55, 64, 81, 104, 113, 92, //
    49, 64, 78, 87, 103, 121, 120, 101, //
    72, 92, 95, 98, 112, 100, 103, 99, //
    // Chrominance
    17, 18, 24, 47, 99, 99, 99, 99, //
    18, 21, 26, 66, 99, 99, 99, 99, //
    24, 26, 56, 99, 99, 99, 99, 99, //
    47, 66, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
];

fn main_header(fragment_offset: u32, width_blocks: u8, height_blocks: u8) -> [u8; 8] {
    [
        0, // type-specific
        (fragment_offset >> 16) as u8,
        (fragment_offset >> 8) as u8,
        fragment_offset as u8,
        JPEG_TYPE,
        JPEG_Q,
        width_blocks,
        height_blocks,
    ]
}

fn block_dimensions(width: u32, height: u32) -> (u8, u8) {
    if width == 0 || height == 0 {
        (FALLBACK_WIDTH_BLOCKS, FALLBACK_HEIGHT_BLOCKS)
    } else {
        ((width / 8).min(255) as u8, (height / 8).min(255) as u8)
    }
}

/// Fragment a complete JPEG image into RTP packets.
///
/// All packets share `timestamp`; the marker bit rides the last one.
pub fn packetize_jpeg(
    w: &mut RtpWriter<'_>,
    jpeg: &[u8],
    width: u32,
    height: u32,
    timestamp: u32,
) -> Vec<Bytes> {
    let mut packets = Vec::new();
    if jpeg.is_empty() {
        return packets;
    }

    let (width_blocks, height_blocks) = block_dimensions(width, height);
    // MBZ, precision (8-bit), 16-bit table length
    let qtable_header: [u8; 4] = [0, 0, 0, QUANTIZATION_TABLES.len() as u8];

    let mut offset = 0usize;
    while offset < jpeg.len() {
        let first = offset == 0;
        let capacity = if first { FIRST_FRAGMENT_MAX } else { FRAGMENT_MAX };
        let chunk = &jpeg[offset..jpeg.len().min(offset + capacity)];
        let last = offset + chunk.len() >= jpeg.len();
        let header = main_header(offset as u32, width_blocks, height_blocks);

        let packet = if first {
            w.packet(
                last,
                timestamp,
                &[&header, &qtable_header, &QUANTIZATION_TABLES, chunk],
            )
        } else {
            w.packet(last, timestamp, &[&header, chunk])
        };
        packets.push(packet);
        offset += chunk.len();
    }

    packets
}
