//! Media packetization: RTP header state, codec payload formats, RTCP.
//!
//! Each encoded video frame becomes one or more RTP packets carrying a
//! 12-byte fixed header ([`rtp::RtpState`] + [`rtp::RtpWriter`]):
//!
//! - **Sequence number** (16-bit, wrapping) — incremented exactly once
//!   per emitted packet.
//! - **Timestamp** (32-bit, 90 kHz) — identical across all fragments of
//!   one frame, non-decreasing affine in encoder PTS.
//! - **SSRC** (32-bit) — random, constant for the session.
//! - **Marker bit** — set on the last packet of a frame and nowhere else.
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | MJPEG | [`mjpeg`] | [RFC 2435](https://tools.ietf.org/html/rfc2435) |
//! | RTCP  | [`rtcp`] | [RFC 3550](https://tools.ietf.org/html/rfc3550) |

pub mod h264;
pub mod mjpeg;
pub mod rtcp;
pub mod rtp;

/// Per-packet payload byte ceiling, chosen to keep RTP under the path
/// MTU with headroom for IP/UDP/TCP headers.
pub const MTU: usize = 1400;

/// RTP fixed header length (no CSRC, no extension).
pub const RTP_HEADER_LEN: usize = 12;

/// Dynamic payload type used for H.264 (RFC 6184).
pub const PAYLOAD_TYPE_H264: u8 = 96;

/// Static payload type for JPEG (RFC 3551).
pub const PAYLOAD_TYPE_JPEG: u8 = 26;

/// 90 kHz video clock (RFC 3551 §4).
pub const CLOCK_RATE: u32 = 90_000;
