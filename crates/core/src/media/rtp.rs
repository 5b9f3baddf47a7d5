//! Per-session RTP header state and packet assembly (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Version is always 2. Padding, extension, and CSRC count are always 0.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngExt;

use super::{CLOCK_RATE, RTP_HEADER_LEN};

/// Mutable RTP state owned by one session.
///
/// The sequence number advances exactly once per emitted packet, modulo
/// 2^16. The timestamp is an affine map from encoder PTS anchored at the
/// first frame: `rtp_ts = base_rtp + round((pts_ns − base_pts_ns) ×
/// 90000 / 1e9)`. SSRC is random (RFC 3550 §8.1) and constant for the
/// session's lifetime.
#[derive(Debug)]
pub struct RtpState {
    pub ssrc: u32,
    sequence: u16,
    base_rtp: u32,
    base_pts_ns: Option<u64>,
    last_timestamp: u32,
    /// PTS of the last emitted frame, used to deduplicate encoder output.
    pub last_pts_ns: Option<u64>,
    /// SPS transmitted to this client, mirroring the global cache only
    /// once it has actually been sent.
    pub sps_sent: Option<Bytes>,
    /// PPS transmitted to this client.
    pub pps_sent: Option<Bytes>,
}

impl RtpState {
    /// Fresh state with random SSRC, sequence, and timestamp base.
    pub fn seeded() -> Self {
        let mut rng = rand::rng();
        let base_rtp = rng.random::<u32>();
        Self {
            ssrc: rng.random::<u32>(),
            sequence: rng.random::<u16>(),
            base_rtp,
            base_pts_ns: None,
            last_timestamp: base_rtp,
            last_pts_ns: None,
            sps_sent: None,
            pps_sent: None,
        }
    }

    /// Re-seed sequence and timestamp base for a (re-)PLAY, keeping the
    /// session's SSRC.
    pub fn reseed(&mut self) {
        let mut rng = rand::rng();
        self.sequence = rng.random::<u16>();
        self.base_rtp = rng.random::<u32>();
        self.base_pts_ns = None;
        self.last_timestamp = self.base_rtp;
        self.last_pts_ns = None;
        self.sps_sent = None;
        self.pps_sent = None;
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp most recently written to the wire (for RTCP SRs).
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp
    }

    /// Map an encoder PTS to the session's RTP timeline, anchoring the
    /// affine base on first use.
    pub fn timestamp_for(&mut self, pts_ns: u64) -> u32 {
        let base = *self.base_pts_ns.get_or_insert(pts_ns);
        let delta_ns = pts_ns.saturating_sub(base) as u128;
        let ticks = (delta_ns * CLOCK_RATE as u128 + 500_000_000) / 1_000_000_000;
        let ts = self.base_rtp.wrapping_add(ticks as u32);
        self.last_timestamp = ts;
        ts
    }

    /// Timestamp from a monotonic clock in 90 kHz units, used for MJPEG
    /// where the encoder supplies no PTS.
    pub fn timestamp_at(&mut self, elapsed: Duration) -> u32 {
        let ticks = (elapsed.as_nanos() * CLOCK_RATE as u128 + 500_000_000) / 1_000_000_000;
        let ts = self.base_rtp.wrapping_add(ticks as u32);
        self.last_timestamp = ts;
        ts
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Pin the wire-visible fields for deterministic assertions.
    #[cfg(test)]
    pub(crate) fn force_wire_state(&mut self, ssrc: u32, sequence: u16, base_rtp: u32) {
        self.ssrc = ssrc;
        self.sequence = sequence;
        self.base_rtp = base_rtp;
        self.last_timestamp = base_rtp;
    }
}

/// Borrow of a session's RTP state plus the payload type, used by the
/// codec packetizers to emit packets.
pub struct RtpWriter<'a> {
    pub state: &'a mut RtpState,
    pt: u8,
}

impl<'a> RtpWriter<'a> {
    pub fn new(state: &'a mut RtpState, pt: u8) -> Self {
        Self { state, pt }
    }

    /// Assemble one RTP packet from header fields and payload parts,
    /// advancing the sequence number.
    pub fn packet(&mut self, marker: bool, timestamp: u32, parts: &[&[u8]]) -> Bytes {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload_len);

        buf.put_u8(2 << 6); // V=2, P=0, X=0, CC=0
        buf.put_u8(((marker as u8) << 7) | self.pt);
        buf.put_u16(self.state.next_sequence());
        buf.put_u32(timestamp);
        buf.put_u32(self.state.ssrc);
        for part in parts {
            buf.put_slice(part);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RtpState {
        let mut s = RtpState::seeded();
        s.ssrc = 0xAABBCCDD;
        s.sequence = 100;
        s.base_rtp = 0;
        s
    }

    #[test]
    fn header_layout() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, 96);
        let pkt = w.packet(false, 0x01020304, &[&[0xEE]]);
        assert_eq!(pkt.len(), 13);
        assert_eq!(pkt[0] >> 6, 2);
        assert_eq!(pkt[1] & 0x7f, 96);
        assert_eq!(pkt[1] & 0x80, 0);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 100);
        assert_eq!(u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]), 0x01020304);
        assert_eq!(u32::from_be_bytes([pkt[8], pkt[9], pkt[10], pkt[11]]), 0xAABBCCDD);
        assert_eq!(pkt[12], 0xEE);
    }

    #[test]
    fn marker_bit() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, 26);
        let pkt = w.packet(true, 0, &[]);
        assert_eq!(pkt[1] & 0x80, 0x80);
        assert_eq!(pkt[1] & 0x7f, 26);
    }

    #[test]
    fn sequence_advances_once_per_packet() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, 96);
        for expected in 100u16..110 {
            let pkt = w.packet(false, 0, &[]);
            assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), expected);
        }
    }

    #[test]
    fn sequence_wraps() {
        let mut s = state();
        s.sequence = u16::MAX;
        let mut w = RtpWriter::new(&mut s, 96);
        let pkt = w.packet(false, 0, &[]);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), u16::MAX);
        assert_eq!(s.sequence(), 0);
    }

    #[test]
    fn timestamp_affine_in_pts() {
        let mut s = state();
        s.base_rtp = 1000;
        // First frame anchors the base.
        assert_eq!(s.timestamp_for(5_000_000_000), 1000);
        // +1 s of PTS = +90_000 ticks.
        assert_eq!(s.timestamp_for(6_000_000_000), 91_000);
        // +33.33 ms ≈ one 30 fps frame = 3000 ticks (rounded).
        assert_eq!(s.timestamp_for(6_033_333_333), 91_000 + 3000);
    }

    #[test]
    fn timestamp_monotone_nondecreasing() {
        let mut s = state();
        let mut prev = s.timestamp_for(1_000_000);
        for pts in [2_000_000u64, 2_000_000, 40_000_000, 41_000_000] {
            let ts = s.timestamp_for(pts);
            assert!(ts >= prev);
            prev = ts;
        }
    }

    #[test]
    fn monotonic_clock_timestamps() {
        let mut s = state();
        s.base_rtp = 0;
        assert_eq!(s.timestamp_at(Duration::from_secs(1)), 90_000);
        assert_eq!(s.timestamp_at(Duration::from_millis(1500)), 135_000);
    }

    #[test]
    fn reseed_keeps_ssrc() {
        let mut s = RtpState::seeded();
        let ssrc = s.ssrc;
        s.sps_sent = Some(Bytes::from_static(&[0x67]));
        s.reseed();
        assert_eq!(s.ssrc, ssrc);
        assert!(s.sps_sent.is_none());
        assert!(s.base_pts_ns.is_none());
    }

    #[test]
    fn random_ssrc_differs() {
        let a = RtpState::seeded();
        let b = RtpState::seeded();
        assert_ne!(a.ssrc, b.ssrc);
    }
}
