//! H.264 RTP packetization (RFC 6184).
//!
//! Two packetization modes:
//!
//! - **Single NAL Unit** (§5.6): a NAL whose payload fits the MTU budget
//!   travels as one RTP packet (12-byte header + NAL bytes).
//!
//! - **FU-A fragmentation** (§5.8): larger NALs are split across
//!   packets, each fragment prefixed by two bytes:
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   Fragment data: [...]
//!   ```
//!
//!   S is set only on the first fragment, E only on the last; the type
//!   field carries the original NAL type. All fragments share the
//!   frame's RTP timestamp.
//!
//! Access-unit delimiters (type 9) and filler (type 12) are never
//! transmitted. Before any IDR, before the very first frame, and
//! whenever the client's cache is empty, SPS then PPS go out as separate
//! single-NAL packets with marker=false; the per-client cache updates
//! afterwards. The marker bit goes on the last packet of the last NAL of
//! the frame and nowhere else.

use bytes::Bytes;

use super::MTU;
use super::rtp::RtpWriter;
use crate::encode::EncodedFrame;

pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_AUD: u8 = 9;
pub const NAL_TYPE_FILLER: u8 = 12;
pub const NAL_TYPE_FU_A: u8 = 28;

/// Largest NAL payload sent as a single packet.
const SINGLE_NAL_MAX: usize = MTU - 12;

/// Fragment data bytes per FU-A packet (2 bytes go to the FU prefix).
const FU_FRAGMENT_MAX: usize = MTU - 2;

/// NAL type from the unit's first byte.
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// Whether a NAL belongs on the wire. AUD and filler are dropped;
/// parameter sets travel through the dedicated SPS/PPS path.
fn is_payload_nal(nal: &[u8]) -> bool {
    !matches!(
        nal_type(nal),
        NAL_TYPE_SPS | NAL_TYPE_PPS | NAL_TYPE_AUD | NAL_TYPE_FILLER
    ) && !nal.is_empty()
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Handles both 4-byte (`00 00 00 01`) and 3-byte (`00 00 01`) start
/// codes, tracking each code's length so boundaries between adjacent
/// NALs stay correct when the two forms are mixed.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };

        if start < end {
            nal_units.push(&data[start..end]);
        }
    }

    nal_units
}

/// Packetize one NAL unit into one or more RTP packets.
///
/// `end_of_frame` controls the marker bit: it is set only on the final
/// packet produced for the frame's final NAL.
pub fn packetize_nal(
    w: &mut RtpWriter<'_>,
    nal: &[u8],
    timestamp: u32,
    end_of_frame: bool,
) -> Vec<Bytes> {
    let mut packets = Vec::new();
    if nal.is_empty() {
        return packets;
    }

    if nal.len() <= SINGLE_NAL_MAX {
        // Single NAL Unit mode (RFC 6184 §5.6)
        packets.push(w.packet(end_of_frame, timestamp, &[nal]));
    } else {
        // FU-A fragmentation (RFC 6184 §5.8)
        let nal_header = nal[0];
        let nri = nal_header & 0x60;
        let fu_indicator = nri | NAL_TYPE_FU_A;
        let payload = &nal[1..];

        let mut offset = 0usize;
        let mut first = true;

        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let last_fragment = remaining <= FU_FRAGMENT_MAX;
            let chunk = &payload[offset..offset + remaining.min(FU_FRAGMENT_MAX)];

            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | (nal_header & 0x1f);

            let marker = end_of_frame && last_fragment;
            packets.push(w.packet(marker, timestamp, &[&[fu_indicator, fu_header], chunk]));

            offset += chunk.len();
            first = false;
        }

        tracing::trace!(
            nal_type = nal_header & 0x1f,
            nal_size = nal.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );
    }

    packets
}

/// Packetize one access unit for one client, handling SPS/PPS gating.
///
/// `fallback_params` is the global parameter-set cache, consulted when
/// the frame itself carries none. Returns every RTP packet for the
/// frame, in transmission order.
pub fn packetize_access_unit(
    w: &mut RtpWriter<'_>,
    frame: &EncodedFrame,
    fallback_params: Option<(Bytes, Bytes)>,
    timestamp: u32,
) -> Vec<Bytes> {
    let mut packets = Vec::new();

    let needs_params =
        frame.keyframe || w.state.sps_sent.is_none() || w.state.pps_sent.is_none();
    if needs_params {
        let sps = frame
            .sps
            .clone()
            .or_else(|| fallback_params.as_ref().map(|(s, _)| s.clone()));
        let pps = frame
            .pps
            .clone()
            .or_else(|| fallback_params.as_ref().map(|(_, p)| p.clone()));
        if let (Some(sps), Some(pps)) = (sps, pps) {
            packets.extend(packetize_nal(w, &sps, timestamp, false));
            packets.extend(packetize_nal(w, &pps, timestamp, false));
            w.state.sps_sent = Some(sps);
            w.state.pps_sent = Some(pps);
        }
    }

    let payload: Vec<&Bytes> = frame
        .nal_units
        .iter()
        .filter(|nal| is_payload_nal(nal))
        .collect();
    let last = payload.len().saturating_sub(1);
    for (i, nal) in payload.iter().enumerate() {
        packets.extend(packetize_nal(w, nal, timestamp, i == last));
    }

    packets
}

/// `sprop-parameter-sets` value for SDP: base64 of the SPS and PPS NALs
/// without start codes, comma-separated (RFC 6184 §8.1).
pub fn sprop_parameter_sets(sps: &[u8], pps: &[u8]) -> String {
    use base64::prelude::{BASE64_STANDARD, Engine as _};
    format!("{},{}", BASE64_STANDARD.encode(sps), BASE64_STANDARD.encode(pps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PAYLOAD_TYPE_H264;
    use crate::media::rtp::RtpState;

    fn state() -> RtpState {
        let mut s = RtpState::seeded();
        s.force_wire_state(0x11223344, 0, 0);
        s
    }

    fn frame(nals: Vec<Vec<u8>>, keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            nal_units: nals.into_iter().map(Bytes::from).collect(),
            sps: Some(Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1e])),
            pps: Some(Bytes::from_static(&[0x68, 0xce, 0x38, 0x80])),
            pts_ns: 0,
            keyframe,
        }
    }

    // --- Annex B extraction ---

    #[test]
    fn split_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn split_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn split_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = split_annex_b(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42][..]);
        assert_eq!(nals[1], &[0x68, 0xCE][..]);
    }

    #[test]
    fn split_empty_and_garbage() {
        assert!(split_annex_b(&[]).is_empty());
        assert!(split_annex_b(&[0xFF, 0xFE]).is_empty());
    }

    // --- Single NAL / FU-A ---

    #[test]
    fn small_nal_single_packet_with_marker() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let nal = [0x65, 0xAA, 0xBB, 0xCC];
        let packets = packetize_nal(&mut w, &nal, 7, true);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert_eq!(packets[0][1] & 0x80, 0x80);
        assert_eq!(&packets[0][12..], &nal);
    }

    #[test]
    fn fragmentation_boundary() {
        // MTU - 12 bytes: still a single packet.
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let mut nal = vec![0x65];
        nal.resize(MTU - 12, 0xAA);
        assert_eq!(packetize_nal(&mut w, &nal, 0, true).len(), 1);

        // One byte more: FU-A.
        nal.resize(MTU - 11, 0xAA);
        let packets = packetize_nal(&mut w, &nal, 0, true);
        assert!(packets.len() > 1);
        assert_eq!(packets[0][12] & 0x1f, NAL_TYPE_FU_A);
    }

    #[test]
    fn fu_a_start_end_and_marker_bits() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let mut nal = vec![0x65]; // NRI=3, type 5
        nal.extend(vec![0xAB; 3 * MTU]);
        let packets = packetize_nal(&mut w, &nal, 42, true);
        assert!(packets.len() >= 3);

        // First fragment: S bit, no E, no marker.
        assert_eq!(packets[0][13] & 0x80, 0x80);
        assert_eq!(packets[0][13] & 0x40, 0);
        assert_eq!(packets[0][1] & 0x80, 0);
        // Middle fragments: neither S nor E.
        for pkt in &packets[1..packets.len() - 1] {
            assert_eq!(pkt[13] & 0xc0, 0);
            assert_eq!(pkt[1] & 0x80, 0);
        }
        // Last fragment: E bit and marker.
        let last = packets.last().unwrap();
        assert_eq!(last[13] & 0x40, 0x40);
        assert_eq!(last[1] & 0x80, 0x80);

        // FU indicator preserves NRI, FU header preserves type.
        assert_eq!(packets[0][12] & 0x60, 0x60);
        assert_eq!(packets[0][13] & 0x1f, NAL_TYPE_IDR);

        // Same timestamp on every fragment.
        for pkt in &packets {
            assert_eq!(u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]), 42);
        }

        // Fragment payload reassembles to the original NAL body.
        let mut body = Vec::new();
        for pkt in &packets {
            body.extend_from_slice(&pkt[14..]);
        }
        assert_eq!(body, nal[1..]);
    }

    #[test]
    fn no_marker_when_not_end_of_frame() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let mut nal = vec![0x65];
        nal.extend(vec![0xAB; 2 * MTU]);
        let packets = packetize_nal(&mut w, &nal, 0, false);
        for pkt in &packets {
            assert_eq!(pkt[1] & 0x80, 0);
        }
    }

    // --- Access unit assembly ---

    #[test]
    fn idr_preceded_by_sps_pps() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let f = frame(vec![vec![0x65, 0x88, 0x00]], true);
        let packets = packetize_access_unit(&mut w, &f, None, 9);

        assert_eq!(packets.len(), 3);
        assert_eq!(nal_type(&packets[0][12..]), NAL_TYPE_SPS);
        assert_eq!(nal_type(&packets[1][12..]), NAL_TYPE_PPS);
        assert_eq!(nal_type(&packets[2][12..]), NAL_TYPE_IDR);
        // Parameter sets never carry the marker.
        assert_eq!(packets[0][1] & 0x80, 0);
        assert_eq!(packets[1][1] & 0x80, 0);
        assert_eq!(packets[2][1] & 0x80, 0x80);
        // Cache updated after transmission.
        assert!(s.sps_sent.is_some());
        assert!(s.pps_sent.is_some());
    }

    #[test]
    fn params_sent_once_for_non_idr_when_cached() {
        let mut s = state();

        let idr = frame(vec![vec![0x65, 0x88]], true);
        let p = frame(vec![vec![0x41, 0x9a]], false);

        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let first = packetize_access_unit(&mut w, &idr, None, 0);
        assert_eq!(first.len(), 3);

        // Non-IDR with a warm cache: data only.
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let second = packetize_access_unit(&mut w, &p, None, 3000);
        assert_eq!(second.len(), 1);
        assert_eq!(nal_type(&second[0][12..]), 1);
    }

    #[test]
    fn empty_cache_triggers_params_on_non_idr() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let p = frame(vec![vec![0x41, 0x9a]], false);
        let packets = packetize_access_unit(&mut w, &p, None, 0);
        assert_eq!(packets.len(), 3);
        assert_eq!(nal_type(&packets[0][12..]), NAL_TYPE_SPS);
    }

    #[test]
    fn fallback_params_from_global_cache() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let mut f = frame(vec![vec![0x65, 0x88]], true);
        f.sps = None;
        f.pps = None;
        let fallback = Some((
            Bytes::from_static(&[0x67, 0x42]),
            Bytes::from_static(&[0x68, 0xce]),
        ));
        let packets = packetize_access_unit(&mut w, &f, fallback, 0);
        assert_eq!(packets.len(), 3);
        assert_eq!(&packets[0][12..], &[0x67, 0x42]);
    }

    #[test]
    fn aud_and_filler_filtered() {
        let mut s = state();
        // Warm cache so only data NALs come out.
        s.sps_sent = Some(Bytes::from_static(&[0x67]));
        s.pps_sent = Some(Bytes::from_static(&[0x68]));
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let f = frame(
            vec![vec![0x09, 0x10], vec![0x41, 0x9a], vec![0x0c, 0x00]],
            false,
        );
        let packets = packetize_access_unit(&mut w, &f, None, 0);
        assert_eq!(packets.len(), 1);
        assert_eq!(nal_type(&packets[0][12..]), 1);
        assert_eq!(packets[0][1] & 0x80, 0x80);
    }

    #[test]
    fn marker_on_last_nal_of_multi_nal_frame() {
        let mut s = state();
        s.sps_sent = Some(Bytes::from_static(&[0x67]));
        s.pps_sent = Some(Bytes::from_static(&[0x68]));
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let f = frame(vec![vec![0x41, 0x01], vec![0x41, 0x02], vec![0x41, 0x03]], false);
        let packets = packetize_access_unit(&mut w, &f, None, 5);
        assert_eq!(packets.len(), 3);
        let markers: Vec<bool> = packets.iter().map(|p| p[1] & 0x80 != 0).collect();
        assert_eq!(markers, vec![false, false, true]);
        // All packets of the frame share one timestamp.
        for pkt in &packets {
            assert_eq!(u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]), 5);
        }
    }

    #[test]
    fn sequence_numbers_consecutive_across_frame() {
        let mut s = state();
        let mut w = RtpWriter::new(&mut s, PAYLOAD_TYPE_H264);
        let mut big = vec![0x65];
        big.extend(vec![0xAB; 2 * MTU]);
        let f = frame(vec![big], true);
        let packets = packetize_access_unit(&mut w, &f, None, 0);
        let seqs: Vec<u16> = packets
            .iter()
            .map(|p| u16::from_be_bytes([p[2], p[3]]))
            .collect();
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn sprop_format() {
        let sprop = sprop_parameter_sets(&[0x67, 0x42], &[0x68, 0xce]);
        let (sps, pps) = sprop.split_once(',').unwrap();
        use base64::prelude::{BASE64_STANDARD, Engine as _};
        assert_eq!(BASE64_STANDARD.decode(sps).unwrap(), vec![0x67, 0x42]);
        assert_eq!(BASE64_STANDARD.decode(pps).unwrap(), vec![0x68, 0xce]);
    }
}
