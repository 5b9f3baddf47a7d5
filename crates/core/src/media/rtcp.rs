//! RTCP: sender reports, receiver-report ingestion, adaptive rate control
//! (RFC 3550 §6).
//!
//! The server emits 28-byte Sender Reports (PT 200) and consumes client
//! Receiver Reports (PT 201) and BYE (PT 203). Loss and jitter extracted
//! from RRs drive the bitrate/quality controller: heavy loss backs the
//! encoder off sharply, mild loss gently, and a clean clear window of at
//! least ten seconds earns a small raise back toward the profile maximum.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::config::{QUALITY_MIN, VideoProfile};

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_BYE: u8 = 203;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Sender Report length: header + SSRC + NTP + RTP ts + counts.
pub const SENDER_REPORT_LEN: usize = 28;

/// Interval between Sender Reports on an active stream.
pub const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between upward bitrate adjustments.
const RAISE_INTERVAL: Duration = Duration::from_secs(10);

/// Build a 28-byte RTCP Sender Report.
///
/// Layout: V=2 RC=0 PT=200 length=6 (32-bit words minus one), then SSRC,
/// 64-bit NTP timestamp (seconds since 1900 in the high word), the RTP
/// timestamp last written to the wire, and the cumulative packet and
/// octet counts.
pub fn sender_report(
    ssrc: u32,
    wallclock: SystemTime,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) -> [u8; SENDER_REPORT_LEN] {
    let since_unix = wallclock
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let ntp_seconds = (since_unix.as_secs() + NTP_UNIX_OFFSET) as u32;
    let ntp_fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;

    let mut buf = BytesMut::with_capacity(SENDER_REPORT_LEN);
    buf.put_u8(0x80); // V=2, P=0, RC=0
    buf.put_u8(PT_SENDER_REPORT);
    buf.put_u16(6); // length in 32-bit words minus one
    buf.put_u32(ssrc);
    buf.put_u32(ntp_seconds);
    buf.put_u32(ntp_fraction as u32);
    buf.put_u32(rtp_timestamp);
    buf.put_u32(packet_count);
    buf.put_u32(octet_count);

    let mut out = [0u8; SENDER_REPORT_LEN];
    out.copy_from_slice(&buf);
    out
}

/// Fields extracted from a client Receiver Report's first report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit).
    pub cumulative_lost: u32,
    /// Interarrival jitter in timestamp units.
    pub jitter: u32,
}

/// A parsed inbound RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport,
    ReceiverReport(ReceiverReport),
    Bye,
    Other(u8),
}

/// Parse the first packet of an inbound RTCP datagram.
pub fn parse(buf: &[u8]) -> Option<RtcpPacket> {
    if buf.len() < 4 || buf[0] >> 6 != 2 {
        return None;
    }
    match buf[1] {
        PT_SENDER_REPORT => Some(RtcpPacket::SenderReport),
        PT_RECEIVER_REPORT => {
            // Needs header + reporter SSRC + one report block.
            if buf.len() < 24 {
                return None;
            }
            Some(RtcpPacket::ReceiverReport(ReceiverReport {
                fraction_lost: buf[12],
                cumulative_lost: u32::from_be_bytes([0, buf[13], buf[14], buf[15]]),
                jitter: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
            }))
        }
        PT_BYE => Some(RtcpPacket::Bye),
        pt => Some(RtcpPacket::Other(pt)),
    }
}

/// What the rate controller decided for one receiver report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateChange {
    /// New encoder target, when the bitrate moved.
    pub bitrate: Option<u32>,
    /// New JPEG quality, when it moved.
    pub quality: Option<u8>,
}

impl RateChange {
    pub fn is_noop(&self) -> bool {
        self.bitrate.is_none() && self.quality.is_none()
    }
}

/// Apply one receiver report to a profile.
///
/// | fraction_lost (/256) | action |
/// |---|---|
/// | > 10 | bitrate ×0.6 (≥ min), quality ×0.6 (≥ 10) |
/// | 6..10 | bitrate ×0.9 (≥ min), quality ×0.9 (≥ 10) |
/// | < 2, jitter < 100, ≥ 10 s since last raise | bitrate ×1.1 (≤ max) |
pub fn adapt_profile(
    profile: &mut VideoProfile,
    report: &ReceiverReport,
    last_raise: &mut Instant,
    now: Instant,
) -> RateChange {
    let mut change = RateChange::default();

    let scale_down = |profile: &mut VideoProfile, factor: f64| -> RateChange {
        let bitrate = ((profile.bitrate as f64 * factor) as u32).max(profile.min_bitrate);
        let quality = ((profile.quality as f64 * factor) as u8).max(QUALITY_MIN);
        let mut change = RateChange::default();
        if bitrate != profile.bitrate {
            profile.bitrate = bitrate;
            change.bitrate = Some(bitrate);
        }
        if quality != profile.quality {
            profile.quality = quality;
            change.quality = Some(quality);
        }
        change
    };

    if report.fraction_lost > 10 {
        change = scale_down(profile, 0.6);
    } else if report.fraction_lost >= 6 {
        change = scale_down(profile, 0.9);
    } else if report.fraction_lost < 2
        && report.jitter < 100
        && now.duration_since(*last_raise) >= RAISE_INTERVAL
    {
        let bitrate = ((profile.bitrate as f64 * 1.1) as u32).min(profile.max_bitrate);
        if bitrate != profile.bitrate {
            profile.bitrate = bitrate;
            change.bitrate = Some(bitrate);
        }
        *last_raise = now;
    }

    if !change.is_noop() {
        tracing::info!(
            fraction_lost = report.fraction_lost,
            jitter = report.jitter,
            bitrate = profile.bitrate,
            quality = profile.quality,
            "rate adapted from receiver report"
        );
    }
    change
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> VideoProfile {
        VideoProfile {
            bitrate: 2_000_000,
            quality: 80,
            ..VideoProfile::default()
        }
    }

    fn rr(fraction_lost: u8, jitter: u32) -> ReceiverReport {
        ReceiverReport {
            fraction_lost,
            cumulative_lost: 0,
            jitter,
        }
    }

    #[test]
    fn sender_report_layout() {
        let when = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let sr = sender_report(0xDEADBEEF, when, 0x11223344, 555, 66_666);

        assert_eq!(sr.len(), 28);
        assert_eq!(sr[0], 0x80);
        assert_eq!(sr[1], 200);
        assert_eq!(u16::from_be_bytes([sr[2], sr[3]]), 6);
        assert_eq!(u32::from_be_bytes([sr[4], sr[5], sr[6], sr[7]]), 0xDEADBEEF);
        // NTP seconds: unix seconds + 1900→1970 offset.
        assert_eq!(
            u32::from_be_bytes([sr[8], sr[9], sr[10], sr[11]]),
            (1_000_000_000u64 + 2_208_988_800) as u32
        );
        assert_eq!(u32::from_be_bytes([sr[12], sr[13], sr[14], sr[15]]), 0);
        assert_eq!(u32::from_be_bytes([sr[16], sr[17], sr[18], sr[19]]), 0x11223344);
        assert_eq!(u32::from_be_bytes([sr[20], sr[21], sr[22], sr[23]]), 555);
        assert_eq!(u32::from_be_bytes([sr[24], sr[25], sr[26], sr[27]]), 66_666);
    }

    #[test]
    fn ntp_fraction_is_half_second() {
        let when = UNIX_EPOCH + Duration::from_millis(500);
        let sr = sender_report(0, when, 0, 0, 0);
        let fraction = u32::from_be_bytes([sr[12], sr[13], sr[14], sr[15]]);
        // 0.5 s = 2^31 fractional units (within rounding).
        assert!((fraction as i64 - (1i64 << 31)).abs() < 1000);
    }

    #[test]
    fn parse_receiver_report() {
        let mut buf = vec![0u8; 32];
        buf[0] = 0x81; // V=2, RC=1
        buf[1] = PT_RECEIVER_REPORT;
        buf[12] = 32; // fraction lost
        buf[13] = 0;
        buf[14] = 1;
        buf[15] = 44; // cumulative = 300
        buf[20..24].copy_from_slice(&50u32.to_be_bytes());

        match parse(&buf) {
            Some(RtcpPacket::ReceiverReport(rr)) => {
                assert_eq!(rr.fraction_lost, 32);
                assert_eq!(rr.cumulative_lost, 300);
                assert_eq!(rr.jitter, 50);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_bye_and_junk() {
        let mut bye = vec![0x80, PT_BYE, 0, 1];
        bye.extend_from_slice(&0x1234u32.to_be_bytes());
        assert_eq!(parse(&bye), Some(RtcpPacket::Bye));

        assert_eq!(parse(&[]), None);
        assert_eq!(parse(&[0x00, 200, 0, 0]), None); // wrong version
        // Truncated RR is rejected.
        assert_eq!(parse(&[0x80, PT_RECEIVER_REPORT, 0, 1, 0, 0, 0, 0]), None);
    }

    #[test]
    fn heavy_loss_cuts_to_sixty_percent() {
        let mut p = profile();
        let mut last_raise = Instant::now();
        let change = adapt_profile(&mut p, &rr(32, 0), &mut last_raise, Instant::now());
        assert_eq!(p.bitrate, 1_200_000);
        assert_eq!(p.quality, 48);
        assert_eq!(change.bitrate, Some(1_200_000));
        assert_eq!(change.quality, Some(48));
    }

    #[test]
    fn mild_loss_cuts_to_ninety_percent() {
        let mut p = profile();
        let mut last_raise = Instant::now();
        adapt_profile(&mut p, &rr(8, 0), &mut last_raise, Instant::now());
        assert_eq!(p.bitrate, 1_800_000);
        assert_eq!(p.quality, 72);
    }

    #[test]
    fn floors_respected() {
        let mut p = profile();
        p.bitrate = p.min_bitrate;
        p.quality = QUALITY_MIN;
        let mut last_raise = Instant::now();
        let change = adapt_profile(&mut p, &rr(200, 0), &mut last_raise, Instant::now());
        assert_eq!(p.bitrate, p.min_bitrate);
        assert_eq!(p.quality, QUALITY_MIN);
        assert!(change.is_noop());
    }

    #[test]
    fn clean_window_raises_after_ten_seconds() {
        let mut p = profile();
        let now = Instant::now();
        let mut last_raise = now - Duration::from_secs(11);
        let change = adapt_profile(&mut p, &rr(0, 50), &mut last_raise, now);
        assert_eq!(p.bitrate, 2_200_000);
        assert_eq!(change.bitrate, Some(2_200_000));
        assert_eq!(change.quality, None);
        assert_eq!(last_raise, now);

        // Immediately after, a second clean report must not raise again.
        let change = adapt_profile(&mut p, &rr(0, 50), &mut last_raise, now);
        assert!(change.is_noop());
        assert_eq!(p.bitrate, 2_200_000);
    }

    #[test]
    fn raise_capped_at_max() {
        let mut p = profile();
        p.bitrate = p.max_bitrate;
        let now = Instant::now();
        let mut last_raise = now - Duration::from_secs(60);
        let change = adapt_profile(&mut p, &rr(0, 0), &mut last_raise, now);
        assert_eq!(p.bitrate, p.max_bitrate);
        assert!(change.is_noop());
    }

    #[test]
    fn jitter_blocks_raise() {
        let mut p = profile();
        let now = Instant::now();
        let mut last_raise = now - Duration::from_secs(60);
        let change = adapt_profile(&mut p, &rr(0, 500), &mut last_raise, now);
        assert!(change.is_noop());
        assert_eq!(p.bitrate, 2_000_000);
    }

    #[test]
    fn moderate_loss_holds_steady() {
        let mut p = profile();
        let now = Instant::now();
        let mut last_raise = now - Duration::from_secs(60);
        // fraction 3..5 neither cuts nor raises.
        let change = adapt_profile(&mut p, &rr(4, 0), &mut last_raise, now);
        assert!(change.is_noop());
    }
}
