//! Per-client delivery loops.
//!
//! One thread per PLAYing session. H.264 loops drain the client's
//! encoded-frame ring, gate SPS/PPS, and keep marker-bit discipline;
//! MJPEG loops snapshot the latest raw frame, encode at the client's
//! current quality, and pace to roughly 45 fps. Both emit periodic RTCP
//! sender reports and exit when the session stops playing, turns
//! unhealthy, or its control connection dies.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;

use crate::encode::FrameRing;
use crate::media::rtp::RtpWriter;
use crate::media::{PAYLOAD_TYPE_H264, PAYLOAD_TYPE_JPEG, h264, mjpeg, rtcp};
use crate::net::is_fatal_send_error;
use crate::server::ServerCore;
use crate::session::{Codec, Session};

/// Idle poll while the encoded-frame ring is empty. A tunable, not a
/// contract.
pub const H264_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// MJPEG frame budget (~45 fps): sleep whatever the iteration left over.
const MJPEG_FRAME_BUDGET: Duration = Duration::from_millis(22);

pub struct StreamContext {
    pub core: Arc<ServerCore>,
    pub session: Arc<Session>,
    /// Present for H.264 sessions.
    pub ring: Option<Arc<FrameRing>>,
}

/// Run the delivery loop to completion, then release the client's
/// encoder subscription.
pub fn run(ctx: StreamContext) {
    let session = ctx.session.clone();
    tracing::debug!(session_id = %session.id, codec = %session.codec, "stream loop started");

    match session.codec {
        Codec::H264 => run_h264(&ctx),
        Codec::Mjpeg => run_mjpeg(&ctx),
    }

    session.stop_playing();
    if session.codec == Codec::H264 {
        ctx.core.encoders.unsubscribe(session.camera, &session.id);
    }
    tracing::debug!(session_id = %session.id, "stream loop exited");
}

/// The health gate checked every iteration: still playing, control
/// socket open, error streak under the limit, not silent past the
/// inactivity cutoff.
fn healthy(ctx: &StreamContext) -> bool {
    let session = &ctx.session;
    if ctx.core.shutdown.load(Ordering::SeqCst) || !session.is_playing() {
        return false;
    }
    if !session.connection_open() {
        tracing::debug!(session_id = %session.id, "control connection closed");
        return false;
    }
    if session.is_unhealthy() {
        tracing::warn!(session_id = %session.id,
            errors = session.consecutive_send_errors(),
            idle_ms = session.idle_for().as_millis() as u64,
            "session unhealthy");
        return false;
    }
    true
}

fn run_h264(ctx: &StreamContext) {
    let session = &ctx.session;
    let Some(ring) = ctx.ring.as_ref() else {
        tracing::error!(session_id = %session.id, "H.264 stream loop without frame ring");
        return;
    };
    // Delivery starts on a keyframe so the client can decode from the
    // first access unit it receives.
    let mut saw_keyframe = false;

    while healthy(ctx) {
        if ctx.core.encoders.is_failed(session.camera) {
            tracing::error!(session_id = %session.id, camera = %session.camera,
                "encoder failed, closing session");
            session.mark_unhealthy();
            return;
        }

        let Some(frame) = ring.pop() else {
            std::thread::sleep(H264_POLL_INTERVAL);
            send_sender_report(ctx);
            continue;
        };
        if !saw_keyframe {
            if !frame.keyframe {
                tracing::trace!(session_id = %session.id, "waiting for keyframe");
                continue;
            }
            saw_keyframe = true;
        }

        let fallback = ctx.core.encoders.parameter_sets(session.camera);
        let packets = {
            let mut rtp = session.rtp.lock();
            if rtp.last_pts_ns.is_some_and(|last| frame.pts_ns <= last) {
                None // duplicate or stale frame
            } else {
                let ts = rtp.timestamp_for(frame.pts_ns);
                rtp.last_pts_ns = Some(frame.pts_ns);
                let mut writer = RtpWriter::new(&mut rtp, PAYLOAD_TYPE_H264);
                Some(h264::packetize_access_unit(&mut writer, &frame, fallback, ts))
            }
        };

        let Some(packets) = packets else { continue };
        if !send_packets(ctx, &packets) {
            return;
        }
        send_sender_report(ctx);
    }
}

fn run_mjpeg(ctx: &StreamContext) {
    let session = &ctx.session;
    let clock_start = Instant::now();
    let mut last_pts: Option<u64> = None;

    while healthy(ctx) {
        let started = Instant::now();

        let Some(raw) = ctx.core.bus.latest(session.camera) else {
            std::thread::sleep(H264_POLL_INTERVAL);
            continue;
        };
        if last_pts == Some(raw.pts_ns) {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }
        last_pts = Some(raw.pts_ns);

        let quality = session.profile.lock().quality;
        let jpeg = match ctx.core.jpeg.encode(&raw, quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "JPEG encode failed");
                std::thread::sleep(MJPEG_FRAME_BUDGET);
                continue;
            }
        };

        let packets = {
            let mut rtp = session.rtp.lock();
            let ts = rtp.timestamp_at(clock_start.elapsed());
            let mut writer = RtpWriter::new(&mut rtp, PAYLOAD_TYPE_JPEG);
            mjpeg::packetize_jpeg(&mut writer, &jpeg, raw.width, raw.height, ts)
        };

        if !send_packets(ctx, &packets) {
            return;
        }
        send_sender_report(ctx);

        // Pace to the frame budget, minus the work just done.
        if let Some(left) = MJPEG_FRAME_BUDGET.checked_sub(started.elapsed()) {
            std::thread::sleep(left);
        }
    }
}

/// Deliver one frame's packets. Returns false when the session died.
fn send_packets(ctx: &StreamContext, packets: &[Bytes]) -> bool {
    let session = &ctx.session;
    let transport = session.transport.read();
    let Some(binding) = transport.as_ref() else {
        session.mark_unhealthy();
        return false;
    };

    let mut octets = 0u64;
    for packet in packets {
        match binding.send_rtp(packet) {
            Ok(()) => octets += packet.len() as u64,
            Err(e) => {
                let errors = session.record_send_error();
                if is_fatal_send_error(&e) || errors >= binding.send_error_limit() {
                    tracing::warn!(session_id = %session.id, error = %e, errors,
                        "fatal send error, closing session");
                    session.mark_unhealthy();
                    return false;
                }
                tracing::debug!(session_id = %session.id, error = %e, errors,
                    "transient send error");
                return true; // drop the rest of this frame, retry next
            }
        }
    }
    session.record_send(packets.len() as u64, octets);
    true
}

/// Emit an RTCP sender report roughly every five seconds once traffic
/// has flowed.
fn send_sender_report(ctx: &StreamContext) {
    let session = &ctx.session;

    let report = {
        let mut counters = session.counters.lock();
        if counters.packets == 0 {
            return;
        }
        let due = counters
            .last_sender_report
            .is_none_or(|at| at.elapsed() >= rtcp::SENDER_REPORT_INTERVAL);
        if !due {
            return;
        }
        counters.last_sender_report = Some(Instant::now());
        let rtp = session.rtp.lock();
        rtcp::sender_report(
            rtp.ssrc,
            SystemTime::now(),
            rtp.last_timestamp(),
            counters.packets as u32,
            counters.octets as u32,
        )
    };

    let transport = session.transport.read();
    if let Some(binding) = transport.as_ref() {
        if let Err(e) = binding.send_rtcp(&report) {
            tracing::debug!(session_id = %session.id, error = %e, "sender report send failed");
        } else {
            tracing::trace!(session_id = %session.id, "sender report emitted");
        }
    }
}
