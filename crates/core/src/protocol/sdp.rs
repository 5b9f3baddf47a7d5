//! SDP session description generation (RFC 4566) for DESCRIBE responses.
//!
//! ```text
//! v=0
//! o=- <unique> 1 IN IP4 <server-ip>
//! s=RTSP Server Stream
//! t=0 0
//! m=video 0 RTP/AVP <96|26>
//! c=IN IP4 <server-ip>
//! a=rtpmap:<96 H264/90000 | 26 JPEG/90000>
//! a=fmtp:96 profile-level-id=42e01e;packetization-mode=1[;sprop-parameter-sets=...]
//! a=control:rtsp://<server-ip>:<port>/live
//! ```
//!
//! The `a=fmtp` line is emitted only for H.264; when the encoder has
//! surfaced parameter sets they ride along as `sprop-parameter-sets`
//! (base64 SPS, comma, base64 PPS — RFC 6184 §8.1).

use bytes::Bytes;
use rand::RngExt;

use crate::media::h264::sprop_parameter_sets;
use crate::media::{PAYLOAD_TYPE_H264, PAYLOAD_TYPE_JPEG};
use crate::session::Codec;

pub const SESSION_NAME: &str = "RTSP Server Stream";

/// Generate the SDP body for a DESCRIBE response.
pub fn generate_sdp(
    server_ip: &str,
    port: u16,
    codec: Codec,
    parameter_sets: Option<(Bytes, Bytes)>,
) -> String {
    let unique: u32 = rand::rng().random();
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- {} 1 IN IP4 {}", unique, server_ip));
    sdp.push(format!("s={}", SESSION_NAME));
    sdp.push("t=0 0".to_string());

    match codec {
        Codec::H264 => {
            sdp.push(format!("m=video 0 RTP/AVP {}", PAYLOAD_TYPE_H264));
            sdp.push(format!("c=IN IP4 {}", server_ip));
            sdp.push(format!("a=rtpmap:{} H264/90000", PAYLOAD_TYPE_H264));
            let mut fmtp = format!(
                "a=fmtp:{} profile-level-id=42e01e;packetization-mode=1",
                PAYLOAD_TYPE_H264
            );
            if let Some((sps, pps)) = parameter_sets {
                fmtp.push_str(&format!(
                    ";sprop-parameter-sets={}",
                    sprop_parameter_sets(&sps, &pps)
                ));
            }
            sdp.push(fmtp);
        }
        Codec::Mjpeg => {
            sdp.push(format!("m=video 0 RTP/AVP {}", PAYLOAD_TYPE_JPEG));
            sdp.push(format!("c=IN IP4 {}", server_ip));
            sdp.push(format!("a=rtpmap:{} JPEG/90000", PAYLOAD_TYPE_JPEG));
        }
    }
    sdp.push(format!("a=control:rtsp://{}:{}/live", server_ip, port));

    tracing::debug!(%codec, "SDP generated");
    format!("{}\r\n", sdp.join("\r\n"))
}
