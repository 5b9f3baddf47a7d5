//! # camstream — embedded RTSP camera server
//!
//! Exposes live camera video as RTP streams over RTSP 1.0, with an
//! auxiliary HTTP MJPEG endpoint. Two named cameras (back and front)
//! serve H.264 or Motion-JPEG to media players, transcoders, and
//! browsers.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation, `$` interleaving |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Header format, SSRC/sequence/timestamp semantics, SR/RR/BYE |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | DESCRIBE session descriptions |
//! | [RFC 6184](https://tools.ietf.org/html/rfc6184) | H.264 RTP payload | Single-NAL and FU-A packetization, `sprop-parameter-sets` |
//! | [RFC 2435](https://tools.ietf.org/html/rfc2435) | JPEG RTP payload | Main/quantization headers, fragmentation |
//! | [RFC 7616](https://tools.ietf.org/html/rfc7616) | Digest auth | MD5 challenge/response with and without `qop` |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Host (CLI / embedded shim)                   │
//! ├───────────────────────────────────────────────┤
//! │  Server      — orchestrator, accept loops     │
//! │  Supervisor  — watchdog, lifecycle reconcile  │
//! ├───────────────────────────────────────────────┤
//! │  Protocol    — RTSP parsing, SDP, methods     │
//! │  Auth        — users, nonces, Basic/Digest    │
//! │  Session     — state, transports, UDP ports   │
//! ├───────────────────────────────────────────────┤
//! │  Stream      — per-client delivery loops      │
//! │  Media       — RTP/RTCP, H.264, MJPEG         │
//! │  Http        — MJPEG multipart endpoint       │
//! ├───────────────────────────────────────────────┤
//! │  Frame/Encode/Camera — capture & encoder glue │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Data path: camera → [`FrameBus`] → (H.264 encoder pipeline or
//! on-demand JPEG) → stream loop → packetizer → TCP-interleaved or UDP
//! transport. Control path: TCP connect → parser → auth → session
//! manager → transport negotiation (SETUP) → stream loop (PLAY) →
//! teardown.
//!
//! ## Quick start
//!
//! ```no_run
//! use camstream::{MediaBackends, Server, ServerConfig};
//! # fn media_backends() -> MediaBackends { unimplemented!() }
//!
//! // Backends wrap the host's camera driver and encoders.
//! let mut server = Server::new(ServerConfig::default(), media_backends());
//! server.start().unwrap();
//! ```

pub mod auth;
pub mod camera;
pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod frame;
pub mod http;
pub mod media;
pub mod net;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod tls;

pub use auth::{AuthEngine, Credentials, UserStore};
pub use config::{ServerConfig, VideoProfile};
pub use control::{CameraCommand, ControlBus};
pub use encode::{EncodedFrame, EncoderSettings, H264Encoder, JpegEncoder};
pub use error::{Result, ServerError};
pub use frame::{CameraDriver, CameraId, FrameBus, FrameSink, PixelFormat, RawFrame};
pub use server::{MediaBackends, Server, ServerCore};
pub use session::{Codec, Session, SessionManager};
