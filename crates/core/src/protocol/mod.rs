//! RTSP protocol implementation (RFC 2326).
//!
//! Text-based signaling: request parsing, response building, method
//! routing, SDP generation.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/live RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - `$`-framed binary interleaving shares the control socket
//!   (RFC 2326 §10.12).
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (UDP ports or channels) |
//! | PLAY | §10.5 | Start media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//!
//! Anything else — including PAUSE and GET_PARAMETER — answers 405.

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::{RtspRequest, StreamTarget};
pub use response::RtspResponse;
