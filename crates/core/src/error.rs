//! Error types for the camera streaming server.

use std::fmt;

/// Errors that can occur across the server stack.
///
/// Variants map to specific failure modes:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io), [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`TransportNotConfigured`](Self::TransportNotConfigured).
/// - **Media**: [`Encoder`](Self::Encoder), [`Camera`](Self::Camera),
///   [`CameraDisabled`](Self::CameraDisabled).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning), [`Tls`](Self::Tls),
///   [`Config`](Self::Config).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No session with the given ID exists in the
    /// [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session (no transport negotiated).
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// Server-side UDP port allocation exhausted the 5000–65000 range.
    #[error("UDP port range exhausted")]
    PortRangeExhausted,

    /// The requested camera is disabled in the server configuration.
    #[error("camera disabled: {0}")]
    CameraDisabled(&'static str),

    /// H.264 or JPEG encoder failure.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// Camera driver failure.
    #[error("camera error: {0}")]
    Camera(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// TLS material could not be loaded or applied.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// Connection closed before `Content-Length` bytes of body arrived.
    TruncatedBody,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::TruncatedBody => write!(f, "truncated body"),
        }
    }
}

/// Convenience alias for `Result<T, ServerError>`.
pub type Result<T> = std::result::Result<T, ServerError>;
