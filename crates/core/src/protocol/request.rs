//! RTSP request parsing and URI routing.

use crate::auth::Credentials;
use crate::error::{ParseErrorKind, ServerError};
use crate::frame::CameraId;
use crate::session::Codec;

/// A parsed RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The
/// `Authorization` header is parsed eagerly into
/// [`credentials`](Self::credentials); the body is read separately by
/// the connection after the blank line, `Content-Length` bytes long.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, ...).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/live/front`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
    /// Typed `Authorization` header, when present and well-formed.
    pub credentials: Option<Credentials>,
    /// Request body (`Content-Length` bytes).
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse the head of an RTSP request (request line + headers).
    ///
    /// The caller attaches the body afterwards, having read
    /// [`content_length`](Self::content_length) bytes from the socket.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(ServerError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ServerError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line.find(':').ok_or(ServerError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        let credentials = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Authorization"))
            .and_then(|(_, value)| Credentials::parse(value));

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            credentials,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The CSeq value echoed into the response. Requests without CSeq
    /// use `"0"`.
    pub fn cseq(&self) -> &str {
        self.get_header("CSeq").unwrap_or("0")
    }

    /// Body length announced by `Content-Length`.
    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Session ID from the `Session` header, with any `;timeout=` suffix
    /// stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }

    /// Serialize back to the RTSP wire format (used by tests to verify
    /// parse/serialize round-trips).
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out
    }
}

/// Where a request URI routes: which camera, which codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTarget {
    pub camera: CameraId,
    pub codec: Codec,
}

/// Routing failure, mapped to a response status by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    UnknownPath,
}

impl StreamTarget {
    /// Route an RTSP URI's path.
    ///
    /// `/live/front` → front camera, `/live/back` and `/live` → back
    /// camera; a trailing `/mjpeg` selects the MJPEG codec, otherwise
    /// H.264. Anything else is a 404.
    pub fn route(uri: &str) -> Result<Self, RouteError> {
        let path = extract_path(uri);
        let (path, codec) = match path.strip_suffix("/mjpeg") {
            Some(base) => (base, Codec::Mjpeg),
            None => (path, Codec::H264),
        };
        let camera = match path {
            "/live/front" => CameraId::Front,
            "/live/back" | "/live" => CameraId::Back,
            _ => return Err(RouteError::UnknownPath),
        };
        Ok(StreamTarget { camera, codec })
    }
}

/// Extract the path component of an RTSP URI.
///
/// `rtsp://host:7778/live/front` → `/live/front`; a bare path passes
/// through unchanged.
pub fn extract_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else {
        uri
    };
    // Ignore query strings and trailing slashes.
    let path = path.split('?').next().unwrap_or(path);
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:7778/live RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:7778/live");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), "1");
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:7778/live RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq(), "3");
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
    }

    #[test]
    fn parse_empty_and_malformed() {
        assert!(RtspRequest::parse("").is_err());
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
        assert!(RtspRequest::parse("OPTIONS / RTSP/1.0\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn missing_cseq_defaults_to_zero() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.cseq(), "0");
    }

    #[test]
    fn content_length_parsed() {
        let raw = "DESCRIBE rtsp://h/live RTSP/1.0\r\nContent-Length: 17\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.content_length(), 17);
    }

    #[test]
    fn session_header_timeout_stripped() {
        let raw = "PLAY rtsp://h/live RTSP/1.0\r\nSession: 0011aabbccddeeff;timeout=60\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.session_id(), Some("0011aabbccddeeff"));
    }

    #[test]
    fn authorization_parsed_eagerly() {
        use base64::prelude::{BASE64_STANDARD, Engine as _};
        let raw = format!(
            "DESCRIBE rtsp://h/live RTSP/1.0\r\nAuthorization: Basic {}\r\n\r\n",
            BASE64_STANDARD.encode("admin:pw")
        );
        let req = RtspRequest::parse(&raw).unwrap();
        assert!(matches!(req.credentials, Some(Credentials::Basic { .. })));
    }

    #[test]
    fn parse_serialize_roundtrip() {
        let raw = "SETUP rtsp://h:7778/live/front RTSP/1.0\r\n\
                   CSeq: 7\r\n\
                   Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        let reparsed = RtspRequest::parse(&req.serialize()).unwrap();
        assert_eq!(reparsed.method, req.method);
        assert_eq!(reparsed.uri, req.uri);
        assert_eq!(reparsed.version, req.version);
        assert_eq!(reparsed.headers, req.headers);
    }

    #[test]
    fn routing_table() {
        let t = StreamTarget::route("rtsp://h:7778/live/front").unwrap();
        assert_eq!(t.camera, CameraId::Front);
        assert_eq!(t.codec, Codec::H264);

        let t = StreamTarget::route("rtsp://h/live/back").unwrap();
        assert_eq!(t.camera, CameraId::Back);

        let t = StreamTarget::route("rtsp://h/live").unwrap();
        assert_eq!(t.camera, CameraId::Back);

        let t = StreamTarget::route("rtsp://h/live/front/mjpeg").unwrap();
        assert_eq!(t.camera, CameraId::Front);
        assert_eq!(t.codec, Codec::Mjpeg);

        let t = StreamTarget::route("/live/mjpeg").unwrap();
        assert_eq!(t.camera, CameraId::Back);
        assert_eq!(t.codec, Codec::Mjpeg);

        assert!(StreamTarget::route("rtsp://h/other").is_err());
        assert!(StreamTarget::route("/").is_err());
    }

    #[test]
    fn path_extraction() {
        assert_eq!(extract_path("rtsp://h:7778/live/front"), "/live/front");
        assert_eq!(extract_path("rtsp://h"), "/");
        assert_eq!(extract_path("/live"), "/live");
        assert_eq!(extract_path("rtsp://h/live/"), "/live");
        assert_eq!(extract_path("rtsp://h/live?token=x"), "/live");
    }
}
