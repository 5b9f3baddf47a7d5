//! RTSP response building and serialization (RFC 2326 §7).
//!
//! ```text
//! RTSP/1.0 200 OK\r\n
//! CSeq: 1\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 142\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! Builder pattern — chain [`add_header`](RtspResponse::add_header) and
//! [`with_body`](RtspResponse::with_body), then
//! [`serialize`](RtspResponse::serialize). `Content-Length` is computed
//! automatically when a body is present.

/// Server identification string included in every response
/// (RFC 2326 §12.36).
pub const SERVER_AGENT: &str = "camstream/0.1";

#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK — success.
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request — malformed request or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 400 with a short plain-text explanation (e.g. disabled camera).
    pub fn bad_request_because(reason: &str) -> Self {
        Self::bad_request().with_body(format!("{reason}\r\n"))
    }

    /// 401 Unauthorized with a fresh challenge.
    pub fn unauthorized(challenge: &str) -> Self {
        Self::new(401, "Unauthorized").add_header("WWW-Authenticate", challenge)
    }

    /// 404 Not Found — no stream at the requested path.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 405 Method Not Allowed — syntactically valid but unsupported method.
    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed")
    }

    /// 454 Session Not Found — PLAY/TEARDOWN without session state.
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 461 Unsupported Transport.
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    /// 500 Internal Server Error — e.g. port exhaustion during SETUP.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format. `Content-Length` is
    /// appended automatically when a body is present (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}
