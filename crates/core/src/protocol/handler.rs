//! RTSP method dispatch for a single client connection.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

use crate::protocol::request::{RtspRequest, StreamTarget};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::ServerCore;
use crate::session::{Codec, Session, TransportSpec, new_session_id};

/// Handles RTSP requests for one TCP connection.
///
/// Tracks the sessions created on this connection so PLAY/TEARDOWN can
/// find them without a `Session` header and so the connection's death
/// propagates to them.
pub struct MethodHandler {
    core: Arc<ServerCore>,
    client_addr: SocketAddr,
    /// Shared write half of the control socket; also carries interleaved
    /// RTP for TCP sessions.
    writer: Arc<Mutex<TcpStream>>,
    /// Cleared by the connection reader at EOF.
    connection_open: Arc<AtomicBool>,
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        core: Arc<ServerCore>,
        client_addr: SocketAddr,
        writer: Arc<Mutex<TcpStream>>,
        connection_open: Arc<AtomicBool>,
    ) -> Self {
        MethodHandler {
            core,
            client_addr,
            writer,
            connection_open,
            session_ids: Vec::new(),
        }
    }

    /// Session IDs owned by this connection.
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().to_string();

        // OPTIONS stays reachable for capability discovery; every other
        // method must authenticate when authentication is on.
        if request.method != "OPTIONS"
            && !self
                .core
                .auth
                .authorize(request.credentials.as_ref(), &request.method)
        {
            tracing::debug!(method = %request.method, peer = %self.client_addr,
                "unauthenticated request challenged");
            return RtspResponse::unauthorized(&self.core.auth.challenge())
                .add_header("CSeq", &cseq);
        }

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(&cseq),
            "DESCRIBE" => self.handle_describe(&cseq, request),
            "SETUP" => self.handle_setup(&cseq, request),
            "PLAY" => self.handle_play(&cseq, request),
            "TEARDOWN" => self.handle_teardown(&cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::method_not_allowed().add_header("CSeq", &cseq)
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN")
    }

    /// Routes the URI, enforcing camera enablement. `Err` carries the
    /// ready-made error response.
    fn route(&self, cseq: &str, uri: &str) -> Result<StreamTarget, RtspResponse> {
        let target = StreamTarget::route(uri).map_err(|_| {
            tracing::warn!(uri, "request for unknown path");
            RtspResponse::not_found().add_header("CSeq", cseq)
        })?;
        if !self.core.cameras.is_enabled(target.camera) {
            tracing::warn!(uri, camera = %target.camera, "request for disabled camera");
            return Err(RtspResponse::bad_request_because(&format!(
                "camera disabled: {}",
                target.camera
            ))
            .add_header("CSeq", cseq));
        }
        Ok(target)
    }

    fn server_ip(&self) -> String {
        self.writer
            .lock()
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| self.core.config.bind_address.clone())
    }

    fn handle_describe(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::debug!(%cseq, uri = %request.uri, "DESCRIBE");
        let target = match self.route(cseq, &request.uri) {
            Ok(t) => t,
            Err(resp) => return resp,
        };

        let parameter_sets = match target.codec {
            Codec::H264 => self.core.encoders.parameter_sets(target.camera),
            Codec::Mjpeg => None,
        };
        let sdp = sdp::generate_sdp(
            &self.server_ip(),
            self.core.config.port,
            target.codec,
            parameter_sets,
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &request.uri)
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let target = match self.route(cseq, &request.uri) {
            Ok(t) => t,
            Err(resp) => return resp,
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let Some(spec) = TransportSpec::parse(transport_header) else {
            tracing::warn!(%cseq, transport = %transport_header, "unsupported transport");
            return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
        };

        // Reuse the session named by the request, otherwise mint one.
        let session = request
            .session_id()
            .and_then(|id| self.core.sessions.get(id))
            .unwrap_or_else(|| {
                let session = Arc::new(Session::new(
                    new_session_id(),
                    target.camera,
                    target.codec,
                    &request.uri,
                    self.core.profile_for(target.camera),
                    self.connection_open.clone(),
                ));
                self.core.sessions.insert(session.clone());
                self.session_ids.push(session.id.clone());
                session
            });

        let binding = match self.core.bind_transport(
            &session,
            spec,
            self.client_addr.ip(),
            self.writer.clone(),
        ) {
            Ok(binding) => binding,
            Err(e) => {
                tracing::error!(%cseq, error = %e, "transport setup failed");
                self.core.release_session(&session);
                self.session_ids.retain(|id| id != &session.id);
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        };

        let transport_response = binding.response_header();
        let is_udp = !binding.is_tcp();
        // A re-SETUP replaces the old binding; return its ports first.
        if let Some(old) = session.transport.write().take() {
            if let Some((rtp_port, _)) = old.server_ports() {
                self.core.ports.release(rtp_port);
            }
        }
        session.set_transport(binding);
        session.touch();

        if is_udp {
            self.core.spawn_rtcp_listener(session.clone());
        }

        tracing::info!(
            session_id = %session.id,
            uri = %request.uri,
            camera = %session.camera,
            codec = %session.codec,
            transport = %transport_response,
            "session created via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    /// PLAY/TEARDOWN session resolution: the `Session` header when
    /// present, otherwise the connection's most recent session.
    fn resolve_session(&self, request: &RtspRequest) -> Option<Arc<Session>> {
        if let Some(id) = request.session_id() {
            return self.core.sessions.get(id);
        }
        self.session_ids
            .iter()
            .rev()
            .find_map(|id| self.core.sessions.get(id))
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            tracing::warn!(%cseq, "PLAY without session state");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if session.transport.read().is_none() {
            tracing::warn!(session_id = %session.id, "PLAY before SETUP completed");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        if !self.core.cameras.is_enabled(session.camera) {
            return RtspResponse::bad_request_because(&format!(
                "camera disabled: {}",
                session.camera
            ))
            .add_header("CSeq", cseq);
        }

        session.touch();
        if !session.is_playing() {
            session.start_playing();
            if let Err(e) = self.core.start_stream(session.clone()) {
                session.stop_playing();
                tracing::error!(session_id = %session.id, error = %e, "failed to start stream");
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        }

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            tracing::warn!(%cseq, "TEARDOWN without session state");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        // Best-effort idempotent: repeated TEARDOWN of a known session
        // answers 200 again. Resources go back via the supervisor.
        session.tear_down();
        session.touch();
        tracing::info!(session_id = %session.id, "session torn down");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }
}
