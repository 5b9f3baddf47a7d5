//! Server orchestration: shared core, RTSP accept/connection loops,
//! control-command loop, lifecycle.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::auth::{AuthEngine, UserStore};
use crate::camera::CameraRig;
use crate::config::{ServerConfig, VideoProfile};
use crate::control::{CameraCommand, ControlBus};
use crate::encode::{EncoderSet, EncoderSettings, H264EncoderFactory, JpegEncoder};
use crate::error::{Result, ServerError};
use crate::frame::{CameraDriver, CameraFault, CameraId, FrameBus};
use crate::http::MjpegHttpServer;
use crate::media::rtcp::{self, RtcpPacket, ReceiverReport};
use crate::net;
use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::session::{
    Codec, PortAllocator, Session, SessionManager, TransportBinding, TransportSpec,
    transport::{TcpBinding, UdpBinding},
};
use crate::stream::{self, StreamContext};
use crate::supervisor::{self, Notifier};
use crate::tls;

/// TCP-interleaved and response writes time out after this long.
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Control-socket read timeout; reads retry on expiry until shutdown.
const TCP_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// RTCP listener socket timeout: one minute of silence tears the
/// session down.
const RTCP_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on an RTSP request head or body.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// External media collaborators injected by the host: the OS capture
/// driver, the H.264 encoder factory, and the JPEG encoder.
pub struct MediaBackends {
    pub camera_driver: Arc<dyn CameraDriver>,
    pub h264_factory: H264EncoderFactory,
    pub jpeg_encoder: Arc<dyn JpegEncoder>,
}

/// State shared by every task: protocol handlers, stream loops, RTCP
/// listeners, the supervisor, and the MJPEG HTTP server.
pub struct ServerCore {
    pub config: ServerConfig,
    pub auth: AuthEngine,
    pub sessions: SessionManager,
    pub ports: PortAllocator,
    pub bus: Arc<FrameBus>,
    pub encoders: EncoderSet,
    pub cameras: CameraRig,
    pub jpeg: Arc<dyn JpegEncoder>,
    pub control: ControlBus,
    pub notifier: Notifier,
    /// Server-wide cancellation flag, checked by every loop.
    pub shutdown: Arc<AtomicBool>,
    mjpeg: RwLock<Option<Arc<MjpegHttpServer>>>,
    rtsp_addr: RwLock<Option<SocketAddr>>,
}

impl ServerCore {
    /// Video profile assigned to sessions on `camera`.
    pub fn profile_for(&self, camera: CameraId) -> VideoProfile {
        match camera {
            CameraId::Back => self.config.primary_profile.clone(),
            CameraId::Front => self.config.secondary_profile.clone(),
        }
    }

    /// Address the RTSP listener actually bound (set once started).
    pub fn rtsp_addr(&self) -> Option<SocketAddr> {
        *self.rtsp_addr.read()
    }

    pub fn mjpeg_server(&self) -> Option<Arc<MjpegHttpServer>> {
        self.mjpeg.read().clone()
    }

    pub fn mjpeg_client_count(&self, camera: CameraId) -> usize {
        self.mjpeg
            .read()
            .as_ref()
            .map(|m| m.client_count(camera))
            .unwrap_or(0)
    }

    /// Build the delivery binding negotiated by SETUP.
    pub fn bind_transport(
        &self,
        session: &Session,
        spec: TransportSpec,
        client_ip: IpAddr,
        writer: Arc<Mutex<TcpStream>>,
    ) -> Result<TransportBinding> {
        match spec {
            TransportSpec::Tcp {
                rtp_channel,
                rtcp_channel,
            } => Ok(TransportBinding::Tcp(TcpBinding {
                stream: writer,
                rtp_channel,
                rtcp_channel,
            })),
            TransportSpec::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let bind_ip: IpAddr = self
                    .config
                    .bind_address
                    .parse()
                    .unwrap_or(IpAddr::from([0, 0, 0, 0]));

                // A pair in our allocator can still be taken by another
                // process; skip past a few such pairs before giving up.
                let mut last_error: Option<io::Error> = None;
                for _ in 0..8 {
                    let (rtp_port, rtcp_port) = self.ports.allocate()?;
                    let bind_pair = (|| -> io::Result<_> {
                        let rtp_socket =
                            net::bind_udp_reuse(SocketAddr::new(bind_ip, rtp_port))?;
                        let rtcp_socket =
                            net::bind_udp_reuse(SocketAddr::new(bind_ip, rtcp_port))?;
                        Ok((rtp_socket, rtcp_socket))
                    })();
                    match bind_pair {
                        Ok((rtp_socket, rtcp_socket)) => {
                            return Ok(TransportBinding::Udp(UdpBinding {
                                rtp_socket: Arc::new(rtp_socket),
                                rtcp_socket: Arc::new(rtcp_socket),
                                client_rtp: SocketAddr::new(client_ip, client_rtp),
                                client_rtcp: SocketAddr::new(client_ip, client_rtcp),
                                server_rtp_port: rtp_port,
                                server_rtcp_port: rtcp_port,
                            }));
                        }
                        Err(e) => {
                            self.ports.release(rtp_port);
                            tracing::warn!(session_id = %session.id, rtp_port, error = %e,
                                "UDP bind failed during SETUP, trying next pair");
                            last_error = Some(e);
                        }
                    }
                }
                tracing::error!(session_id = %session.id, "UDP transport setup failed");
                Err(last_error
                    .map(ServerError::Io)
                    .unwrap_or(ServerError::PortRangeExhausted))
            }
        }
    }

    /// Start camera, encoder (for H.264) and the per-client delivery
    /// loop for a session entering PLAY.
    pub fn start_stream(self: &Arc<Self>, session: Arc<Session>) -> Result<()> {
        self.cameras.ensure_started(session.camera)?;

        let ring = match session.codec {
            Codec::H264 => {
                let settings = EncoderSettings::from_profile(&session.profile.lock());
                self.encoders.ensure_running(session.camera, settings)?;
                let ring = self
                    .encoders
                    .subscribe(session.camera, &session.id)
                    .ok_or_else(|| {
                        ServerError::Encoder("encoder pipeline unavailable".to_string())
                    })?;
                Some(ring)
            }
            Codec::Mjpeg => None,
        };

        let ctx = StreamContext {
            core: self.clone(),
            session: session.clone(),
            ring,
        };
        thread::Builder::new()
            .name(format!("stream-{}", session.id))
            .spawn(move || stream::run(ctx))
            .map_err(ServerError::Io)?;
        Ok(())
    }

    /// Remove a session and return every resource it held.
    pub fn release_session(&self, session: &Session) {
        session.stop_playing();
        self.sessions.remove(&session.id);
        if let Some(binding) = session.transport.write().take() {
            if let Some((rtp_port, _)) = binding.server_ports() {
                self.ports.release(rtp_port);
            }
        }
        self.encoders.unsubscribe(session.camera, &session.id);
    }

    /// Feed one client receiver report into the rate controller.
    pub fn apply_receiver_report(&self, session: &Session, report: &ReceiverReport) {
        session.touch();
        let change = {
            let mut profile = session.profile.lock();
            let mut last_raise = session.last_rate_raise.lock();
            rtcp::adapt_profile(&mut profile, report, &mut last_raise, Instant::now())
        };
        if session.codec == Codec::H264 {
            if let Some(bitrate) = change.bitrate {
                self.encoders.set_bitrate(session.camera, bitrate);
            }
        }
    }

    /// Spawn the per-session RTCP listener for a UDP transport.
    pub fn spawn_rtcp_listener(self: &Arc<Self>, session: Arc<Session>) {
        let socket = match session.transport.read().as_ref() {
            Some(TransportBinding::Udp(udp)) => udp.rtcp_socket.clone(),
            _ => return,
        };
        let core = self.clone();
        let name = format!("rtcp-{}", session.id);
        let session_for_err = session.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            if socket.set_read_timeout(Some(RTCP_RECV_TIMEOUT)).is_err() {
                return;
            }
            let mut buf = [0u8; 1500];
            loop {
                if core.shutdown.load(Ordering::SeqCst)
                    || core.sessions.get(&session.id).is_none()
                    || session.is_torn_down()
                {
                    break;
                }
                match socket.recv_from(&mut buf) {
                    Ok((n, _)) => match rtcp::parse(&buf[..n]) {
                        Some(RtcpPacket::ReceiverReport(report)) => {
                            core.apply_receiver_report(&session, &report);
                        }
                        Some(RtcpPacket::Bye) => {
                            tracing::info!(session_id = %session.id, "RTCP BYE received");
                            session.tear_down();
                            break;
                        }
                        _ => {}
                    },
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        tracing::warn!(session_id = %session.id,
                            "no RTCP for 60 s, tearing session down");
                        session.mark_unhealthy();
                        break;
                    }
                    Err(_) => break,
                }
            }
            tracing::debug!(session_id = %session.id, "RTCP listener exited");
        });
        if let Err(e) = spawned {
            tracing::error!(session_id = %session_for_err.id, error = %e, "failed to spawn RTCP listener");
        }
    }
}

/// The embedded RTSP camera server.
///
/// ```no_run
/// # use camstream::{Server, ServerConfig, MediaBackends};
/// # fn backends() -> MediaBackends { unimplemented!() }
/// let mut server = Server::new(ServerConfig::default(), backends());
/// server.start().unwrap();
/// // ... serve until told otherwise ...
/// server.stop();
/// ```
pub struct Server {
    core: Arc<ServerCore>,
    faults_rx: Option<Receiver<CameraFault>>,
    control_rx: Option<Receiver<CameraCommand>>,
    started: bool,
}

impl Server {
    pub fn new(config: ServerConfig, backends: MediaBackends) -> Self {
        let users = UserStore::from_config(&config.users);
        let auth = AuthEngine::new(users, config.auth_required);
        let bus = Arc::new(FrameBus::new());
        let (faults_tx, faults_rx) = mpsc::channel();
        let cameras = CameraRig::new(
            backends.camera_driver,
            bus.clone(),
            config.back_camera_enabled,
            config.front_camera_enabled,
            faults_tx,
        );
        let encoders = EncoderSet::new(bus.clone(), backends.h264_factory);
        let (control, control_rx) = ControlBus::new();

        let core = Arc::new(ServerCore {
            config,
            auth,
            sessions: SessionManager::new(),
            ports: PortAllocator::new(),
            bus,
            encoders,
            cameras,
            jpeg: backends.jpeg_encoder,
            control,
            notifier: Notifier::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            mjpeg: RwLock::new(None),
            rtsp_addr: RwLock::new(None),
        });

        Server {
            core,
            faults_rx: Some(faults_rx),
            control_rx: Some(control_rx),
            started: false,
        }
    }

    /// Shared core, for hosts that need direct access (user management,
    /// subscriptions, tests).
    pub fn core(&self) -> Arc<ServerCore> {
        self.core.clone()
    }

    /// Cloneable control-bus handle.
    pub fn control(&self) -> ControlBus {
        self.core.control.clone()
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.core.shutdown.load(Ordering::SeqCst)
    }

    /// Bind listeners and spawn the worker tasks.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.core.config.bind_address, self.core.config.port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        *self.core.rtsp_addr.write() = Some(listener.local_addr()?);

        let tls_config = if self.core.config.use_https {
            let path = self.core.config.certificate_path.as_ref().ok_or_else(|| {
                ServerError::Config("use_https set without certificate_path".to_string())
            })?;
            Some(tls::load_server_config(
                path,
                self.core.config.certificate_password.as_deref(),
            )?)
        } else {
            None
        };

        let mjpeg = Arc::new(MjpegHttpServer::new(
            &self.core.config.bind_address,
            self.core.config.mjpeg_server_port,
            self.core.config.mjpeg_server_quality,
            self.core.config.auth_required,
            self.core.auth.users().clone(),
            self.core.bus.clone(),
            self.core.jpeg.clone(),
            self.core.control.clone(),
            tls_config,
        ));
        mjpeg.start()?;
        *self.core.mjpeg.write() = Some(mjpeg);

        let faults_rx = self.faults_rx.take().ok_or(ServerError::AlreadyRunning)?;
        let control_rx = self.control_rx.take().ok_or(ServerError::AlreadyRunning)?;

        supervisor::spawn(self.core.clone(), faults_rx)?;

        let core = self.core.clone();
        thread::Builder::new()
            .name("control".to_string())
            .spawn(move || control_loop(core, control_rx))
            .map_err(ServerError::Io)?;

        let core = self.core.clone();
        thread::Builder::new()
            .name("rtsp-accept".to_string())
            .spawn(move || accept_loop(listener, core))
            .map_err(ServerError::Io)?;

        self.started = true;
        tracing::info!(%addr, "RTSP server listening");
        Ok(())
    }

    /// Signal every task to stop and release media resources.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.core.shutdown.store(true, Ordering::SeqCst);
        if let Some(mjpeg) = self.core.mjpeg.read().clone() {
            mjpeg.stop();
        }
        for session in self.core.sessions.all() {
            self.core.release_session(&session);
        }
        for camera in CameraId::ALL {
            self.core.encoders.stop(camera);
        }
        self.core.cameras.stop_all();
        tracing::info!("server stopped");
    }
}

fn control_loop(core: Arc<ServerCore>, rx: Receiver<CameraCommand>) {
    loop {
        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(command) => match command {
                CameraCommand::StartCamera(camera) => {
                    if let Err(e) = core.cameras.ensure_started(camera) {
                        tracing::warn!(%camera, error = %e, "control: camera start failed");
                    }
                }
                CameraCommand::StopCamera(camera) => core.cameras.stop(camera),
                CameraCommand::StartMjpegServer => {
                    if let Some(mjpeg) = core.mjpeg_server() {
                        match mjpeg.start() {
                            Ok(()) => {}
                            Err(ServerError::AlreadyRunning) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "control: MJPEG server start failed")
                            }
                        }
                    }
                }
                CameraCommand::StopMjpegServer => {
                    if let Some(mjpeg) = core.mjpeg_server() {
                        mjpeg.stop();
                    }
                }
                CameraCommand::SwitchCamera => core.cameras.switch_enabled(),
            },
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("control loop exited");
}

fn accept_loop(listener: TcpListener, core: Arc<ServerCore>) {
    let active = Arc::new(AtomicUsize::new(0));
    while !core.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if active.load(Ordering::SeqCst) >= core.config.max_clients {
                    tracing::warn!(%peer, max = core.config.max_clients,
                        "refusing connection, client limit reached");
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);
                let core = core.clone();
                let active = active.clone();
                thread::spawn(move || {
                    Connection::handle(stream, peer, core);
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if !core.shutdown.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "RTSP accept error");
                }
            }
        }
    }
    tracing::debug!("RTSP accept loop exited");
}

/// One RTSP control connection: request/response loop plus inbound
/// `$`-framed RTCP for TCP-interleaved sessions.
struct Connection {
    core: Arc<ServerCore>,
    reader: BufReader<TcpStream>,
    writer: Arc<Mutex<TcpStream>>,
    open: Arc<AtomicBool>,
    handler: MethodHandler,
    peer: SocketAddr,
}

impl Connection {
    fn handle(stream: TcpStream, peer: SocketAddr, core: Arc<ServerCore>) {
        if let Err(e) = Self::setup_socket(&stream) {
            tracing::warn!(%peer, error = %e, "socket setup failed");
            return;
        }
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        tracing::info!(%peer, "client connected");
        let writer = Arc::new(Mutex::new(stream));
        let open = Arc::new(AtomicBool::new(true));
        let handler = MethodHandler::new(core.clone(), peer, writer.clone(), open.clone());

        let mut conn = Connection {
            core,
            reader: BufReader::new(reader_stream),
            writer,
            open,
            handler,
            peer,
        };

        let reason = conn.run();
        conn.open.store(false, Ordering::SeqCst);
        // Sessions notice the closed connection; the supervisor reaps
        // them on its next tick.
        tracing::info!(peer = %conn.peer, reason, "client disconnected");
    }

    fn setup_socket(stream: &TcpStream) -> io::Result<()> {
        net::tune_rtsp_socket(stream)?;
        stream.set_read_timeout(Some(TCP_READ_TIMEOUT))?;
        stream.set_write_timeout(Some(TCP_WRITE_TIMEOUT))?;
        Ok(())
    }

    fn run(&mut self) -> &'static str {
        loop {
            if self.core.shutdown.load(Ordering::SeqCst) {
                return "server shutting down";
            }

            let first = match self.peek_byte() {
                Ok(Some(b)) => b,
                Ok(None) => return "connection closed by client",
                Err(_) => return "read error",
            };

            if first == b'$' {
                if self.read_interleaved().is_err() {
                    return "read error";
                }
                continue;
            }

            let head = match self.read_head() {
                Ok(Some(head)) => head,
                Ok(None) => return "connection closed by client",
                Err(_) => return "read error",
            };
            if head.trim().is_empty() {
                continue;
            }

            let mut request = match RtspRequest::parse(&head) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "request parse error");
                    let resp = RtspResponse::bad_request().add_header("CSeq", "0");
                    if self.write_response(&resp).is_err() {
                        return "write error";
                    }
                    continue;
                }
            };

            let body_len = request.content_length().min(MAX_REQUEST_BYTES);
            if body_len > 0 {
                let mut body = vec![0u8; body_len];
                if self.read_exact_retry(&mut body).is_err() {
                    return "read error";
                }
                request.body = body;
            }

            tracing::debug!(peer = %self.peer, method = %request.method, uri = %request.uri,
                "request");
            let response = self.handler.handle(&request);
            tracing::debug!(peer = %self.peer, status = response.status_code, "response");

            if self.write_response(&response).is_err() {
                return "write error";
            }
        }
    }

    /// Next byte on the control socket without consuming it. `None`
    /// means orderly EOF — the authoritative poll+zero-bytes signal.
    fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        loop {
            match self.reader.fill_buf() {
                Ok([]) => return Ok(None),
                Ok(buf) => return Ok(Some(buf[0])),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if self.core.shutdown.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one `$`-framed interleaved packet and feed odd-channel RTCP
    /// into the rate controller.
    fn read_interleaved(&mut self) -> io::Result<()> {
        let mut header = [0u8; 4];
        self.read_exact_retry(&mut header)?;
        let channel = header[1];
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        self.read_exact_retry(&mut payload)?;

        if channel % 2 == 1 {
            if let Some(packet) = rtcp::parse(&payload) {
                self.dispatch_rtcp(packet);
            }
        }
        Ok(())
    }

    fn dispatch_rtcp(&self, packet: RtcpPacket) {
        for id in self.handler.session_ids() {
            let Some(session) = self.core.sessions.get(id) else {
                continue;
            };
            let is_tcp = session
                .transport
                .read()
                .as_ref()
                .is_some_and(|b| b.is_tcp());
            if !is_tcp {
                continue;
            }
            match packet {
                RtcpPacket::ReceiverReport(report) => {
                    self.core.apply_receiver_report(&session, &report);
                }
                RtcpPacket::Bye => {
                    tracing::info!(session_id = %session.id, "interleaved RTCP BYE");
                    session.tear_down();
                }
                _ => {}
            }
        }
    }

    /// Read the request head: lines through the terminating blank line.
    fn read_head(&mut self) -> io::Result<Option<String>> {
        let mut head = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = self.read_line_retry(&mut line)?;
            if n == 0 {
                return Ok(if head.is_empty() { None } else { Some(lossy(&head)) });
            }
            head.extend_from_slice(&line);
            if head.len() > MAX_REQUEST_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            if line == b"\r\n" || line == b"\n" {
                return Ok(Some(lossy(&head)));
            }
        }
    }

    /// `read_until` that survives socket timeouts; the partial line is
    /// preserved across retries.
    fn read_line_retry(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        loop {
            match self.reader.read_until(b'\n', buf) {
                Ok(n) => return Ok(n),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    if self.core.shutdown.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `read_exact` with progress tracking so timeouts never lose bytes.
    fn read_exact_retry(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-message",
                    ));
                }
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    if self.core.shutdown.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_response(&self, response: &RtspResponse) -> io::Result<()> {
        let mut stream = self.writer.lock();
        stream.write_all(response.serialize().as_bytes())
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
