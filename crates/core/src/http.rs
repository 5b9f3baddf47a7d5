//! MJPEG HTTP server: `multipart/x-mixed-replace` delivery.
//!
//! `GET /Back/` and `GET /Front/` stream JPEG frames as multipart parts
//! over chunked transfer encoding, optionally behind Basic auth and
//! TLS. Frames come from the frame bus; each camera has one fanout
//! thread that encodes once per frame period (~30 fps cap) and writes to
//! every subscriber with a 2 s per-write timeout. Slow clients are
//! dropped, never allowed to backpressure the producer. The first
//! client's arrival requests camera start over the control bus; once the
//! last client leaves, the supervisor stops the camera.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use base64::prelude::{BASE64_STANDARD, Engine as _};
use parking_lot::Mutex;

use crate::auth::UserStore;
use crate::control::{CameraCommand, ControlBus};
use crate::encode::JpegEncoder;
use crate::error::{Result, ServerError};
use crate::frame::{CAMERA_COUNT, CameraId, FrameBus};
use crate::net::peer_closed;

/// Multipart boundary token advertised in the Content-Type header.
const BOUNDARY: &str = "--frame";

/// Per-write timeout; a client slower than this is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame period cap (~30 fps).
const FRAME_PERIOD: Duration = Duration::from_millis(33);

/// Plain or TLS client stream.
enum ClientStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Plain(s) => s.read(buf),
            ClientStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Plain(s) => s.write(buf),
            ClientStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ClientStream::Plain(s) => s.flush(),
            ClientStream::Tls(s) => s.flush(),
        }
    }
}

struct HttpClient {
    stream: ClientStream,
    /// Underlying socket, kept for liveness probing.
    tcp: TcpStream,
    peer: SocketAddr,
}

struct HttpShared {
    bind_address: String,
    port: u16,
    quality: u8,
    auth_required: bool,
    users: UserStore,
    bus: Arc<FrameBus>,
    jpeg: Arc<dyn JpegEncoder>,
    control: ControlBus,
    tls: Option<Arc<rustls::ServerConfig>>,
    running: AtomicBool,
    clients: [Mutex<Vec<HttpClient>>; CAMERA_COUNT],
}

/// The MJPEG HTTP server. Start/stoppable at runtime through the
/// control bus.
pub struct MjpegHttpServer {
    shared: Arc<HttpShared>,
}

impl MjpegHttpServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_address: &str,
        port: u16,
        quality: u8,
        auth_required: bool,
        users: UserStore,
        bus: Arc<FrameBus>,
        jpeg: Arc<dyn JpegEncoder>,
        control: ControlBus,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            shared: Arc::new(HttpShared {
                bind_address: bind_address.to_string(),
                port,
                quality,
                auth_required,
                users,
                bus,
                jpeg,
                control,
                tls,
                running: AtomicBool::new(false),
                clients: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.shared.bind_address, self.shared.port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        tracing::info!(
            %addr,
            https = self.shared.tls.is_some(),
            "MJPEG HTTP server listening"
        );

        let shared = self.shared.clone();
        thread::Builder::new()
            .name("mjpeg-accept".to_string())
            .spawn(move || accept_loop(listener, shared))
            .map_err(ServerError::Io)?;

        for camera in CameraId::ALL {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name(format!("mjpeg-fanout-{camera}"))
                .spawn(move || fanout_loop(shared, camera))
                .map_err(ServerError::Io)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            for camera in CameraId::ALL {
                self.shared.clients[camera.index()].lock().clear();
            }
            tracing::info!("MJPEG HTTP server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Connected subscriber count for one camera, read by the supervisor
    /// when deciding whether a camera still has consumers.
    pub fn client_count(&self, camera: CameraId) -> usize {
        self.shared.clients[camera.index()].lock().len()
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<HttpShared>) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, peer, &shared) {
                        tracing::debug!(%peer, error = %e, "MJPEG connection rejected");
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "MJPEG accept error");
                }
            }
        }
    }
    tracing::debug!("MJPEG accept loop exited");
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: &Arc<HttpShared>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let tcp = stream.try_clone()?;

    let mut client_stream = match &shared.tls {
        Some(config) => {
            let conn = rustls::ServerConnection::new(config.clone())
                .map_err(|e| ServerError::Tls(e.to_string()))?;
            ClientStream::Tls(Box::new(rustls::StreamOwned::new(conn, stream)))
        }
        None => ClientStream::Plain(stream),
    };

    let request = read_request_head(&mut client_stream)?;
    let (method, path) = parse_request_line(&request)?;
    if method != "GET" {
        write_simple(&mut client_stream, "405 Method Not Allowed", "")?;
        return Ok(());
    }

    let camera = match route(&path) {
        Some(camera) => camera,
        None => {
            write_simple(&mut client_stream, "404 Not Found", "no such stream\r\n")?;
            return Ok(());
        }
    };

    if shared.auth_required && !basic_authorized(&request, &shared.users) {
        tracing::debug!(%peer, "MJPEG client failed Basic auth");
        let extra = "WWW-Authenticate: Basic realm=\"RTSP Server\"\r\n";
        write_response_head(&mut client_stream, "401 Unauthorized", extra, "")?;
        return Ok(());
    }

    // Response head for the endless multipart stream.
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={BOUNDARY}\r\n\
         Transfer-Encoding: chunked\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\n\
         Pragma: no-cache\r\n\
         Connection: close\r\n\r\n"
    );
    client_stream.write_all(head.as_bytes())?;

    tracing::info!(%peer, %camera, "MJPEG client connected");
    shared.control.send(CameraCommand::StartCamera(camera));

    shared.clients[camera.index()].lock().push(HttpClient {
        stream: client_stream,
        tcp,
        peer,
    });
    Ok(())
}

/// Per-camera fanout: encode the latest frame once per period, write the
/// part to every subscriber, drop the slow and the dead.
fn fanout_loop(shared: Arc<HttpShared>, camera: CameraId) {
    let mut last_pts: Option<u64> = None;

    while shared.running.load(Ordering::SeqCst) {
        let started = Instant::now();

        let clients = &shared.clients[camera.index()];
        if clients.lock().is_empty() {
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        // Cull closed peers even when no frame is flowing.
        clients.lock().retain(|c| {
            let open = !peer_closed(&c.tcp);
            if !open {
                tracing::info!(peer = %c.peer, %camera, "MJPEG client disconnected");
            }
            open
        });

        let Some(frame) = shared.bus.latest(camera) else {
            thread::sleep(FRAME_PERIOD);
            continue;
        };
        if last_pts == Some(frame.pts_ns) {
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        last_pts = Some(frame.pts_ns);

        let jpeg = match shared.jpeg.encode(&frame, shared.quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::error!(%camera, error = %e, "MJPEG encode failed");
                thread::sleep(FRAME_PERIOD);
                continue;
            }
        };

        let mut part = Vec::with_capacity(jpeg.len() + 128);
        part.extend_from_slice(
            format!(
                "{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            )
            .as_bytes(),
        );
        part.extend_from_slice(&jpeg);
        part.extend_from_slice(b"\r\n");

        clients.lock().retain_mut(|client| {
            match write_chunk(&mut client.stream, &part) {
                Ok(()) => true,
                Err(e) => {
                    tracing::info!(peer = %client.peer, %camera, error = %e,
                        "dropping slow MJPEG client");
                    false
                }
            }
        });

        if let Some(left) = FRAME_PERIOD.checked_sub(started.elapsed()) {
            thread::sleep(left);
        }
    }
    tracing::debug!(%camera, "MJPEG fanout exited");
}

/// One chunked-transfer chunk: hex length, CRLF, data, CRLF.
fn write_chunk(stream: &mut ClientStream, data: &[u8]) -> std::io::Result<()> {
    write!(stream, "{:x}\r\n", data.len())?;
    stream.write_all(data)?;
    stream.write_all(b"\r\n")?;
    stream.flush()
}

fn read_request_head(stream: &mut ClientStream) -> Result<Vec<String>> {
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end().to_string();
        if trimmed.is_empty() {
            break;
        }
        lines.push(trimmed);
        if lines.len() > 64 {
            return Err(ServerError::Parse {
                kind: crate::error::ParseErrorKind::InvalidHeader,
            });
        }
    }
    if lines.is_empty() {
        return Err(ServerError::Parse {
            kind: crate::error::ParseErrorKind::EmptyRequest,
        });
    }
    Ok(lines)
}

fn parse_request_line(request: &[String]) -> Result<(String, String)> {
    let parts: Vec<&str> = request[0].split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ServerError::Parse {
            kind: crate::error::ParseErrorKind::InvalidRequestLine,
        });
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

fn route(path: &str) -> Option<CameraId> {
    match path.trim_end_matches('/') {
        "/Back" => Some(CameraId::Back),
        "/Front" => Some(CameraId::Front),
        _ => None,
    }
}

fn basic_authorized(request: &[String], users: &UserStore) -> bool {
    let Some(value) = request.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("Authorization")
            .then(|| value.trim())
    }) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => users.verify(user, pass),
        None => false,
    }
}

fn write_simple(stream: &mut ClientStream, status: &str, body: &str) -> Result<()> {
    write_response_head(stream, status, "", body)
}

fn write_response_head(
    stream: &mut ClientStream,
    status: &str,
    extra_headers: &str,
    body: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}
