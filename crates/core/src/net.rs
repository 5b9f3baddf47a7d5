//! Socket tuning and liveness probing.

use std::io;
use std::net::{TcpStream, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Send/receive buffer size for RTSP client sockets. Sized to favor
/// latency over throughput.
const RTSP_SOCKET_BUFFER: usize = 64 * 1024;

/// Tune an accepted RTSP client socket: Nagle off, ~64 KiB buffers.
pub fn tune_rtsp_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_send_buffer_size(RTSP_SOCKET_BUFFER)?;
    sock.set_recv_buffer_size(RTSP_SOCKET_BUFFER)?;
    Ok(())
}

/// Bind a UDP socket on `addr` with SO_REUSEADDR set before the bind.
pub fn bind_udp_reuse(addr: std::net::SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Authoritative TCP liveness probe.
///
/// A socket's connected flag is unreliable; the real signal is a
/// poll-for-read that reports readable with zero bytes available, which
/// means the peer closed. A `WouldBlock` peek means the peer is alive
/// with nothing to say.
pub fn peer_closed(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    let was_blocking = stream.set_nonblocking(true).is_ok();
    let closed = match stream.peek(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    if was_blocking {
        let _ = stream.set_nonblocking(false);
    }
    closed
}

/// True for send errors that mean the peer is unreachable and the
/// session must die immediately rather than after the retry budget.
pub fn is_fatal_send_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
