//! Transport negotiation and the negotiated delivery bindings
//! (RFC 2326 §12.39).
//!
//! SETUP's `Transport` header picks one of two delivery modes:
//!
//! ```text
//! Client → Server:  Transport: RTP/AVP;unicast;client_port=5000-5001
//! Server → Client:  Transport: RTP/AVP;unicast;client_port=5000-5001;server_port=5002-5003
//!
//! Client → Server:  Transport: RTP/AVP/TCP;unicast;interleaved=0-1
//! Server → Client:  Transport: RTP/AVP/TCP;unicast;interleaved=0-1
//! ```
//!
//! UDP sessions get a bound server socket pair; TCP-interleaved sessions
//! frame RTP/RTCP onto the control socket as `$ channel len_hi len_lo
//! payload` (RFC 2326 §10.12), RTP on the even channel and RTCP on the
//! odd one.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

/// Client-requested transport parameters parsed from the header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    Udp { client_rtp: u16, client_rtcp: u16 },
    Tcp { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportSpec {
    /// Parse a `Transport` header value.
    ///
    /// `interleaved=a-b` (or an `RTP/AVP/TCP` profile) selects TCP with
    /// channels defaulting to 0-1; `client_port=a-b` selects UDP.
    /// Returns `None` for anything else — the handler answers 461.
    pub fn parse(header: &str) -> Option<Self> {
        if !header.contains("RTP/AVP") {
            return None;
        }

        let mut interleaved: Option<(u8, u8)> = None;
        let mut client_ports: Option<(u16, u16)> = None;

        for part in header.split(';') {
            let part = part.trim();
            if let Some(range) = part.strip_prefix("interleaved=") {
                interleaved = Some(parse_pair(range).unwrap_or((0, 1)));
            } else if let Some(range) = part.strip_prefix("client_port=") {
                client_ports = parse_pair(range);
            }
        }

        if header.contains("RTP/AVP/TCP") || interleaved.is_some() {
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            return Some(TransportSpec::Tcp {
                rtp_channel,
                rtcp_channel,
            });
        }
        if let Some((client_rtp, client_rtcp)) = client_ports {
            return Some(TransportSpec::Udp {
                client_rtp,
                client_rtcp,
            });
        }
        None
    }
}

fn parse_pair<T: std::str::FromStr>(range: &str) -> Option<(T, T)> {
    let (a, b) = range.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// UDP delivery: a bound server socket pair addressing the client's
/// negotiated endpoints.
pub struct UdpBinding {
    pub rtp_socket: Arc<UdpSocket>,
    pub rtcp_socket: Arc<UdpSocket>,
    pub client_rtp: SocketAddr,
    pub client_rtcp: SocketAddr,
    pub server_rtp_port: u16,
    pub server_rtcp_port: u16,
}

/// TCP-interleaved delivery over the shared control socket.
pub struct TcpBinding {
    /// The RTSP connection's write half; RTSP responses and interleaved
    /// frames serialize through this one lock.
    pub stream: Arc<Mutex<TcpStream>>,
    pub rtp_channel: u8,
    pub rtcp_channel: u8,
}

/// The negotiated delivery path for one session.
pub enum TransportBinding {
    Udp(UdpBinding),
    Tcp(TcpBinding),
}

impl TransportBinding {
    /// Send one RTP packet to the client.
    pub fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
        match self {
            TransportBinding::Udp(udp) => {
                udp.rtp_socket.send_to(packet, udp.client_rtp)?;
                Ok(())
            }
            TransportBinding::Tcp(tcp) => tcp.send_interleaved(tcp.rtp_channel, packet),
        }
    }

    /// Send one RTCP packet (odd channel / odd port).
    pub fn send_rtcp(&self, packet: &[u8]) -> io::Result<()> {
        match self {
            TransportBinding::Udp(udp) => {
                udp.rtcp_socket.send_to(packet, udp.client_rtcp)?;
                Ok(())
            }
            TransportBinding::Tcp(tcp) => tcp.send_interleaved(tcp.rtcp_channel, packet),
        }
    }

    /// Consecutive send errors tolerated before the session dies:
    /// 5 for UDP, 3 for TCP.
    pub fn send_error_limit(&self) -> u32 {
        match self {
            TransportBinding::Udp(_) => 5,
            TransportBinding::Tcp(_) => 3,
        }
    }

    /// The mirrored `Transport` response header value.
    pub fn response_header(&self) -> String {
        match self {
            TransportBinding::Udp(udp) => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                udp.client_rtp.port(),
                udp.client_rtcp.port(),
                udp.server_rtp_port,
                udp.server_rtcp_port
            ),
            TransportBinding::Tcp(tcp) => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                tcp.rtp_channel, tcp.rtcp_channel
            ),
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            TransportBinding::Udp(udp) => {
                format!("udp rtp={} rtcp={}", udp.client_rtp, udp.client_rtcp)
            }
            TransportBinding::Tcp(tcp) => {
                format!("tcp interleaved={}-{}", tcp.rtp_channel, tcp.rtcp_channel)
            }
        }
    }

    /// Server UDP port pair to release on teardown, if any.
    pub fn server_ports(&self) -> Option<(u16, u16)> {
        match self {
            TransportBinding::Udp(udp) => Some((udp.server_rtp_port, udp.server_rtcp_port)),
            TransportBinding::Tcp(_) => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, TransportBinding::Tcp(_))
    }
}

impl TcpBinding {
    /// Frame one packet per RFC 2326 §10.12: `$`, channel byte, 16-bit
    /// big-endian length, payload. Built as a single buffer so the write
    /// is atomic under the stream lock.
    fn send_interleaved(&self, channel: u8, packet: &[u8]) -> io::Result<()> {
        if packet.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interleaved payload exceeds 16-bit length",
            ));
        }
        let mut framed = Vec::with_capacity(4 + packet.len());
        framed.push(b'$');
        framed.push(channel);
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(packet);

        let mut stream = self.stream.lock();
        stream.write_all(&framed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn parse_udp() {
        let spec = TransportSpec::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Udp {
                client_rtp: 5000,
                client_rtcp: 5001
            }
        );
    }

    #[test]
    fn parse_tcp_interleaved() {
        let spec = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Tcp {
                rtp_channel: 2,
                rtcp_channel: 3
            }
        );
    }

    #[test]
    fn parse_tcp_defaults_channels() {
        let spec = TransportSpec::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Tcp {
                rtp_channel: 0,
                rtcp_channel: 1
            }
        );
        // Malformed channel range also falls back to 0-1.
        let spec = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=x-y").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Tcp {
                rtp_channel: 0,
                rtcp_channel: 1
            }
        );
    }

    #[test]
    fn parse_unsupported() {
        assert!(TransportSpec::parse("RTP/AVP;multicast").is_none());
        assert!(TransportSpec::parse("RTP/AVP;unicast").is_none());
        assert!(TransportSpec::parse("RAW/RAW/UDP").is_none());
    }

    #[test]
    fn interleaved_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let binding = TcpBinding {
            stream: Arc::new(Mutex::new(client)),
            rtp_channel: 0,
            rtcp_channel: 1,
        };
        binding.send_interleaved(0, &[0xAA, 0xBB, 0xCC]).unwrap();

        let mut buf = [0u8; 7];
        server_side.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [b'$', 0, 0, 3, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn udp_binding_response_header() {
        let rtp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let rtcp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let binding = TransportBinding::Udp(UdpBinding {
            rtp_socket: rtp,
            rtcp_socket: rtcp,
            client_rtp: "127.0.0.1:5000".parse().unwrap(),
            client_rtcp: "127.0.0.1:5001".parse().unwrap(),
            server_rtp_port: 5002,
            server_rtcp_port: 5003,
        });
        assert_eq!(
            binding.response_header(),
            "RTP/AVP;unicast;client_port=5000-5001;server_port=5002-5003"
        );
        assert_eq!(binding.server_ports(), Some((5002, 5003)));
        assert_eq!(binding.send_error_limit(), 5);
    }

    #[test]
    fn udp_send_reaches_client() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let rtp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let rtcp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let binding = TransportBinding::Udp(UdpBinding {
            rtp_socket: rtp,
            rtcp_socket: rtcp,
            client_rtp: client.local_addr().unwrap(),
            client_rtcp: client.local_addr().unwrap(),
            server_rtp_port: 0,
            server_rtcp_port: 0,
        });
        binding.send_rtp(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }
}
