//! SOCKS5 client (RFC 1928)
//!
//! Implements the pieces of SOCKS5 the gateway needs: no-auth method
//! negotiation, CONNECT for TCP flows, and UDP ASSOCIATE plus the relay
//! packet encapsulation for UDP flows. Target addresses are always passed
//! as IP literals; this gateway never proxies hostnames.
//!
//! # UDP relay packet format (RFC 1928 §7)
//!
//! ```text
//! +------+------+------+----------+----------+----------+
//! | RSV  | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+------+------+----------+----------+----------+
//! |  2   |  1   |  1   | Variable |    2     | Variable |
//! +------+------+------+----------+----------+----------+
//! ```
//!
//! Fragmented relay packets (FRAG != 0) are not supported and are dropped.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::error::OutboundError;

/// SOCKS protocol version
pub const SOCKS5_VERSION: u8 = 0x05;
/// "No authentication required" method
pub const AUTH_METHOD_NONE: u8 = 0x00;
/// "No acceptable methods" reply
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xff;
/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;
/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain address type (parsed in replies, never sent)
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;
/// Success reply code
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Human-readable text for a SOCKS5 reply code
#[must_use]
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Perform no-auth method negotiation on a fresh connection to the server.
pub async fn negotiate(stream: &mut TcpStream) -> Result<(), OutboundError> {
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
        .await
        .map_err(|e| OutboundError::socks5(format!("write methods failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| OutboundError::socks5(format!("read method response failed: {e}")))?;

    if response[0] != SOCKS5_VERSION {
        return Err(OutboundError::socks5(format!(
            "invalid version: expected {SOCKS5_VERSION}, got {}",
            response[0]
        )));
    }
    match response[1] {
        AUTH_METHOD_NONE => {
            trace!("SOCKS5 server selected no authentication");
            Ok(())
        }
        AUTH_METHOD_NO_ACCEPTABLE => {
            Err(OutboundError::socks5("no acceptable authentication method"))
        }
        other => Err(OutboundError::socks5(format!(
            "unsupported auth method selected: {other:#04x}"
        ))),
    }
}

fn put_address(request: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
    }
    request.extend_from_slice(&addr.port().to_be_bytes());
}

/// Send a command (CONNECT or UDP ASSOCIATE) and parse the reply, returning
/// the server's bound address.
async fn request(
    stream: &mut TcpStream,
    command: u8,
    addr: SocketAddr,
) -> Result<SocketAddr, OutboundError> {
    let mut req = Vec::with_capacity(22);
    req.push(SOCKS5_VERSION);
    req.push(command);
    req.push(0x00); // reserved
    put_address(&mut req, addr);

    stream
        .write_all(&req)
        .await
        .map_err(|e| OutboundError::socks5(format!("write request failed: {e}")))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| OutboundError::socks5(format!("read reply failed: {e}")))?;

    if header[0] != SOCKS5_VERSION {
        return Err(OutboundError::socks5(format!(
            "invalid reply version {:#04x}",
            header[0]
        )));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(OutboundError::socks5(format!(
            "server replied {:#04x}: {}",
            header[1],
            reply_message(header[1])
        )));
    }

    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| OutboundError::socks5(format!("read bound addr failed: {e}")))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            SocketAddr::new(ip.into(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| OutboundError::socks5(format!("read bound addr failed: {e}")))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            SocketAddr::new(
                Ipv6Addr::from(octets).into(),
                u16::from_be_bytes([buf[16], buf[17]]),
            )
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| OutboundError::socks5(format!("read bound domain failed: {e}")))?;
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            stream
                .read_exact(&mut rest)
                .await
                .map_err(|e| OutboundError::socks5(format!("read bound domain failed: {e}")))?;
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)
        }
        other => {
            return Err(OutboundError::socks5(format!(
                "invalid bound address type {other:#04x}"
            )));
        }
    };

    trace!("SOCKS5 reply bound address: {}", bound);
    Ok(bound)
}

/// Issue CONNECT for a TCP destination on a negotiated stream.
pub async fn connect(stream: &mut TcpStream, dst: SocketAddr) -> Result<(), OutboundError> {
    let _bound = request(stream, CMD_CONNECT, dst).await?;
    debug!("SOCKS5 CONNECT to {} succeeded", dst);
    Ok(())
}

/// A live UDP ASSOCIATE: relay endpoint, local relay socket, and the TCP
/// control connection that must stay open for the association's lifetime.
#[derive(Debug)]
pub struct UdpAssociation {
    // Dropping the control connection terminates the association server-side.
    _control: TcpStream,
    relay: SocketAddr,
    socket: UdpSocket,
}

impl UdpAssociation {
    /// Complete UDP ASSOCIATE on a negotiated control stream and bind a
    /// local relay socket.
    ///
    /// The client address in the request is left unspecified; the server
    /// learns our address from the first relay datagram.
    pub async fn establish(
        mut control: TcpStream,
        server: SocketAddr,
    ) -> Result<Self, OutboundError> {
        let unspecified = if server.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };

        let mut relay = request(&mut control, CMD_UDP_ASSOCIATE, unspecified).await?;

        // Some servers answer with an unspecified address; the relay then
        // lives on the server's own IP.
        if relay.ip().is_unspecified() {
            relay.set_ip(server.ip());
        }

        let socket = UdpSocket::bind(unspecified)
            .await
            .map_err(|e| OutboundError::socks5(format!("relay socket bind failed: {e}")))?;

        debug!("SOCKS5 UDP association established, relay {}", relay);

        Ok(Self {
            _control: control,
            relay,
            socket,
        })
    }

    /// The relay endpoint datagrams are exchanged with
    #[must_use]
    pub const fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    /// Send one payload to `dst` through the relay
    pub async fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<usize, OutboundError> {
        let packet = encode_relay_packet(dst, payload);
        self.socket
            .send_to(&packet, self.relay)
            .await
            .map_err(OutboundError::Io)?;
        Ok(payload.len())
    }

    /// Receive one payload from the relay. Returns the payload length
    /// (copied to the front of `buf`) and the remote source address.
    /// Fragmented or malformed relay packets are skipped.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), OutboundError> {
        let mut relay_buf = vec![0u8; buf.len() + MAX_RELAY_HEADER];
        loop {
            let (n, _from) = self
                .socket
                .recv_from(&mut relay_buf)
                .await
                .map_err(OutboundError::Io)?;

            match decode_relay_packet(&relay_buf[..n]) {
                Some((from, payload)) => {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok((len, from));
                }
                None => {
                    trace!("dropping malformed or fragmented relay packet");
                }
            }
        }
    }
}

/// Largest relay header: RSV(2) + FRAG(1) + ATYP(1) + IPv6(16) + PORT(2)
const MAX_RELAY_HEADER: usize = 22;

/// Encapsulate a payload for the relay
#[must_use]
pub fn encode_relay_packet(dst: SocketAddr, payload: &[u8]) -> BytesMut {
    let mut packet = BytesMut::with_capacity(MAX_RELAY_HEADER + payload.len());
    packet.put_u16(0); // RSV
    packet.put_u8(0); // FRAG
    match dst.ip() {
        IpAddr::V4(v4) => {
            packet.put_u8(ATYP_IPV4);
            packet.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            packet.put_u8(ATYP_IPV6);
            packet.put_slice(&v6.octets());
        }
    }
    packet.put_u16(dst.port());
    packet.put_slice(payload);
    packet
}

/// Decapsulate a relay packet; `None` for fragments and malformed input
#[must_use]
pub fn decode_relay_packet(packet: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if packet.len() < 4 || packet[0] != 0 || packet[1] != 0 {
        return None;
    }
    if packet[2] != 0 {
        // Fragment; reassembly is optional per RFC 1928 and unsupported here.
        return None;
    }

    match packet[3] {
        ATYP_IPV4 => {
            if packet.len() < 10 {
                return None;
            }
            let ip = Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7]);
            let port = u16::from_be_bytes([packet[8], packet[9]]);
            Some((SocketAddr::new(ip.into(), port), &packet[10..]))
        }
        ATYP_IPV6 => {
            if packet.len() < 22 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[4..20]);
            let port = u16::from_be_bytes([packet[20], packet[21]]);
            Some((SocketAddr::new(Ipv6Addr::from(octets).into(), port), &packet[22..]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_reply_messages() {
        assert_eq!(reply_message(REPLY_SUCCEEDED), "succeeded");
        assert_eq!(reply_message(0x05), "connection refused");
        assert_eq!(reply_message(0x99), "unknown error");
    }

    #[test]
    fn test_relay_packet_roundtrip_v4() {
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let packet = encode_relay_packet(dst, b"ping");
        let (from, payload) = decode_relay_packet(&packet).unwrap();
        assert_eq!(from, dst);
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn test_relay_packet_roundtrip_v6() {
        let dst: SocketAddr = "[2606:4700:4700::1111]:53".parse().unwrap();
        let packet = encode_relay_packet(dst, b"ping6");
        let (from, payload) = decode_relay_packet(&packet).unwrap();
        assert_eq!(from, dst);
        assert_eq!(payload, b"ping6");
    }

    #[test]
    fn test_relay_fragment_dropped() {
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let mut packet = encode_relay_packet(dst, b"ping").to_vec();
        packet[2] = 1;
        assert!(decode_relay_packet(&packet).is_none());
    }

    #[test]
    fn test_relay_malformed_dropped() {
        assert!(decode_relay_packet(&[]).is_none());
        assert!(decode_relay_packet(&[0, 0, 0, ATYP_IPV4, 1, 2]).is_none());
        assert!(decode_relay_packet(&[1, 0, 0, ATYP_IPV4, 1, 2, 3, 4, 0, 80]).is_none());
    }

    /// Minimal SOCKS5 server accepting one connection: negotiation plus one
    /// command, answering with the given reply code.
    async fn mock_server(listener: TcpListener, reply_code: u8) -> (u8, SocketAddr) {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut header = [0u8; 2];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], SOCKS5_VERSION);
        let mut methods = vec![0u8; usize::from(header[1])];
        socket.read_exact(&mut methods).await.unwrap();
        socket
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])
            .await
            .unwrap();

        let mut req = [0u8; 4];
        socket.read_exact(&mut req).await.unwrap();
        let target = match req[3] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                socket.read_exact(&mut buf).await.unwrap();
                SocketAddr::new(
                    Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]).into(),
                    u16::from_be_bytes([buf[4], buf[5]]),
                )
            }
            _ => panic!("unexpected ATYP"),
        };

        let mut reply = vec![SOCKS5_VERSION, reply_code, 0x00, ATYP_IPV4];
        reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        socket.write_all(&reply).await.unwrap();

        // Keep the connection alive long enough for the client to finish.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        (req[1], target)
    }

    #[tokio::test]
    async fn test_negotiate_and_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(mock_server(listener, REPLY_SUCCEEDED));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut stream).await.unwrap();
        let dst: SocketAddr = "1.1.1.1:80".parse().unwrap();
        connect(&mut stream, dst).await.unwrap();

        let (command, target) = server.await.unwrap();
        assert_eq!(command, CMD_CONNECT);
        assert_eq!(target, dst);
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_server(listener, 0x05));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut stream).await.unwrap();
        let err = connect(&mut stream, "1.1.1.1:80".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_udp_associate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(mock_server(listener, REPLY_SUCCEEDED));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut stream).await.unwrap();
        let assoc = UdpAssociation::establish(stream, addr).await.unwrap();

        // Unspecified bound address falls back to the server's IP.
        assert_eq!(assoc.relay_addr().ip(), addr.ip());

        let (command, _) = server.await.unwrap();
        assert_eq!(command, CMD_UDP_ASSOCIATE);
    }
}
