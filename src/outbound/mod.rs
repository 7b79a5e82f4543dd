//! Outbound connector
//!
//! Opens the sockets that carry flow payloads off the host: either direct
//! (bound to the default egress address so packets leave on the physical
//! interface instead of looping back into the TUN) or through a SOCKS5
//! upstream (CONNECT for TCP, UDP ASSOCIATE for UDP).
//!
//! Any failure here returns an error and the owning session stops cleanly;
//! for TCP the host's SYN retransmit may re-trigger flow creation.

pub mod procinfo;
pub mod socks5;

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{EgressConfig, OutboundMode};
use crate::error::OutboundError;
pub use procinfo::{port_owner, PortOwner, PortProtocol};
pub use socks5::UdpAssociation;

/// Outbound connector shared by all sessions
#[derive(Debug)]
pub struct Connector {
    mode: OutboundMode,
    egress: EgressConfig,
    connect_timeout: Duration,
}

impl Connector {
    /// Create a connector
    #[must_use]
    pub const fn new(mode: OutboundMode, egress: EgressConfig, connect_timeout: Duration) -> Self {
        Self {
            mode,
            egress,
            connect_timeout,
        }
    }

    /// Which mode this connector operates in
    #[must_use]
    pub const fn mode(&self) -> OutboundMode {
        self.mode
    }

    /// Open the outbound TCP stream for a flow.
    ///
    /// `src` is the flow's host-side endpoint, used only for the
    /// process-owner diagnostic.
    pub async fn connect_tcp(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<TcpStream, OutboundError> {
        log_owner(PortProtocol::Tcp, src);

        match self.mode {
            OutboundMode::Direct => self.tcp_connect_bound(dst).await,
            OutboundMode::Socks5 { server } => {
                let mut stream = self.tcp_connect_bound(server).await?;
                socks5::negotiate(&mut stream).await?;
                socks5::connect(&mut stream, dst).await?;
                Ok(stream)
            }
        }
    }

    /// Open the outbound UDP socket for a flow.
    pub async fn connect_udp(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<UdpOutbound, OutboundError> {
        log_owner(PortProtocol::Udp, src);

        match self.mode {
            OutboundMode::Direct => {
                let socket = self.udp_bind(dst).await?;
                socket.connect(dst).await.map_err(|e| {
                    OutboundError::connect_failed(dst, e.to_string())
                })?;
                Ok(UdpOutbound::Direct(socket))
            }
            OutboundMode::Socks5 { server } => {
                // v6 destinations are not relayed; the session stops
                // immediately and the host sees an ordinary timeout.
                if dst.is_ipv6() {
                    return Err(OutboundError::UnsupportedDestination { addr: dst });
                }
                let mut stream = self.tcp_connect_bound(server).await?;
                socks5::negotiate(&mut stream).await?;
                let assoc = UdpAssociation::establish(stream, server).await?;
                Ok(UdpOutbound::Socks5 { assoc, dst })
            }
        }
    }

    /// TCP socket of the destination's family, bound to the default egress
    /// address with an ephemeral port, connected with a timeout.
    async fn tcp_connect_bound(&self, dst: SocketAddr) -> Result<TcpStream, OutboundError> {
        let domain = if dst.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| OutboundError::connect_failed(dst, format!("socket: {e}")))?;

        if let Some(egress) = self.egress.for_destination(dst.ip()) {
            let bind_addr = SocketAddr::new(egress, 0);
            socket
                .bind(&bind_addr.into())
                .map_err(|e| OutboundError::bind(bind_addr, e.to_string()))?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| OutboundError::connect_failed(dst, format!("nonblocking: {e}")))?;

        // Probe dead peers on long-lived flows.
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| OutboundError::connect_failed(dst, format!("keepalive: {e}")))?;

        match socket.connect(&dst.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(OutboundError::connect_failed(dst, e.to_string())),
        }

        let stream = TcpStream::from_std(socket.into())
            .map_err(|e| OutboundError::connect_failed(dst, e.to_string()))?;

        let connected = timeout(self.connect_timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| OutboundError::connect_failed(dst, e.to_string()))?;
            match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => Err(OutboundError::connect_failed(dst, e.to_string())),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("failed to set TCP_NODELAY: {}", e);
                }
                debug!("outbound TCP connected to {}", dst);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OutboundError::Timeout {
                addr: dst,
                timeout_secs: self.connect_timeout.as_secs(),
            }),
        }
    }

    /// UDP socket of the destination's family, bound to the default egress
    /// address with an ephemeral port.
    async fn udp_bind(&self, dst: SocketAddr) -> Result<UdpSocket, OutboundError> {
        let bind_addr = match self.egress.for_destination(dst.ip()) {
            Some(egress) => SocketAddr::new(egress, 0),
            None => {
                if dst.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                }
            }
        };

        UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| OutboundError::bind(bind_addr, e.to_string()))
    }
}

/// Outbound UDP socket: direct or relayed
#[derive(Debug)]
pub enum UdpOutbound {
    /// Connected socket bound to the default egress
    Direct(UdpSocket),
    /// SOCKS5 relay association
    Socks5 {
        /// Live association
        assoc: UdpAssociation,
        /// Flow destination; relay datagrams from other sources are dropped
        dst: SocketAddr,
    },
}

impl UdpOutbound {
    /// Send one datagram to the flow's destination
    pub async fn send(&self, payload: &[u8]) -> Result<usize, OutboundError> {
        match self {
            Self::Direct(socket) => socket.send(payload).await.map_err(OutboundError::Io),
            Self::Socks5 { assoc, dst } => assoc.send_to(payload, *dst).await,
        }
    }

    /// Receive one datagram from the flow's destination into `buf`
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, OutboundError> {
        match self {
            Self::Direct(socket) => socket.recv(buf).await.map_err(OutboundError::Io),
            Self::Socks5 { assoc, dst } => loop {
                let (n, from) = assoc.recv_from(buf).await?;
                if from == *dst {
                    return Ok(n);
                }
                debug!("dropping relay datagram from unexpected source {}", from);
            },
        }
    }

    /// The local address of the underlying socket
    pub fn local_addr(&self) -> Result<SocketAddr, OutboundError> {
        match self {
            Self::Direct(socket) => socket.local_addr().map_err(OutboundError::Io),
            Self::Socks5 { assoc, .. } => Ok(assoc.relay_addr()),
        }
    }
}

fn log_owner(protocol: PortProtocol, src: SocketAddr) {
    match port_owner(protocol, src.port()) {
        Some(owner) => info!("local port {} owned by {}", src.port(), owner),
        None => debug!("no owner found for local port {}", src.port()),
    }
}
