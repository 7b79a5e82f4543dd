//! tun-gateway: userspace tun2socks flow gateway
//!
//! Attaches to a host TUN device, terminates the IP/TCP/UDP flows the OS
//! routes into it, and re-originates their payloads as ordinary sockets
//! bound to the host's default physical interface, optionally via a
//! SOCKS5 upstream. Host applications get transparently proxied with no
//! per-application configuration.
//!
//! # Architecture
//!
//! ```text
//! TUN ⇒ codec.decode ⇒ flow table ⇒ session ⇒ outbound socket
//!                          |            |
//!                          |       TCP: embedded stack (smoltcp)
//!                          |       UDP: datagram pairing + idle timer
//!                          |
//! TUN ⇐ single send queue ⇐ codec.encode / stack output
//! ```
//!
//! TCP flows are driven by an embedded userland TCP/IP stack so the host
//! OS observes a normal peer: handshake, windowing, retransmission, and
//! TIME_WAIT all happen in process. UDP flows are stateless pairings with
//! a ten-second sliding idle timer.
//!
//! # Quick start
//!
//! ```no_run
//! use tun_gateway::{channel_tun, EgressConfig, Gateway, GatewayConfig};
//!
//! # async fn example() -> tun_gateway::Result<()> {
//! // The embedding program owns TUN creation and routing; here the
//! // device is an in-memory pair.
//! let (reader, writer, _handle) = channel_tun(512);
//!
//! let config = GatewayConfig::default().with_egress(EgressConfig::discover());
//! let mut gateway = Gateway::start(config, Box::new(reader), Box::new(writer))?;
//!
//! // ... traffic flows ...
//!
//! gateway.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`packet`]: IPv4/IPv6/TCP/UDP codec and flow keys
//! - [`tun`]: TUN adapter traits and the in-memory device
//! - [`flow`]: the flow table
//! - [`session`]: per-flow TCP/UDP proxy sessions
//! - [`stack`]: the embedded TCP stack task
//! - [`outbound`]: direct and SOCKS5 connectors
//! - [`gateway`]: the controller and lifecycle
//! - [`config`]: configuration types
//! - [`error`]: error hierarchy

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod outbound;
pub mod packet;
pub mod session;
pub mod stack;
pub mod tun;

// Re-export the embedding surface at the crate root
pub use config::{
    EgressConfig, GatewayConfig, OutboundMode, TunAddressV4, TunAddressV6, TunConfig,
    UdpSessionConfig,
};
pub use error::{GatewayError, OutboundError, PacketError, Result, StackError, TunError};
pub use flow::{FlowStats, FlowStatsSnapshot, FlowTable};
pub use gateway::{Gateway, GatewayStats, GatewayStatsSnapshot};
pub use outbound::{Connector, UdpOutbound};
pub use packet::{AddressPair, IpPacket, TcpEndpointPair, TcpSegment, UdpDatagram, UdpEndpointPair};
pub use tun::{channel_tun, ChannelTunHandle, TunReader, TunWriter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
