//! Packet codec: IPv4/IPv6/TCP/UDP parsing and synthesis
//!
//! This module implements the wire formats the gateway speaks on the TUN
//! side. Received datagrams are parsed into zero-copy views ([`IpPacket`],
//! [`TcpSegment`], [`UdpDatagram`]); outgoing datagrams are materialized
//! into owned buffers with all checksums computed.
//!
//! # Layout
//!
//! - [`checksum`]: one's-complement Internet checksum, including the
//!   IPv4/IPv6 pseudo-headers used by TCP and UDP
//! - [`endpoint`]: address- and endpoint-pair value types used as flow keys
//! - [`ip`]: IPv4 (RFC 791) and IPv6 (RFC 8200) header codec
//! - [`tcp`]: TCP (RFC 9293) segment codec
//! - [`udp`]: UDP (RFC 768) datagram codec
//!
//! # Byte order
//!
//! Ports and lengths are network byte order on the wire and host byte order
//! in the types exposed here.

pub mod checksum;
pub mod endpoint;
pub mod ip;
pub mod tcp;
pub mod udp;

pub use endpoint::{AddressPair, TcpEndpointPair, UdpEndpointPair};
pub use ip::{IpPacket, PROTOCOL_TCP, PROTOCOL_UDP};
pub use tcp::TcpSegment;
pub use udp::UdpDatagram;
