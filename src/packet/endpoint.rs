//! Address- and endpoint-pair value types
//!
//! Endpoint pairs identify flows in the flow table. `src` and `dst` are
//! always from the host's point of view: `src` is the host application,
//! `dst` the remote peer. Replies are synthesized with [`reversed`]
//! pairs.
//!
//! [`reversed`]: TcpEndpointPair::reversed

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::PacketError;

/// A source/destination IP address pair of one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    /// Source address (the host application side)
    pub src: IpAddr,
    /// Destination address (the remote peer)
    pub dst: IpAddr,
}

impl AddressPair {
    /// Create a new address pair.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::AddressFamilyMismatch`] if the addresses are
    /// from different families.
    pub fn new(src: IpAddr, dst: IpAddr) -> Result<Self, PacketError> {
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(PacketError::AddressFamilyMismatch);
        }
        Ok(Self { src, dst })
    }

    /// Whether this pair is IPv4
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        self.src.is_ipv4()
    }

    /// IP version number (4 or 6)
    #[must_use]
    pub const fn version(&self) -> u8 {
        if self.src.is_ipv4() {
            4
        } else {
            6
        }
    }

    /// The pair with src and dst swapped
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A TCP flow key: address pair plus ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpEndpointPair {
    /// Addresses, host application to remote peer
    pub addrs: AddressPair,
    /// Source port (host application)
    pub src_port: u16,
    /// Destination port (remote peer)
    pub dst_port: u16,
}

impl TcpEndpointPair {
    /// Create a new TCP endpoint pair
    #[must_use]
    pub const fn new(addrs: AddressPair, src_port: u16, dst_port: u16) -> Self {
        Self {
            addrs,
            src_port,
            dst_port,
        }
    }

    /// Source endpoint as a socket address
    #[must_use]
    pub const fn src(&self) -> SocketAddr {
        SocketAddr::new(self.addrs.src, self.src_port)
    }

    /// Destination endpoint as a socket address
    #[must_use]
    pub const fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.addrs.dst, self.dst_port)
    }

    /// The pair with both addresses and ports swapped, for replies
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            addrs: self.addrs.reversed(),
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for TcpEndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp {} -> {}", self.src(), self.dst())
    }
}

/// A UDP flow key: address pair plus ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpEndpointPair {
    /// Addresses, host application to remote peer
    pub addrs: AddressPair,
    /// Source port (host application)
    pub src_port: u16,
    /// Destination port (remote peer)
    pub dst_port: u16,
}

impl UdpEndpointPair {
    /// Create a new UDP endpoint pair
    #[must_use]
    pub const fn new(addrs: AddressPair, src_port: u16, dst_port: u16) -> Self {
        Self {
            addrs,
            src_port,
            dst_port,
        }
    }

    /// Source endpoint as a socket address
    #[must_use]
    pub const fn src(&self) -> SocketAddr {
        SocketAddr::new(self.addrs.src, self.src_port)
    }

    /// Destination endpoint as a socket address
    #[must_use]
    pub const fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.addrs.dst, self.dst_port)
    }

    /// The pair with both addresses and ports swapped, for replies
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            addrs: self.addrs.reversed(),
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for UdpEndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp {} -> {}", self.src(), self.dst())
    }
}
