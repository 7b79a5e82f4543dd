//! Error types for tun-gateway
//!
//! Errors are categorized by subsystem. Packet-level failures are recovered
//! at the session boundary (the offending datagram is dropped); only TUN
//! device failures are fatal to the gateway as a whole.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Packet parsing or checksum errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// TUN adapter errors
    #[error("TUN error: {0}")]
    Tun(#[from] TunError),

    /// Outbound connection errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// Embedded TCP stack errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// Gateway already running / already stopped
    #[error("Invalid gateway state: {0}")]
    InvalidState(&'static str),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Check if this error is recoverable (the gateway keeps running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Packet(_) => true,
            Self::Tun(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::Stack(e) => e.is_recoverable(),
            Self::InvalidState(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Packet decoding and validation errors
///
/// All of these are recovered by dropping the offending datagram. Malformed
/// packets are logged at debug level; unsupported transports are dropped
/// silently.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer too short for the claimed header
    #[error("Packet truncated: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    /// Version nibble does not match the address family
    #[error("IP version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    /// IPv4 header checksum did not verify
    #[error("IPv4 header checksum mismatch")]
    HeaderChecksum,

    /// TCP/UDP checksum over the pseudo-header did not verify
    #[error("Transport checksum mismatch (protocol {protocol})")]
    TransportChecksum { protocol: u8 },

    /// Total length field exceeds the buffer
    #[error("Total length {total_length} exceeds buffer of {buffer} bytes")]
    LengthOutOfBounds { total_length: usize, buffer: usize },

    /// UDP length field disagrees with the IP payload length
    #[error("UDP length field {header} does not match payload of {payload} bytes")]
    UdpLengthMismatch { header: usize, payload: usize },

    /// Transport protocol other than TCP or UDP
    #[error("Unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),

    /// Source and destination addresses are from different families
    #[error("Address family mismatch in endpoint pair")]
    AddressFamilyMismatch,
}

impl PacketError {
    /// Packet errors never take the gateway down
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Unsupported transports are dropped without logging
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::UnsupportedProtocol(_))
    }
}

/// TUN adapter errors
#[derive(Debug, Error)]
pub enum TunError {
    /// The device was closed from the other side
    #[error("TUN device closed")]
    Closed,

    /// I/O error on the device; fatal to the gateway
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunError {
    /// TUN failures are fatal; a zero-length write is retried by the
    /// writer task before it ever becomes an error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Outbound connection errors
///
/// Any of these stops the owning session cleanly; the host observes a
/// normal timeout or reset from its own stack, and a retransmitted SYN may
/// recreate the flow.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// Failed to bind to the default egress address
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Connection to the destination (or SOCKS5 server) failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// Connection attempt timed out
    #[error("Connection to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: SocketAddr, timeout_secs: u64 },

    /// SOCKS5 handshake failed (method negotiation, CONNECT, or
    /// UDP ASSOCIATE)
    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    /// Destination rejected by policy (IPv6 via SOCKS5 UDP)
    #[error("Destination {addr} not supported in this mode")]
    UnsupportedDestination { addr: SocketAddr },

    /// I/O error during connection setup
    #[error("Outbound I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OutboundError {
    /// Check if this error is recoverable (a later flow may succeed)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } => false,
            Self::ConnectFailed { .. } | Self::Timeout { .. } | Self::Socks5(_) => true,
            Self::UnsupportedDestination { .. } => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a connect-failed error
    pub fn connect_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a SOCKS5 protocol error
    pub fn socks5(reason: impl Into<String>) -> Self {
        Self::Socks5(reason.into())
    }
}

/// Embedded TCP stack errors
#[derive(Debug, Error)]
pub enum StackError {
    /// Could not put a socket into listen state for a new flow
    #[error("Failed to listen on {endpoint}: {reason}")]
    Listen { endpoint: SocketAddr, reason: String },

    /// The stack task is gone; no more flows can be created
    #[error("TCP stack task stopped")]
    Stopped,
}

impl StackError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Listen { .. } => true,
            Self::Stopped => false,
        }
    }
}

/// Type alias for Result with [`GatewayError`]
pub type Result<T> = std::result::Result<T, GatewayError>;
