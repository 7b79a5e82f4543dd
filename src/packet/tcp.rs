//! TCP (RFC 9293) segment codec
//!
//! Inbound segments are validated views used for flow demultiplexing; the
//! embedded stack consumes the raw datagram afterwards. [`encode_segment`]
//! builds a complete IP datagram around a synthesized segment and exists
//! primarily for the host-side peers in the test suite.

use bytes::{BufMut, BytesMut};

use super::checksum;
use super::endpoint::TcpEndpointPair;
use super::ip::{self, IpPacket, PROTOCOL_TCP};
use crate::error::PacketError;

/// Minimum TCP header length (no options)
pub const TCP_HEADER_LEN: usize = 20;

/// FIN flag
pub const FLAG_FIN: u8 = 0x01;
/// SYN flag
pub const FLAG_SYN: u8 = 0x02;
/// RST flag
pub const FLAG_RST: u8 = 0x04;
/// PSH flag
pub const FLAG_PSH: u8 = 0x08;
/// ACK flag
pub const FLAG_ACK: u8 = 0x10;

/// A validated view over one TCP segment
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    /// Flow key derived from the enclosing IP packet and the port fields
    pub endpoints: TcpEndpointPair,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number (meaningful when ACK is set)
    pub ack: u32,
    /// Flag bits (low byte of the flags field)
    pub flags: u8,
    /// Advertised receive window
    pub window: u16,
    /// Segment payload
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Parse the TCP segment carried by an IP packet, verifying the
    /// transport checksum against the pseudo-header.
    pub fn parse(packet: &IpPacket<'a>) -> Result<Self, PacketError> {
        debug_assert_eq!(packet.protocol(), PROTOCOL_TCP);

        let segment = packet.payload();
        if segment.len() < TCP_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: TCP_HEADER_LEN,
                got: segment.len(),
            });
        }

        let data_offset = usize::from(segment[12] >> 4) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
            return Err(PacketError::Truncated {
                needed: data_offset,
                got: segment.len(),
            });
        }

        let pair = packet.address_pair();
        if !checksum::verify_transport(&pair, PROTOCOL_TCP, segment) {
            return Err(PacketError::TransportChecksum {
                protocol: PROTOCOL_TCP,
            });
        }

        let src_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);

        Ok(Self {
            endpoints: TcpEndpointPair::new(pair, src_port, dst_port),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            flags: segment[13],
            window: u16::from_be_bytes([segment[14], segment[15]]),
            payload: &segment[data_offset..],
        })
    }

    /// Whether SYN is set
    #[must_use]
    pub const fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    /// Whether ACK is set
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    /// Whether RST is set
    #[must_use]
    pub const fn is_rst(&self) -> bool {
        self.flags & FLAG_RST != 0
    }

    /// Whether FIN is set
    #[must_use]
    pub const fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }
}

/// Build a complete IP datagram carrying one TCP segment.
///
/// The transport checksum is computed with the pseudo-header matching the
/// pair's address family. No TCP options are emitted.
#[must_use]
pub fn encode_segment(
    endpoints: &TcpEndpointPair,
    flags: u8,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
) -> BytesMut {
    let mut segment = BytesMut::with_capacity(TCP_HEADER_LEN + payload.len());
    segment.put_u16(endpoints.src_port);
    segment.put_u16(endpoints.dst_port);
    segment.put_u32(seq);
    segment.put_u32(ack);
    segment.put_u8(((TCP_HEADER_LEN / 4) as u8) << 4);
    segment.put_u8(flags);
    segment.put_u16(window);
    segment.put_u16(0); // checksum, patched below
    segment.put_u16(0); // urgent pointer
    segment.put_slice(payload);

    let cs = checksum::transport(&endpoints.addrs, PROTOCOL_TCP, &segment);
    segment[16..18].copy_from_slice(&cs.to_be_bytes());

    ip::encode_packet(&endpoints.addrs, PROTOCOL_TCP, &segment)
}
