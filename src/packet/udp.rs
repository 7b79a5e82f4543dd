//! UDP (RFC 768) datagram codec
//!
//! Inbound datagrams become [`UdpDatagram`] views after length and checksum
//! validation; outbound replies are built with [`encode_datagram`] using
//! the reversed endpoint pair of the flow.

use bytes::{BufMut, BytesMut};

use super::checksum;
use super::endpoint::UdpEndpointPair;
use super::ip::{self, IpPacket, PROTOCOL_UDP};
use crate::error::PacketError;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// A validated view over one UDP datagram
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    /// Flow key derived from the enclosing IP packet and the port fields
    pub endpoints: UdpEndpointPair,
    /// Datagram payload
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Parse the UDP datagram carried by an IP packet.
    ///
    /// The length field must match the IP payload exactly, and the checksum
    /// must verify against the pseudo-header. An all-zero checksum on IPv4
    /// means the sender didn't compute one and is accepted as-is.
    pub fn parse(packet: &IpPacket<'a>) -> Result<Self, PacketError> {
        debug_assert_eq!(packet.protocol(), PROTOCOL_UDP);

        let datagram = packet.payload();
        if datagram.len() < UDP_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: UDP_HEADER_LEN,
                got: datagram.len(),
            });
        }

        let length = usize::from(u16::from_be_bytes([datagram[4], datagram[5]]));
        if length != datagram.len() {
            return Err(PacketError::UdpLengthMismatch {
                header: length,
                payload: datagram.len(),
            });
        }

        let pair = packet.address_pair();
        let stored_checksum = u16::from_be_bytes([datagram[6], datagram[7]]);
        let checksum_absent = stored_checksum == 0 && pair.is_ipv4();
        if !checksum_absent && !checksum::verify_transport(&pair, PROTOCOL_UDP, datagram) {
            return Err(PacketError::TransportChecksum {
                protocol: PROTOCOL_UDP,
            });
        }

        let src_port = u16::from_be_bytes([datagram[0], datagram[1]]);
        let dst_port = u16::from_be_bytes([datagram[2], datagram[3]]);

        Ok(Self {
            endpoints: UdpEndpointPair::new(pair, src_port, dst_port),
            payload: &datagram[UDP_HEADER_LEN..],
        })
    }
}

/// Build a complete IP datagram carrying one UDP datagram.
///
/// A computed checksum of zero is transmitted as 0xffff per RFC 768.
#[must_use]
pub fn encode_datagram(endpoints: &UdpEndpointPair, payload: &[u8]) -> BytesMut {
    let length = (UDP_HEADER_LEN + payload.len()) as u16;

    let mut datagram = BytesMut::with_capacity(usize::from(length));
    datagram.put_u16(endpoints.src_port);
    datagram.put_u16(endpoints.dst_port);
    datagram.put_u16(length);
    datagram.put_u16(0); // checksum, patched below
    datagram.put_slice(payload);

    let mut cs = checksum::transport(&endpoints.addrs, PROTOCOL_UDP, &datagram);
    if cs == 0 {
        cs = 0xffff;
    }
    datagram[6..8].copy_from_slice(&cs.to_be_bytes());

    ip::encode_packet(&endpoints.addrs, PROTOCOL_UDP, &datagram)
}
