//! smoltcp device over in-memory packet queues
//!
//! The embedded stack does not talk to the TUN directly: the stack task
//! pushes TCP datagrams it pulled off the TUN into the RX queue, and
//! everything the stack emits lands in the TX queue, from where it is
//! drained onto the gateway's single TUN send queue. `Medium::Ip` because
//! the TUN carries unencapsulated IP packets.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use smoltcp::phy::{
    Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken,
};
use smoltcp::time::Instant as StackInstant;
use tracing::trace;

/// Maximum queue depth in either direction
const MAX_QUEUE_DEPTH: usize = 256;

/// Packet queues between the stack task and the smoltcp interface
#[derive(Debug, Default)]
pub struct PacketQueue {
    /// Datagrams from the TUN awaiting stack processing
    rx: Mutex<VecDeque<Vec<u8>>>,
    /// Datagrams the stack produced, bound for the TUN
    tx: Mutex<VecDeque<Vec<u8>>>,
}

impl PacketQueue {
    /// Create an empty queue pair
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a datagram for the stack. Returns false when the queue is
    /// full and the packet was dropped; the host's retransmission covers
    /// the loss.
    pub fn push_rx(&self, packet: Vec<u8>) -> bool {
        let mut queue = self.rx.lock();
        if queue.len() >= MAX_QUEUE_DEPTH {
            trace!("stack rx queue full, dropping {} byte packet", packet.len());
            return false;
        }
        queue.push_back(packet);
        true
    }

    /// Take the next datagram for the stack to process
    pub fn pop_rx(&self) -> Option<Vec<u8>> {
        self.rx.lock().pop_front()
    }

    /// Queue a datagram the stack wants transmitted
    pub fn push_tx(&self, packet: Vec<u8>) -> bool {
        let mut queue = self.tx.lock();
        if queue.len() >= MAX_QUEUE_DEPTH {
            trace!("stack tx queue full, dropping {} byte packet", packet.len());
            return false;
        }
        queue.push_back(packet);
        true
    }

    /// Take the next datagram bound for the TUN
    pub fn pop_tx(&self) -> Option<Vec<u8>> {
        self.tx.lock().pop_front()
    }

    /// Whether datagrams are waiting for the TUN
    #[must_use]
    pub fn has_tx(&self) -> bool {
        !self.tx.lock().is_empty()
    }
}

/// Virtual IP-medium device backed by a [`PacketQueue`]
pub struct StackDevice {
    queue: Arc<PacketQueue>,
    mtu: usize,
}

impl StackDevice {
    /// Create a device over a shared queue
    #[must_use]
    pub fn new(queue: Arc<PacketQueue>, mtu: usize) -> Self {
        Self { queue, mtu }
    }

    /// The shared queue
    #[must_use]
    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }
}

impl Device for StackDevice {
    type RxToken<'a>
        = QueueRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = QueueTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _ts: StackInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.queue.pop_rx().map(|packet| {
            (
                QueueRxToken { packet },
                QueueTxToken { queue: &self.queue },
            )
        })
    }

    fn transmit(&mut self, _ts: StackInstant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken { queue: &self.queue })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        // The codec verified inbound checksums already; the stack only
        // needs to compute them on transmit.
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.udp = Checksum::Tx;

        caps
    }
}

/// Receive token handing one queued datagram to the stack
pub struct QueueRxToken {
    packet: Vec<u8>,
}

impl RxToken for QueueRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.packet;
        f(&mut packet)
    }
}

/// Transmit token appending one datagram to the TX queue
pub struct QueueTxToken<'a> {
    queue: &'a Arc<PacketQueue>,
}

impl TxToken for QueueTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queue.push_tx(buffer);
        result
    }
}
