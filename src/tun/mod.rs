//! TUN adapter
//!
//! The gateway speaks to the TUN device through the [`TunReader`] and
//! [`TunWriter`] traits: byte-oriented, full-duplex, exactly one
//! unencapsulated IP datagram per call. Device creation, addressing, and
//! route installation are owned by the embedding program; any type that
//! can read and write whole datagrams plugs in here.
//!
//! [`channel_tun`] builds an in-memory implementation over tokio channels.
//! It backs the integration tests and suits embedders that already pump
//! the device file descriptor themselves.
//!
//! A write that reports zero bytes is a transient OS condition; the
//! gateway's writer task retries the same buffer after
//! [`WRITE_RETRY_DELAY`]. Other errors propagate and are fatal.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Delay before retrying a zero-length TUN write
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(64);

/// Default depth of the in-memory packet channels
pub const CHANNEL_TUN_DEPTH: usize = 512;

/// Read side of a TUN device
#[async_trait]
pub trait TunReader: Send {
    /// Receive exactly one IP datagram. Blocks until a datagram is
    /// available; an error is fatal to the gateway.
    async fn recv_packet(&mut self) -> io::Result<BytesMut>;
}

/// Write side of a TUN device
#[async_trait]
pub trait TunWriter: Send {
    /// Transmit exactly one IP datagram. Returns the number of bytes
    /// written; zero signals a transient failure and the caller retries
    /// with the same buffer.
    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// In-memory TUN backed by tokio channels
pub struct ChannelTunReader {
    rx: mpsc::Receiver<BytesMut>,
}

#[async_trait]
impl TunReader for ChannelTunReader {
    async fn recv_packet(&mut self) -> io::Result<BytesMut> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "tun channel closed"))
    }
}

/// Write half of the in-memory TUN
pub struct ChannelTunWriter {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl TunWriter for ChannelTunWriter {
    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun channel closed"))?;
        Ok(packet.len())
    }
}

/// Far end of an in-memory TUN: what the "host OS" sees
///
/// `inject` plays the role of the host routing a datagram into the device;
/// `outbound` yields the datagrams the gateway wrote back.
pub struct ChannelTunHandle {
    inject_tx: mpsc::Sender<BytesMut>,
    outbound_rx: mpsc::Receiver<Bytes>,
}

impl ChannelTunHandle {
    /// Deliver one datagram to the gateway, as the host OS would
    ///
    /// # Errors
    ///
    /// Fails if the gateway side has been dropped.
    pub async fn inject(&self, packet: impl Into<BytesMut>) -> io::Result<()> {
        self.inject_tx
            .send(packet.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gateway side closed"))
    }

    /// Receive the next datagram the gateway wrote to the device
    pub async fn outbound(&mut self) -> Option<Bytes> {
        self.outbound_rx.recv().await
    }
}

/// Build an in-memory TUN: the reader/writer pair goes to the gateway, the
/// handle stays with the embedder or test.
#[must_use]
pub fn channel_tun(depth: usize) -> (ChannelTunReader, ChannelTunWriter, ChannelTunHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(depth);
    let (outbound_tx, outbound_rx) = mpsc::channel(depth);

    (
        ChannelTunReader { rx: inject_rx },
        ChannelTunWriter { tx: outbound_tx },
        ChannelTunHandle {
            inject_tx,
            outbound_rx,
        },
    )
}
