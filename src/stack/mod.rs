//! Embedded userland TCP stack
//!
//! TCP flows are terminated by a smoltcp interface confined to a single
//! task; smoltcp is not reentrant, so the interface, socket set, and
//! device never leave it. Everything else talks to the task through
//! [`StackHandle`].
//!
//! # Per-flow lifecycle
//!
//! ```text
//! SYN on TUN -> flow table entry (Connecting) -> outbound connect
//!     -> StackEvent::Open { buffered SYN, connected stream }
//!     -> listening socket bound to the flow's destination
//!     -> buffered SYN injected -> SYN/ACK -> Established
//!     -> pump tasks bridge the stack socket and the outbound stream
//! ```
//!
//! The listening socket is created only after the outbound connect
//! resolves, so a failed connect never answers the host's SYN; the host
//! retransmits and may re-trigger flow creation.
//!
//! # Backpressure
//!
//! Tunnel ⇒ remote: socket data is only consumed while the per-flow
//! channel to the write pump has capacity; once it fills, data stays in
//! the socket buffer and the advertised window closes.
//!
//! Remote ⇒ tunnel: the read pump sends one chunk at a time and waits for
//! the stack to acknowledge that the whole chunk entered the socket's
//! transmit buffer before reading more.

mod device;

pub use device::{PacketQueue, StackDevice};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as StackInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::TunConfig;
use crate::error::StackError;
use crate::flow::{FlowStats, FlowTable};
use crate::packet::TcpEndpointPair;

/// Receive buffer per TCP socket; doubles as the advertised window
pub const TCP_RX_BUFFER: usize = 65536;

/// Transmit buffer per TCP socket
pub const TCP_TX_BUFFER: usize = 65536;

/// Timer granularity: retransmission and TIME_WAIT deadlines are late by
/// at most one tick
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Depth of the event channel into the stack task
const EVENT_CHANNEL_DEPTH: usize = 512;

/// Chunks in flight per flow toward the outbound socket before the
/// receive window starts closing
const TO_REMOTE_DEPTH: usize = 16;

/// Read size toward either socket
const CHUNK_SIZE: usize = 16384;

/// Events consumed by the stack task
pub enum StackEvent {
    /// A TCP datagram from the TUN for an active flow
    Inject(BytesMut),
    /// Outbound connect resolved; create the flow's socket
    Open(FlowOpen),
    /// One chunk from the remote; `done` fires when the chunk has fully
    /// entered the socket's transmit buffer
    Outbound {
        /// Socket of the owning flow
        handle: SocketHandle,
        /// Generation guard against socket-handle reuse
        flow_id: u64,
        /// Chunk payload
        data: Bytes,
        /// Completion acknowledgement
        done: oneshot::Sender<()>,
    },
    /// The remote closed its write side
    OutboundEof {
        /// Socket of the owning flow
        handle: SocketHandle,
        /// Generation guard against socket-handle reuse
        flow_id: u64,
    },
    /// Fatal outbound error; reset the tunnel side
    Abort {
        /// Socket of the owning flow
        handle: SocketHandle,
        /// Generation guard against socket-handle reuse
        flow_id: u64,
    },
    /// Stop the stack task
    Shutdown,
}

/// Payload of [`StackEvent::Open`]
pub struct FlowOpen {
    /// Flow key
    pub key: TcpEndpointPair,
    /// The SYN that created the flow, replayed into the stack once the
    /// listening socket exists
    pub syn: BytesMut,
    /// Connected outbound stream
    pub stream: TcpStream,
}

/// Cheap handle for submitting events to the stack task
#[derive(Clone)]
pub struct StackHandle {
    events_tx: mpsc::Sender<StackEvent>,
}

impl StackHandle {
    /// Submit an event.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Stopped`] when the stack task is gone.
    pub async fn send(&self, event: StackEvent) -> Result<(), StackError> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| StackError::Stopped)
    }
}

/// Spawn the stack task. Returns the event handle and the task handle.
#[must_use]
pub fn spawn(
    tun: &TunConfig,
    table: Arc<FlowTable>,
    tun_tx: mpsc::Sender<Bytes>,
) -> (StackHandle, JoinHandle<()>) {
    let queue = PacketQueue::new();
    let mut stack_device = StackDevice::new(Arc::clone(&queue), tun.mtu);

    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut iface = Interface::new(config, &mut stack_device, StackInstant::now());

    // The interface impersonates every flow destination; accept any
    // destination address and answer from it.
    iface.set_any_ip(true);
    iface.update_ip_addrs(|addrs| {
        let v4 = Ipv4Address::from_bytes(&tun.ipv4.addr.octets());
        let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(v4), tun.ipv4.prefix_len));
        if let Some(ref v6) = tun.ipv6 {
            let addr = Ipv6Address::from_bytes(&v6.addr.octets());
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(addr), v6.prefix_len));
        }
    });
    let _ = iface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Address::from_bytes(&tun.ipv4.addr.octets()));
    if let Some(ref v6) = tun.ipv6 {
        let _ = iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Address::from_bytes(&v6.addr.octets()));
    }

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    let handle = StackHandle {
        events_tx: events_tx.clone(),
    };

    let task = StackTask {
        iface,
        device: stack_device,
        sockets: SocketSet::new(Vec::new()),
        flows: HashMap::new(),
        next_flow_id: 0,
        events_tx,
        events_rx,
        table,
        tun_tx,
    };

    (handle, tokio::spawn(task.run()))
}

struct PendingWrite {
    data: Bytes,
    offset: usize,
    done: oneshot::Sender<()>,
}

struct FlowState {
    key: TcpEndpointPair,
    /// Generation id; socket handles are reused by the socket set, this
    /// never is
    flow_id: u64,
    stats: Arc<FlowStats>,
    /// Channel toward the write pump; `None` once the tunnel-side FIN has
    /// been propagated
    to_remote: Option<mpsc::Sender<Bytes>>,
    pending: Option<PendingWrite>,
    remote_eof: bool,
    close_sent: bool,
    established: bool,
}

struct StackTask {
    iface: Interface,
    device: StackDevice,
    sockets: SocketSet<'static>,
    flows: HashMap<SocketHandle, FlowState>,
    next_flow_id: u64,
    events_tx: mpsc::Sender<StackEvent>,
    events_rx: mpsc::Receiver<StackEvent>,
    table: Arc<FlowTable>,
    tun_tx: mpsc::Sender<Bytes>,
}

impl StackTask {
    async fn run(mut self) {
        debug!("tcp stack task started");

        loop {
            self.poll().await;

            let delay = self
                .iface
                .poll_delay(StackInstant::now(), &self.sockets)
                .map_or(TICK_INTERVAL, Into::into)
                .min(TICK_INTERVAL);

            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    if self.handle_event(event) {
                        break;
                    }
                    // Drain whatever queued up behind it before re-polling.
                    while let Ok(event) = self.events_rx.try_recv() {
                        if self.handle_event(event) {
                            return;
                        }
                    }
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        debug!("tcp stack task stopped");
    }

    /// Returns true on shutdown.
    fn handle_event(&mut self, event: StackEvent) -> bool {
        match event {
            StackEvent::Inject(packet) => {
                self.device.queue().push_rx(packet.to_vec());
            }
            StackEvent::Open(open) => self.open_flow(open),
            StackEvent::Outbound {
                handle,
                flow_id,
                data,
                done,
            } => {
                if let Some(flow) = self
                    .flows
                    .get_mut(&handle)
                    .filter(|flow| flow.flow_id == flow_id)
                {
                    debug_assert!(flow.pending.is_none(), "chunk sent before ack");
                    flow.pending = Some(PendingWrite {
                        data,
                        offset: 0,
                        done,
                    });
                }
                // Stale handle: flow already gone, dropping `done` stops
                // the read pump.
            }
            StackEvent::OutboundEof { handle, flow_id } => {
                if let Some(flow) = self
                    .flows
                    .get_mut(&handle)
                    .filter(|flow| flow.flow_id == flow_id)
                {
                    flow.remote_eof = true;
                }
            }
            StackEvent::Abort { handle, flow_id } => {
                let live = self
                    .flows
                    .get(&handle)
                    .is_some_and(|flow| flow.flow_id == flow_id);
                if live {
                    self.sockets.get_mut::<tcp::Socket>(handle).abort();
                }
            }
            StackEvent::Shutdown => {
                let handles: Vec<_> = self.flows.keys().copied().collect();
                for handle in handles {
                    self.sockets.get_mut::<tcp::Socket>(handle).abort();
                    self.cleanup(handle);
                }
                return true;
            }
        }
        false
    }

    fn open_flow(&mut self, open: FlowOpen) {
        let Some(entry) = self.table.tcp_get(&open.key) else {
            // Flow was torn down while the connect resolved.
            return;
        };

        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUFFER]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUFFER]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);

        let endpoint = IpEndpoint::new(stack_addr(open.key.addrs.dst), open.key.dst_port);
        if let Err(e) = socket.listen(endpoint) {
            warn!("listen on {} failed: {:?}", open.key.dst(), e);
            self.table.tcp_remove(&open.key);
            return;
        }

        let handle = self.sockets.add(socket);
        let flow_id = self.next_flow_id;
        self.next_flow_id += 1;

        let (to_remote_tx, to_remote_rx) = mpsc::channel(TO_REMOTE_DEPTH);
        let (read_half, write_half) = open.stream.into_split();

        tokio::spawn(write_pump(
            to_remote_rx,
            write_half,
            self.events_tx.clone(),
            handle,
            flow_id,
            Arc::clone(&entry.stats),
        ));
        tokio::spawn(read_pump(
            read_half,
            self.events_tx.clone(),
            handle,
            flow_id,
            Arc::clone(&entry.stats),
        ));

        self.flows.insert(
            handle,
            FlowState {
                key: open.key,
                flow_id,
                stats: Arc::clone(&entry.stats),
                to_remote: Some(to_remote_tx),
                pending: None,
                remote_eof: false,
                close_sent: false,
                established: false,
            },
        );
        entry.set_active();

        // Replay the SYN now that a socket is listening for it.
        self.device.queue().push_rx(open.syn.to_vec());
        trace!("flow opened, socket listening on {}", open.key.dst());
    }

    /// Poll the interface and service flows until quiescent, forwarding
    /// produced packets to the TUN send queue.
    async fn poll(&mut self) {
        loop {
            let _ = self
                .iface
                .poll(StackInstant::now(), &mut self.device, &mut self.sockets);
            self.flush_output().await;
            if !self.service_flows() {
                break;
            }
        }
    }

    async fn flush_output(&mut self) {
        while let Some(packet) = self.device.queue().pop_tx() {
            if self.tun_tx.send(Bytes::from(packet)).await.is_err() {
                return;
            }
        }
    }

    /// Move bytes between sockets and pumps. Returns true if anything
    /// changed that warrants another interface poll.
    fn service_flows(&mut self) -> bool {
        let mut progress = false;
        let mut closed = Vec::new();

        for (&handle, flow) in &mut self.flows {
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);

            if !flow.established && socket.state() == tcp::State::Established {
                flow.established = true;
                debug!("tcp established: {}", flow.key);
            }

            // Tunnel => remote, gated by write-pump channel capacity.
            while socket.can_recv() {
                let Some(tx) = flow.to_remote.clone() else {
                    break;
                };
                match tx.try_reserve() {
                    Ok(permit) => {
                        let mut chunk = vec![0u8; CHUNK_SIZE];
                        match socket.recv_slice(&mut chunk) {
                            Ok(n) if n > 0 => {
                                chunk.truncate(n);
                                permit.send(Bytes::from(chunk));
                                progress = true;
                            }
                            _ => break,
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(())) => break,
                    Err(mpsc::error::TrySendError::Closed(())) => {
                        flow.to_remote = None;
                        break;
                    }
                };
            }

            // Host sent FIN and the receive buffer is drained: propagate a
            // shutdown to the remote by closing the pump channel.
            if flow.established
                && flow.to_remote.is_some()
                && !socket.may_recv()
                && !socket.can_recv()
            {
                flow.to_remote = None;
                progress = true;
            }

            // Remote => tunnel, one acknowledged chunk at a time.
            if let Some(pending) = flow.pending.as_mut() {
                while pending.offset < pending.data.len() && socket.can_send() {
                    match socket.send_slice(&pending.data[pending.offset..]) {
                        Ok(n) if n > 0 => {
                            pending.offset += n;
                            progress = true;
                        }
                        _ => break,
                    }
                }
                if pending.offset >= pending.data.len() {
                    if let Some(done) = flow.pending.take().map(|p| p.done) {
                        let _ = done.send(());
                    }
                }
            }

            // Remote EOF with nothing left to flush: FIN toward the host.
            if flow.remote_eof && flow.pending.is_none() && !flow.close_sent {
                socket.close();
                flow.close_sent = true;
                progress = true;
            }

            if socket.state() == tcp::State::Closed {
                closed.push(handle);
            }
        }

        for handle in closed {
            self.cleanup(handle);
            progress = true;
        }

        progress
    }

    fn cleanup(&mut self, handle: SocketHandle) {
        if let Some(flow) = self.flows.remove(&handle) {
            self.table.tcp_remove(&flow.key);
            let meters = flow.stats.snapshot();
            debug!(
                "tcp disconnect: {} (up {} / down {} bytes)",
                flow.key, meters.upload, meters.download
            );
        }
        self.sockets.remove(handle);
    }
}

/// Tunnel => remote half: drains the per-flow channel into the outbound
/// stream; channel closure propagates the tunnel-side FIN as a shutdown.
async fn write_pump(
    mut rx: mpsc::Receiver<Bytes>,
    mut half: OwnedWriteHalf,
    events: mpsc::Sender<StackEvent>,
    handle: SocketHandle,
    flow_id: u64,
    stats: Arc<FlowStats>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = half.write_all(&chunk).await {
            debug!("outbound write failed: {}", e);
            let _ = events.send(StackEvent::Abort { handle, flow_id }).await;
            return;
        }
        stats.add_upload(chunk.len() as u64);
    }
    let _ = half.shutdown().await;
}

/// Remote => tunnel half: strict backpressure, one chunk in flight.
async fn read_pump(
    mut half: OwnedReadHalf,
    events: mpsc::Sender<StackEvent>,
    handle: SocketHandle,
    flow_id: u64,
    stats: Arc<FlowStats>,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match half.read(&mut buf).await {
            Ok(0) => {
                let _ = events
                    .send(StackEvent::OutboundEof { handle, flow_id })
                    .await;
                return;
            }
            Ok(n) => {
                stats.add_download(n as u64);
                let (done_tx, done_rx) = oneshot::channel();
                let event = StackEvent::Outbound {
                    handle,
                    flow_id,
                    data: Bytes::copy_from_slice(&buf[..n]),
                    done: done_tx,
                };
                if events.send(event).await.is_err() || done_rx.await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("outbound read failed: {}", e);
                let _ = events.send(StackEvent::Abort { handle, flow_id }).await;
                return;
            }
        }
    }
}

fn stack_addr(ip: std::net::IpAddr) -> IpAddress {
    match ip {
        std::net::IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        std::net::IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}
