//! Gateway controller
//!
//! Owns the whole pipeline and the start/stop lifecycle:
//!
//! ```text
//! TUN read -> codec.decode -> flow table demux -> session -> outbound
//! outbound -> session / stack output -> TUN send queue -> TUN write
//! ```
//!
//! Tasks spawned on start:
//!
//! - `ingest`: reads one datagram at a time, decodes it, and routes it
//!   into the flow table (creating sessions on first packet / first SYN)
//! - `tun_writer`: the single consumer of the TUN send queue, so packets
//!   hit the device in enqueue order; a zero-length write is retried with
//!   the same buffer after a short delay
//! - the embedded TCP stack task with its internal 1 s tick
//!
//! Session errors never surface here; only TUN failures stop the gateway.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::flow::{FlowTable, TcpFlowEntry, TcpFlowPhase, UdpFlowEntry};
use crate::outbound::Connector;
use crate::packet::{IpPacket, TcpSegment, UdpDatagram, PROTOCOL_TCP, PROTOCOL_UDP};
use crate::session;
use crate::stack::{self, StackEvent, StackHandle};
use crate::tun::{TunReader, TunWriter, WRITE_RETRY_DELAY};

/// Depth of the single TUN send queue
const SEND_QUEUE_DEPTH: usize = 512;

/// Aggregate gateway counters
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Datagrams read from the TUN
    pub packets_in: AtomicU64,
    /// Datagrams written to the TUN
    pub packets_out: AtomicU64,
    /// Malformed datagrams dropped
    pub parse_errors: AtomicU64,
    /// Non-TCP/UDP datagrams dropped
    pub unsupported_dropped: AtomicU64,
    /// TCP flows created
    pub tcp_flows_opened: AtomicU64,
    /// UDP flows created
    pub udp_flows_opened: AtomicU64,
}

impl GatewayStats {
    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            unsupported_dropped: self.unsupported_dropped.load(Ordering::Relaxed),
            tcp_flows_opened: self.tcp_flows_opened.load(Ordering::Relaxed),
            udp_flows_opened: self.udp_flows_opened.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewayStatsSnapshot {
    /// Datagrams read from the TUN
    pub packets_in: u64,
    /// Datagrams written to the TUN
    pub packets_out: u64,
    /// Malformed datagrams dropped
    pub parse_errors: u64,
    /// Non-TCP/UDP datagrams dropped
    pub unsupported_dropped: u64,
    /// TCP flows created
    pub tcp_flows_opened: u64,
    /// UDP flows created
    pub udp_flows_opened: u64,
}

/// The running gateway
pub struct Gateway {
    config: GatewayConfig,
    table: Arc<FlowTable>,
    stats: Arc<GatewayStats>,
    stack: StackHandle,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Start the gateway over an opened TUN device.
    ///
    /// The embedder has already created the device with the configured
    /// addresses, snapshotted the egress addresses into the config, and
    /// pointed the default route at the TUN.
    ///
    /// # Errors
    ///
    /// Currently infallible at startup; kept fallible for embedders that
    /// wrap device handover.
    pub fn start(
        config: GatewayConfig,
        reader: Box<dyn TunReader>,
        writer: Box<dyn TunWriter>,
    ) -> Result<Self> {
        let table = Arc::new(FlowTable::new());
        let stats = Arc::new(GatewayStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let connector = Arc::new(Connector::new(
            config.outbound,
            config.egress,
            config.connect_timeout(),
        ));

        let (tun_tx, tun_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        let (stack, stack_task) = stack::spawn(&config.tun, Arc::clone(&table), tun_tx.clone());

        let router = PacketRouter {
            table: Arc::clone(&table),
            stats: Arc::clone(&stats),
            connector,
            stack: stack.clone(),
            tun_tx,
            config: config.clone(),
        };

        let writer_task = tokio::spawn(tun_writer_task(
            writer,
            tun_rx,
            Arc::clone(&stats),
            Arc::clone(&running),
        ));
        let ingest_task = tokio::spawn(ingest_task(
            reader,
            router,
            Arc::clone(&stats),
            Arc::clone(&running),
        ));

        info!(
            "gateway started: tun {}, outbound {:?}",
            config.tun.name, config.outbound
        );

        Ok(Self {
            config,
            table,
            stats,
            stack,
            running,
            tasks: vec![stack_task, writer_task, ingest_task],
        })
    }

    /// Stop the gateway: tear down all flows and tasks. Idempotent.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("gateway already stopped");
            return;
        }

        info!(
            tcp_flows = self.table.tcp_len(),
            udp_flows = self.table.udp_len(),
            "gateway stopping"
        );

        let _ = self.stack.send(StackEvent::Shutdown).await;
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }

    /// Whether the gateway is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The configuration the gateway was started with
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Aggregate counters
    #[must_use]
    pub fn stats(&self) -> GatewayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Live TCP flow count
    #[must_use]
    pub fn tcp_flows(&self) -> usize {
        self.table.tcp_len()
    }

    /// Live UDP flow count
    #[must_use]
    pub fn udp_flows(&self) -> usize {
        self.table.udp_len()
    }

    /// The flow table, for diagnostics
    #[must_use]
    pub fn flow_table(&self) -> &Arc<FlowTable> {
        &self.table
    }
}

/// Decodes datagrams and routes them into the flow table
struct PacketRouter {
    table: Arc<FlowTable>,
    stats: Arc<GatewayStats>,
    connector: Arc<Connector>,
    stack: StackHandle,
    tun_tx: mpsc::Sender<Bytes>,
    config: GatewayConfig,
}

impl PacketRouter {
    async fn demux(&self, buf: &BytesMut) {
        match IpPacket::parse(buf) {
            Ok(packet) => match packet.protocol() {
                PROTOCOL_TCP => self.on_tcp(&packet).await,
                PROTOCOL_UDP => self.on_udp(&packet),
                // parse admits nothing else
                _ => unreachable!(),
            },
            Err(e) if e.is_silent() => {
                self.stats
                    .unsupported_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!("dropping malformed datagram: {}", e);
            }
        }
    }

    async fn on_tcp(&self, packet: &IpPacket<'_>) {
        let segment = match TcpSegment::parse(packet) {
            Ok(segment) => segment,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!("dropping bad tcp segment: {}", e);
                return;
            }
        };
        let key = segment.endpoints;

        match self.table.tcp_get(&key) {
            Some(entry) => match entry.phase() {
                // The stack's machine decides what a SYN, RST, or data
                // segment means for a live flow.
                TcpFlowPhase::Active => {
                    let raw = BytesMut::from(packet.raw());
                    let _ = self.stack.send(StackEvent::Inject(raw)).await;
                }
                // Outbound connect still in flight; the host's
                // retransmission covers dropped segments.
                TcpFlowPhase::Connecting => {
                    trace!("dropping segment for connecting flow {}", key);
                }
            },
            None => {
                if segment.is_syn() && !segment.is_ack() && !segment.is_rst() {
                    let entry = Arc::new(TcpFlowEntry::new(key));
                    if self.table.tcp_insert(entry) {
                        self.stats.tcp_flows_opened.fetch_add(1, Ordering::Relaxed);
                        session::tcp::spawn(
                            key,
                            BytesMut::from(packet.raw()),
                            Arc::clone(&self.table),
                            Arc::clone(&self.connector),
                            self.stack.clone(),
                        );
                    }
                } else {
                    trace!("dropping tcp segment for unknown flow {}", key);
                }
            }
        }
    }

    fn on_udp(&self, packet: &IpPacket<'_>) {
        let datagram = match UdpDatagram::parse(packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!("dropping bad udp datagram: {}", e);
                return;
            }
        };
        let key = datagram.endpoints;

        if let Some(entry) = self.table.udp_get(&key) {
            if !session::udp::deliver(&entry, datagram.payload) {
                trace!("udp session {} saturated, datagram dropped", key);
            }
            return;
        }

        let (tx, rx) = session::udp::inbound_channel();
        let entry = Arc::new(UdpFlowEntry::new(key, tx));
        if self.table.udp_insert(Arc::clone(&entry)) {
            self.stats.udp_flows_opened.fetch_add(1, Ordering::Relaxed);
            session::udp::spawn(
                key,
                rx,
                Arc::clone(&entry.stats),
                Arc::clone(&self.table),
                Arc::clone(&self.connector),
                self.tun_tx.clone(),
                self.config.udp_session(),
            );
            let _ = session::udp::deliver(&entry, datagram.payload);
        }
    }
}

async fn ingest_task(
    mut reader: Box<dyn TunReader>,
    router: PacketRouter,
    stats: Arc<GatewayStats>,
    running: Arc<AtomicBool>,
) {
    debug!("ingest task started");

    while running.load(Ordering::SeqCst) {
        match reader.recv_packet().await {
            Ok(buf) => {
                stats.packets_in.fetch_add(1, Ordering::Relaxed);
                router.demux(&buf).await;
            }
            Err(e) => {
                let fatal: GatewayError = crate::error::TunError::Io(e).into();
                error!("tun read failed, gateway stopping: {}", fatal);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    debug!("ingest task stopped");
}

async fn tun_writer_task(
    mut writer: Box<dyn TunWriter>,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<GatewayStats>,
    running: Arc<AtomicBool>,
) {
    debug!("tun writer task started");

    while let Some(packet) = rx.recv().await {
        loop {
            match writer.send_packet(&packet).await {
                // Transient device condition: retry the same buffer.
                Ok(0) => {
                    trace!("tun wrote zero bytes, retrying");
                    sleep(WRITE_RETRY_DELAY).await;
                }
                Ok(_) => {
                    stats.packets_out.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    error!("tun write failed, gateway stopping: {}", e);
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    debug!("tun writer task stopped");
}
