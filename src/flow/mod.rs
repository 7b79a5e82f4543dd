//! Flow table: 5-tuple to session mapping
//!
//! Two independent maps, one per transport. Entries are constructed fully
//! before insertion so no half-initialized flow is ever visible, and a
//! session removes its own entry as part of its teardown. Removal is
//! idempotent; at most one live flow exists per key.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::packet::{TcpEndpointPair, UdpEndpointPair};

/// Per-flow byte meters
///
/// Upload counts bytes moving tunnel ⇒ remote, download the reverse.
/// Relaxed ordering; the meters are diagnostics, not control flow.
#[derive(Debug, Default)]
pub struct FlowStats {
    upload: AtomicU64,
    download: AtomicU64,
}

impl FlowStats {
    /// Account bytes sent toward the remote
    pub fn add_upload(&self, n: u64) {
        self.upload.fetch_add(n, Ordering::Relaxed);
    }

    /// Account bytes received from the remote
    pub fn add_download(&self, n: u64) {
        self.download.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of the meters
    #[must_use]
    pub fn snapshot(&self) -> FlowStatsSnapshot {
        FlowStatsSnapshot {
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`FlowStats`]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlowStatsSnapshot {
    /// Bytes tunnel ⇒ remote
    pub upload: u64,
    /// Bytes remote ⇒ tunnel
    pub download: u64,
}

const PHASE_CONNECTING: u8 = 0;
const PHASE_ACTIVE: u8 = 1;

/// Lifecycle phase of a TCP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlowPhase {
    /// Outbound connect in progress; TUN-side packets are dropped and the
    /// host's SYN retransmission covers the gap
    Connecting,
    /// Outbound connected and the embedded stack socket exists
    Active,
}

/// One live TCP flow
#[derive(Debug)]
pub struct TcpFlowEntry {
    /// Flow key
    pub key: TcpEndpointPair,
    phase: AtomicU8,
    /// Byte meters
    pub stats: Arc<FlowStats>,
    /// Creation time
    pub created_at: Instant,
}

impl TcpFlowEntry {
    /// Create an entry in the Connecting phase
    #[must_use]
    pub fn new(key: TcpEndpointPair) -> Self {
        Self {
            key,
            phase: AtomicU8::new(PHASE_CONNECTING),
            stats: Arc::new(FlowStats::default()),
            created_at: Instant::now(),
        }
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> TcpFlowPhase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_CONNECTING => TcpFlowPhase::Connecting,
            _ => TcpFlowPhase::Active,
        }
    }

    /// Mark the flow active once the stack socket exists
    pub fn set_active(&self) {
        self.phase.store(PHASE_ACTIVE, Ordering::Release);
    }
}

/// One live UDP flow
#[derive(Debug)]
pub struct UdpFlowEntry {
    /// Flow key
    pub key: UdpEndpointPair,
    /// Channel toward the session task; each delivery refreshes the idle
    /// timer as a side effect of waking the session loop
    pub inbound: mpsc::Sender<Bytes>,
    /// Byte meters
    pub stats: Arc<FlowStats>,
    /// Creation time
    pub created_at: Instant,
}

impl UdpFlowEntry {
    /// Create an entry around the session's inbound channel
    #[must_use]
    pub fn new(key: UdpEndpointPair, inbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            key,
            inbound,
            stats: Arc::new(FlowStats::default()),
            created_at: Instant::now(),
        }
    }
}

/// The flow table
#[derive(Debug, Default)]
pub struct FlowTable {
    tcp: DashMap<TcpEndpointPair, Arc<TcpFlowEntry>>,
    udp: DashMap<UdpEndpointPair, Arc<UdpFlowEntry>>,
}

impl FlowTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a TCP flow
    #[must_use]
    pub fn tcp_get(&self, key: &TcpEndpointPair) -> Option<Arc<TcpFlowEntry>> {
        self.tcp.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a fully constructed TCP flow. Returns false (and drops the
    /// candidate) if the key is already live.
    pub fn tcp_insert(&self, entry: Arc<TcpFlowEntry>) -> bool {
        match self.tcp.entry(entry.key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove a TCP flow; idempotent
    pub fn tcp_remove(&self, key: &TcpEndpointPair) {
        self.tcp.remove(key);
    }

    /// Look up a UDP flow
    #[must_use]
    pub fn udp_get(&self, key: &UdpEndpointPair) -> Option<Arc<UdpFlowEntry>> {
        self.udp.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a fully constructed UDP flow. Returns false (and drops the
    /// candidate) if the key is already live.
    pub fn udp_insert(&self, entry: Arc<UdpFlowEntry>) -> bool {
        match self.udp.entry(entry.key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove a UDP flow; idempotent
    pub fn udp_remove(&self, key: &UdpEndpointPair) {
        self.udp.remove(key);
    }

    /// Number of live TCP flows
    #[must_use]
    pub fn tcp_len(&self) -> usize {
        self.tcp.len()
    }

    /// Number of live UDP flows
    #[must_use]
    pub fn udp_len(&self) -> usize {
        self.udp.len()
    }

    /// Whether the table holds no flows at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }
}
