//! UDP session task
//!
//! One task per UDP flow: Starting (outbound socket creation) → Active
//! (bidirectional pairing) → Closed. Replies are wrapped with the
//! reversed 5-tuple and handed to the gateway's TUN send queue. Ten
//! seconds of silence in either direction closes the flow; the timer
//! slides because every loop iteration re-arms it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::UdpSessionConfig;
use crate::flow::{FlowStats, FlowTable};
use crate::outbound::Connector;
use crate::packet::{udp, UdpEndpointPair};

/// Receive buffer; carries a maximum-size datagram
const MAX_DATAGRAM: usize = 65536;

/// Run a UDP session to completion.
///
/// The caller has already inserted the flow-table entry whose sender feeds
/// `inbound`; the entry is removed here on every exit path.
pub fn spawn(
    key: UdpEndpointPair,
    mut inbound: mpsc::Receiver<Bytes>,
    stats: Arc<FlowStats>,
    table: Arc<FlowTable>,
    connector: Arc<Connector>,
    tun_tx: mpsc::Sender<Bytes>,
    config: UdpSessionConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("udp proxy: {}", key);

        let socket = match connector.connect_udp(key.src(), key.dst()).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("udp outbound for {} failed: {}", key, e);
                table.udp_remove(&key);
                return;
            }
        };

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reply_key = key.reversed();

        loop {
            tokio::select! {
                datagram = inbound.recv() => {
                    let Some(payload) = datagram else { break };
                    match socket.send(&payload).await {
                        Ok(n) => stats.add_upload(n as u64),
                        Err(e) => {
                            debug!("udp send for {} failed: {}", key, e);
                            break;
                        }
                    }
                }
                received = socket.recv(&mut buf) => {
                    match received {
                        Ok(n) => {
                            stats.add_download(n as u64);
                            let packet = udp::encode_datagram(&reply_key, &buf[..n]);
                            if tun_tx.send(packet.freeze()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("udp recv for {} failed: {}", key, e);
                            break;
                        }
                    }
                }
                () = sleep(config.idle_timeout) => {
                    debug!("udp idle timeout: {}", key);
                    break;
                }
            }
        }

        table.udp_remove(&key);
        let meters = stats.snapshot();
        info!(
            "udp disconnect: {} (up {} / down {} bytes)",
            key, meters.upload, meters.download
        );
    })
}

/// Deliver one datagram payload to a session, refreshing its idle timer as
/// a side effect. Returns false if the session is gone or saturated; the
/// datagram is dropped either way.
pub fn deliver(entry: &crate::flow::UdpFlowEntry, payload: &[u8]) -> bool {
    entry
        .inbound
        .try_send(Bytes::copy_from_slice(payload))
        .is_ok()
}

/// Build the channel a new session is fed through
#[must_use]
pub fn inbound_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(64)
}
