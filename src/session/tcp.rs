//! TCP session bring-up
//!
//! A TCP flow starts life as a buffered SYN and a flow-table entry in the
//! Connecting phase. This task resolves the outbound side, then hands the
//! connected stream plus the original SYN to the stack task, which answers
//! the handshake and runs the byte pumps. If the connect fails the entry
//! is removed and nothing is ever written to the TUN for this flow; the
//! host's own stack observes a timeout and its SYN retransmits may try
//! again.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::flow::FlowTable;
use crate::outbound::Connector;
use crate::packet::TcpEndpointPair;
use crate::stack::{FlowOpen, StackEvent, StackHandle};

/// Open the outbound side of a new TCP flow and activate it in the stack.
///
/// The caller has already inserted the Connecting-phase entry for `key`.
pub fn spawn(
    key: TcpEndpointPair,
    syn: BytesMut,
    table: Arc<FlowTable>,
    connector: Arc<Connector>,
    stack: StackHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("tcp proxy: {}", key);

        match connector.connect_tcp(key.src(), key.dst()).await {
            Ok(stream) => {
                let open = StackEvent::Open(FlowOpen { key, syn, stream });
                if stack.send(open).await.is_err() {
                    table.tcp_remove(&key);
                }
            }
            Err(e) => {
                warn!("can't connect remote endpoint {}: {}", key.dst(), e);
                table.tcp_remove(&key);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EgressConfig, OutboundMode};
    use crate::flow::TcpFlowEntry;
    use crate::packet::AddressPair;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn key(dst_port: u16) -> TcpEndpointPair {
        let addrs = AddressPair::new(
            Ipv4Addr::new(10, 6, 7, 7).into(),
            Ipv4Addr::LOCALHOST.into(),
        )
        .unwrap();
        TcpEndpointPair::new(addrs, 40000, dst_port)
    }

    #[tokio::test]
    async fn test_connect_failure_removes_entry() {
        // A listener bound then dropped gives a port that refuses connects.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = key(port);
        let table = Arc::new(FlowTable::new());
        table.tcp_insert(Arc::new(TcpFlowEntry::new(key)));

        let connector = Arc::new(Connector::new(
            OutboundMode::Direct,
            EgressConfig {
                ipv4: Some(Ipv4Addr::LOCALHOST),
                ipv6: None,
            },
            Duration::from_secs(2),
        ));

        let (tun_tx, _tun_rx) = tokio::sync::mpsc::channel(16);
        let (stack, stack_task) = crate::stack::spawn(
            &crate::config::TunConfig::default(),
            Arc::clone(&table),
            tun_tx,
        );

        spawn(key, BytesMut::new(), Arc::clone(&table), connector, stack.clone())
            .await
            .unwrap();

        assert!(table.tcp_get(&key).is_none());

        let _ = stack.send(StackEvent::Shutdown).await;
        let _ = stack_task.await;
    }
}
