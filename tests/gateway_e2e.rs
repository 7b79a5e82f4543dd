//! End-to-end gateway scenarios over the in-memory TUN
//!
//! Each test starts a full gateway, plays the host OS side by injecting
//! hand-built datagrams, and runs real loopback sockets as the remote
//! peers. The TCP tests script the host half of the handshake directly
//! against the embedded stack.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{sleep, timeout};

use tun_gateway::packet::{tcp, udp, AddressPair, IpPacket, TcpSegment, UdpDatagram};
use tun_gateway::tun::channel_tun;
use tun_gateway::{
    ChannelTunHandle, EgressConfig, Gateway, GatewayConfig, OutboundMode, TcpEndpointPair,
    UdpEndpointPair,
};

const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 6, 7, 7);
const WAIT: Duration = Duration::from_secs(5);

fn loopback_config() -> GatewayConfig {
    GatewayConfig::default().with_egress(EgressConfig {
        ipv4: Some(Ipv4Addr::LOCALHOST),
        ipv6: None,
    })
}

fn start(config: GatewayConfig) -> (Gateway, ChannelTunHandle) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (reader, writer, handle) = channel_tun(512);
    let gateway = Gateway::start(config, Box::new(reader), Box::new(writer)).unwrap();
    (gateway, handle)
}

fn udp_key(dst: SocketAddr, src_port: u16) -> UdpEndpointPair {
    let addrs = AddressPair::new(HOST_IP.into(), dst.ip()).unwrap();
    UdpEndpointPair::new(addrs, src_port, dst.port())
}

fn tcp_key(dst: SocketAddr, src_port: u16) -> TcpEndpointPair {
    let addrs = AddressPair::new(HOST_IP.into(), dst.ip()).unwrap();
    TcpEndpointPair::new(addrs, src_port, dst.port())
}

/// One parsed TCP segment addressed to the host, fields copied out
#[derive(Debug)]
struct HostSegment {
    seq: u32,
    ack: u32,
    flags_syn: bool,
    flags_ack: bool,
    flags_fin: bool,
    flags_rst: bool,
    payload: Vec<u8>,
}

async fn next_host_segment(
    tun: &mut ChannelTunHandle,
    key: &TcpEndpointPair,
) -> Result<HostSegment> {
    let reply_key = key.reversed();
    loop {
        let packet = timeout(WAIT, tun.outbound())
            .await
            .context("timed out waiting for a segment from the gateway")?
            .context("tun closed")?;
        let ip = IpPacket::parse(&packet)?;
        let segment = TcpSegment::parse(&ip)?;
        if segment.endpoints != reply_key {
            continue;
        }
        return Ok(HostSegment {
            seq: segment.seq,
            ack: segment.ack,
            flags_syn: segment.is_syn(),
            flags_ack: segment.is_ack(),
            flags_fin: segment.is_fin(),
            flags_rst: segment.is_rst(),
            payload: segment.payload.to_vec(),
        });
    }
}

/// Scripted host-side TCP endpoint: the role the host OS kernel plays
struct HostPeer {
    key: TcpEndpointPair,
    seq: u32,
    ack: u32,
}

impl HostPeer {
    fn new(key: TcpEndpointPair) -> Self {
        Self {
            key,
            seq: 1000,
            ack: 0,
        }
    }

    async fn send(&self, tun: &ChannelTunHandle, flags: u8, payload: &[u8]) -> Result<()> {
        let packet = tcp::encode_segment(&self.key, flags, self.seq, self.ack, 65535, payload);
        tun.inject(packet).await?;
        Ok(())
    }

    /// SYN ⇒ SYN/ACK ⇒ ACK
    async fn handshake(&mut self, tun: &mut ChannelTunHandle) -> Result<()> {
        self.send(tun, tcp::FLAG_SYN, &[]).await?;
        self.seq += 1;

        let syn_ack = next_host_segment(tun, &self.key).await?;
        if !(syn_ack.flags_syn && syn_ack.flags_ack) {
            bail!("expected SYN/ACK, got {:?}", syn_ack);
        }
        if syn_ack.ack != self.seq {
            bail!("SYN/ACK acknowledged {} instead of {}", syn_ack.ack, self.seq);
        }
        self.ack = syn_ack.seq.wrapping_add(1);

        self.send(tun, tcp::FLAG_ACK, &[]).await?;
        Ok(())
    }

    async fn send_data(&mut self, tun: &ChannelTunHandle, payload: &[u8]) -> Result<()> {
        self.send(tun, tcp::FLAG_PSH | tcp::FLAG_ACK, payload).await?;
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        Ok(())
    }

    /// Collect data until FIN, acknowledging everything in order.
    async fn read_until_fin(&mut self, tun: &mut ChannelTunHandle) -> Result<Vec<u8>> {
        let mut collected = Vec::new();
        loop {
            let segment = next_host_segment(tun, &self.key).await?;
            if segment.flags_rst {
                bail!("unexpected RST");
            }

            let len = segment.payload.len() as u32;
            if segment.seq == self.ack {
                collected.extend_from_slice(&segment.payload);
                self.ack = self.ack.wrapping_add(len);
                if segment.flags_fin {
                    self.ack = self.ack.wrapping_add(1);
                }
                if len > 0 || segment.flags_fin {
                    self.send(tun, tcp::FLAG_ACK, &[]).await?;
                }
                if segment.flags_fin {
                    return Ok(collected);
                }
            } else if len > 0 || segment.flags_fin {
                // Retransmission; re-acknowledge our current position.
                self.send(tun, tcp::FLAG_ACK, &[]).await?;
            }
        }
    }

    /// Send our FIN and wait for its acknowledgement.
    async fn close(&mut self, tun: &mut ChannelTunHandle) -> Result<()> {
        self.send(tun, tcp::FLAG_FIN | tcp::FLAG_ACK, &[]).await?;
        self.seq = self.seq.wrapping_add(1);

        loop {
            let segment = next_host_segment(tun, &self.key).await?;
            if segment.flags_ack && segment.ack == self.seq {
                return Ok(());
            }
        }
    }
}

// S1: a UDP datagram out through the gateway and its reply back in, with
// reversed 5-tuple and verified checksums.
#[tokio::test]
async fn udp_echo_roundtrip() -> Result<()> {
    let echo = UdpSocket::bind("127.0.0.1:0").await?;
    let echo_addr = echo.local_addr()?;
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        echo.send_to(b"pong", from).await.unwrap();
    });

    let (mut gateway, mut tun) = start(loopback_config());
    let key = udp_key(echo_addr, 40000);

    tun.inject(udp::encode_datagram(&key, b"ping")).await?;

    let reply = timeout(WAIT, tun.outbound())
        .await
        .context("no reply written to tun")?
        .context("tun closed")?;
    let ip = IpPacket::parse(&reply)?;
    let datagram = UdpDatagram::parse(&ip)?;
    assert_eq!(datagram.endpoints.src(), echo_addr);
    assert_eq!(
        datagram.endpoints.dst(),
        SocketAddr::new(HOST_IP.into(), 40000)
    );
    assert_eq!(datagram.payload, b"pong");

    assert_eq!(gateway.udp_flows(), 1);
    gateway.stop().await;
    Ok(())
}

// S2: a UDP flow with no traffic disappears from the flow table after the
// idle timeout.
#[tokio::test]
async fn udp_idle_eviction() -> Result<()> {
    let sink = UdpSocket::bind("127.0.0.1:0").await?;
    let sink_addr = sink.local_addr()?;

    let config = loopback_config().with_udp_idle_timeout(Duration::from_millis(200));
    let (mut gateway, tun) = start(config);

    tun.inject(udp::encode_datagram(&udp_key(sink_addr, 40000), b"ping"))
        .await?;

    // Flow exists while fresh.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.udp_flows(), 1);

    // And is evicted once idle.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(gateway.udp_flows(), 0);

    gateway.stop().await;
    Ok(())
}

// S3: full TCP lifecycle: handshake, request bytes appearing verbatim on
// the outbound socket, response re-segmented back into the TUN, FIN
// propagation in both directions.
#[tokio::test]
async fn tcp_open_data_close() -> Result<()> {
    const REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nhello";

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; REQUEST.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, REQUEST);
        stream.write_all(RESPONSE).await.unwrap();
        // Dropping the stream sends FIN to the gateway.
    });

    let (mut gateway, mut tun) = start(loopback_config());
    let mut peer = HostPeer::new(tcp_key(server_addr, 41000));

    peer.handshake(&mut tun).await?;
    assert_eq!(gateway.tcp_flows(), 1);

    peer.send_data(&tun, REQUEST).await?;
    server.await?;

    let response = peer.read_until_fin(&mut tun).await?;
    assert_eq!(response, RESPONSE);

    peer.close(&mut tun).await?;

    gateway.stop().await;
    Ok(())
}

// A reset mid-flow tears the session down and removes the flow promptly.
#[tokio::test]
async fn tcp_reset_removes_flow() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(10)).await;
    });

    let (mut gateway, mut tun) = start(loopback_config());
    let mut peer = HostPeer::new(tcp_key(server_addr, 41001));
    peer.handshake(&mut tun).await?;
    assert_eq!(gateway.tcp_flows(), 1);

    peer.send(&tun, tcp::FLAG_RST | tcp::FLAG_ACK, &[]).await?;

    let deadline = tokio::time::Instant::now() + WAIT;
    while gateway.tcp_flows() != 0 {
        if tokio::time::Instant::now() > deadline {
            bail!("flow still present after RST");
        }
        sleep(Duration::from_millis(50)).await;
    }

    gateway.stop().await;
    Ok(())
}

// S4: when the outbound connect fails, no SYN/ACK is ever written to the
// TUN and the flow is removed; the host just sees its SYN go unanswered.
#[tokio::test]
async fn tcp_connect_failure_stays_silent() -> Result<()> {
    // Bind then drop to get a refusing port.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = listener.local_addr()?;
    drop(listener);

    let (mut gateway, mut tun) = start(loopback_config());
    let peer = HostPeer::new(tcp_key(dead_addr, 41002));
    peer.send(&tun, tcp::FLAG_SYN, &[]).await?;

    // Nothing may come back.
    assert!(
        timeout(Duration::from_millis(800), tun.outbound())
            .await
            .is_err(),
        "gateway answered a flow whose connect failed"
    );
    assert_eq!(gateway.tcp_flows(), 0);

    gateway.stop().await;
    Ok(())
}

// S5: same as S3 but through a SOCKS5 upstream: method negotiation and
// CONNECT against the configured server, then identical relaying.
#[tokio::test]
async fn tcp_via_socks5() -> Result<()> {
    const REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
    const RESPONSE: &[u8] = b"proxied response";

    let target: SocketAddr = "1.1.1.1:80".parse().unwrap();

    // Mock SOCKS5 server that also plays the remote: negotiation, CONNECT,
    // then serves the flow's bytes itself.
    let socks = TcpListener::bind("127.0.0.1:0").await?;
    let socks_addr = socks.local_addr()?;
    let server = tokio::spawn(async move {
        let (mut stream, _) = socks.accept().await.unwrap();

        let mut methods = [0u8; 3];
        stream.read_exact(&mut methods).await.unwrap();
        assert_eq!(methods[..2], [0x05, 0x01]);
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = [0u8; 10];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(request[..4], [0x05, 0x01, 0x00, 0x01]);
        let requested = SocketAddr::new(
            Ipv4Addr::new(request[4], request[5], request[6], request[7]).into(),
            u16::from_be_bytes([request[8], request[9]]),
        );
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut buf = vec![0u8; REQUEST.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, REQUEST);
        stream.write_all(RESPONSE).await.unwrap();

        requested
    });

    let config = loopback_config().with_outbound(OutboundMode::Socks5 { server: socks_addr });
    let (mut gateway, mut tun) = start(config);

    let mut peer = HostPeer::new(tcp_key(target, 41003));
    peer.handshake(&mut tun).await?;
    peer.send_data(&tun, REQUEST).await?;

    let response = peer.read_until_fin(&mut tun).await?;
    assert_eq!(response, RESPONSE);
    peer.close(&mut tun).await?;

    // The CONNECT carried the flow's real destination, not the relay's.
    assert_eq!(server.await?, target);

    gateway.stop().await;
    Ok(())
}

// S6: a datagram whose total length exceeds the buffer is dropped without
// any side effects.
#[tokio::test]
async fn malformed_packet_dropped() -> Result<()> {
    let (mut gateway, mut tun) = start(loopback_config());

    // Valid-looking IPv4/UDP header claiming 1500 bytes in a 28-byte
    // buffer, with a correct header checksum so only the length trips.
    let key = udp_key("127.0.0.1:53".parse().unwrap(), 40000);
    let mut packet: Vec<u8> = udp::encode_datagram(&key, &[]).to_vec();
    packet[2..4].copy_from_slice(&1500u16.to_be_bytes());
    packet[10..12].copy_from_slice(&[0, 0]);
    let cs = tun_gateway::packet::checksum::checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&cs.to_be_bytes());

    tun.inject(BytesMut::from(&packet[..])).await?;
    sleep(Duration::from_millis(200)).await;

    assert!(
        timeout(Duration::from_millis(100), tun.outbound())
            .await
            .is_err(),
        "malformed packet produced output"
    );
    assert_eq!(gateway.udp_flows(), 0);
    assert_eq!(gateway.tcp_flows(), 0);
    assert_eq!(gateway.stats().parse_errors, 1);

    gateway.stop().await;
    Ok(())
}

// Flow keys are per 5-tuple: two source ports to the same destination are
// two independent sessions.
#[tokio::test]
async fn udp_flows_are_per_five_tuple() -> Result<()> {
    let echo = UdpSocket::bind("127.0.0.1:0").await?;
    let echo_addr = echo.local_addr()?;
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        }
    });

    let (mut gateway, mut tun) = start(loopback_config());

    tun.inject(udp::encode_datagram(&udp_key(echo_addr, 40000), b"one"))
        .await?;
    tun.inject(udp::encode_datagram(&udp_key(echo_addr, 40001), b"two"))
        .await?;

    let mut seen = Vec::new();
    for _ in 0..2 {
        let reply = timeout(WAIT, tun.outbound())
            .await
            .context("missing reply")?
            .context("tun closed")?;
        let ip = IpPacket::parse(&reply)?;
        let datagram = UdpDatagram::parse(&ip)?;
        seen.push((datagram.endpoints.dst_port, datagram.payload.to_vec()));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![(40000, b"one".to_vec()), (40001, b"two".to_vec())]
    );
    assert_eq!(gateway.udp_flows(), 2);

    gateway.stop().await;
    Ok(())
}
