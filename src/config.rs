//! Gateway configuration types
//!
//! All configuration is supplied by the embedding program at construction;
//! nothing is persisted. The TUN parameters describe the interface the
//! embedder creates and routes traffic into; the egress addresses are a
//! snapshot of the pre-existing default interface, taken before the
//! default route is pointed at the TUN, so outbound sockets never loop
//! back into the tunnel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// IPv4 parameters of the TUN interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunAddressV4 {
    /// Interface address
    pub addr: Ipv4Addr,
    /// Prefix length
    #[serde(default = "default_v4_prefix")]
    pub prefix_len: u8,
    /// DNS server configured on the interface for host resolver
    /// convenience; the gateway itself does not implement DNS
    #[serde(default = "default_v4_dns")]
    pub dns: Ipv4Addr,
}

/// IPv6 parameters of the TUN interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunAddressV6 {
    /// Interface address
    pub addr: Ipv6Addr,
    /// Prefix length
    #[serde(default = "default_v6_prefix")]
    pub prefix_len: u8,
    /// DNS server configured on the interface
    #[serde(default = "default_v6_dns")]
    pub dns: Ipv6Addr,
}

/// TUN interface parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Interface name
    #[serde(default = "default_tun_name")]
    pub name: String,
    /// IPv4 addressing
    #[serde(default = "default_tun_v4")]
    pub ipv4: TunAddressV4,
    /// IPv6 addressing, omitted to disable v6 on the interface
    #[serde(default = "default_tun_v6")]
    pub ipv6: Option<TunAddressV6>,
    /// MTU; flows are never fragmented at this layer
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            ipv4: default_tun_v4(),
            ipv6: default_tun_v6(),
            mtu: default_mtu(),
        }
    }
}

fn default_tun_name() -> String {
    "mate".into()
}

fn default_v4_prefix() -> u8 {
    24
}

fn default_v4_dns() -> Ipv4Addr {
    Ipv4Addr::new(114, 114, 114, 114)
}

fn default_tun_v4() -> TunAddressV4 {
    TunAddressV4 {
        addr: Ipv4Addr::new(10, 6, 7, 7),
        prefix_len: default_v4_prefix(),
        dns: default_v4_dns(),
    }
}

fn default_v6_prefix() -> u8 {
    64
}

fn default_v6_dns() -> Ipv6Addr {
    "2606:4700:4700::1111".parse().unwrap()
}

fn default_tun_v6() -> Option<TunAddressV6> {
    Some(TunAddressV6 {
        addr: "fe80::613b:4e3f:81e9:7e01".parse().unwrap(),
        prefix_len: default_v6_prefix(),
        dns: default_v6_dns(),
    })
}

fn default_mtu() -> usize {
    1500
}

/// Snapshot of the default physical interface addresses used for outbound
/// binding
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Default-route IPv4 address, if any
    pub ipv4: Option<Ipv4Addr>,
    /// Default-route IPv6 address, if any
    pub ipv6: Option<Ipv6Addr>,
}

impl EgressConfig {
    /// Discover the default egress addresses by asking the OS which local
    /// address it would use toward a public destination. Nothing is sent.
    ///
    /// Call this before installing the default route through the TUN.
    #[must_use]
    pub fn discover() -> Self {
        Self {
            ipv4: probe_egress("8.8.8.8:53").and_then(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            }),
            ipv6: probe_egress("[2001:4860:4860::8888]:53").and_then(|ip| match ip {
                IpAddr::V6(v6) => Some(v6),
                IpAddr::V4(_) => None,
            }),
        }
    }

    /// The egress address matching the family of `dst`, if configured
    #[must_use]
    pub fn for_destination(&self, dst: IpAddr) -> Option<IpAddr> {
        match dst {
            IpAddr::V4(_) => self.ipv4.map(IpAddr::V4),
            IpAddr::V6(_) => self.ipv6.map(IpAddr::V6),
        }
    }
}

fn probe_egress(target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(if target.starts_with('[') {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    })
    .ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// How outbound sockets reach their destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum OutboundMode {
    /// Connect directly, bound to the default egress address
    Direct,
    /// Relay through a SOCKS5 upstream (CONNECT for TCP, UDP ASSOCIATE
    /// for UDP)
    Socks5 {
        /// SOCKS5 server endpoint
        server: SocketAddr,
    },
}

impl Default for OutboundMode {
    fn default() -> Self {
        Self::Direct
    }
}

/// Per-UDP-flow session parameters
#[derive(Debug, Clone, Copy)]
pub struct UdpSessionConfig {
    /// Sliding idle timeout; a flow with no traffic in either direction
    /// for this long is evicted
    pub idle_timeout: Duration,
}

impl Default for UdpSessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl UdpSessionConfig {
    /// Create a configuration with a custom idle timeout
    #[must_use]
    pub const fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// TUN interface parameters
    #[serde(default)]
    pub tun: TunConfig,
    /// Default egress snapshot for outbound binding
    #[serde(default)]
    pub egress: EgressConfig,
    /// Outbound mode
    #[serde(default)]
    pub outbound: OutboundMode,
    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// UDP idle timeout in seconds
    #[serde(default = "default_udp_idle_secs")]
    pub udp_idle_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_udp_idle_secs() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tun: TunConfig::default(),
            egress: EgressConfig::default(),
            outbound: OutboundMode::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            udp_idle_timeout_secs: default_udp_idle_secs(),
        }
    }
}

impl GatewayConfig {
    /// Set the outbound mode
    #[must_use]
    pub fn with_outbound(mut self, outbound: OutboundMode) -> Self {
        self.outbound = outbound;
        self
    }

    /// Set the egress snapshot
    #[must_use]
    pub const fn with_egress(mut self, egress: EgressConfig) -> Self {
        self.egress = egress;
        self
    }

    /// Set the UDP idle timeout
    #[must_use]
    pub const fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Outbound connect timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// UDP session parameters
    #[must_use]
    pub const fn udp_session(&self) -> UdpSessionConfig {
        UdpSessionConfig::new(Duration::from_secs(self.udp_idle_timeout_secs))
    }
}
