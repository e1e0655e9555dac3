//! # Configuration
//!
//! Library-side configuration for each component. The binary builds these from its
//! command-line/environment arguments; tests build them directly and override what they need.
//!
//! | Struct | Consumer |
//! |--------|----------|
//! | [`HostConfig`] | `host::OverlayHost::create` |
//! | [`ConnectionConfig`] | `connection::ConnectionManager` |
//! | [`PoolConfig`] | `pool::StreamPool` |
//! | [`BridgeConfig`] | `bridge::SubmissionBridge` and its dispatcher |
//!
//! Every struct has a `Default` built from the `DEFAULT_*` constants and a `validate()`
//! that rejects settings the components cannot run with.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Default local RPC listen port.
pub const DEFAULT_RPC_PORT: u16 = 50051;

/// Application protocol spoken on every sequencer stream.
pub const COLLECT_PROTOCOL: &str = "/collect";

/// Relayer list fetched when no list URL is configured or the configured one fails.
pub const DEFAULT_RELAYER_LIST_URL: &str =
    "https://raw.githubusercontent.com/PowerLoom/proto-snapshot-server/main/pkgs/helpers/relayers/relayers.json";

/// Rendezvous point this node advertises itself under.
pub const DEFAULT_RENDEZVOUS_POINT: &str = "snapshot-relay";

/// Rendezvous point relayers advertise themselves under.
pub const DEFAULT_RELAYER_RENDEZVOUS_POINT: &str = "snapshot-relayers";

/// Public IPFS bootstrap nodes used to seed the routing table.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

pub const DEFAULT_POOL_SIZE: usize = 20;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(500);
/// Consecutive resource-exhaustion failures before the pool escalates to a reset.
pub const DEFAULT_RESOURCE_EXHAUSTION_THRESHOLD: u32 = 3;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 2;
pub const DEFAULT_MAX_CONCURRENT_WRITES: usize = 64;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_LOW_WATER: usize = 100;
pub const DEFAULT_HIGH_WATER: usize = 400;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
/// Re-query interval for long-lived provider lookups.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
/// Provider record TTL; kademlia republishes well before it lapses.
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Resource limits
// ============================================================================

/// A per-scope bound. `Unlimited` is a normal setting, not a fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Fixed(u64),
}

impl Limit {
    pub fn as_option(self) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Fixed(n) => Some(n),
        }
    }

    pub fn as_u32(self) -> Option<u32> {
        self.as_option().map(|n| n.min(u32::MAX as u64) as u32)
    }
}

impl FromStr for Limit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Limit::Unlimited);
        }
        s.parse::<u64>()
            .map(Limit::Fixed)
            .map_err(|_| Error::Config(format!("limit must be a number or \"unlimited\", got {s:?}")))
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// Resource manager scopes.
///
/// File descriptors have no separate accounting in the swarm: a fixed descriptor budget
/// caps total established connections, combined with `connections` by taking the smaller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Limit,
    pub file_descriptors: Limit,
    /// Outbound application streams open at once.
    pub streams: Limit,
    pub connections: Limit,
    pub connections_per_peer: Limit,
    pub pending_connections: Limit,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Limit::Unlimited,
            file_descriptors: Limit::Unlimited,
            streams: Limit::Unlimited,
            connections: Limit::Unlimited,
            connections_per_peer: Limit::Unlimited,
            pending_connections: Limit::Unlimited,
        }
    }
}

impl ResourceLimits {
    /// Effective cap on established connections across both scopes that bound it.
    pub fn max_established(&self) -> Option<u32> {
        match (self.connections.as_u32(), self.file_descriptors.as_u32()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Connection-manager watermarks. Trimming starts above `high_water` and stops at
/// `low_water`; connections younger than `grace_period` are never trimmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watermarks {
    pub low_water: usize,
    pub high_water: usize,
    pub grace_period: Duration,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

// ============================================================================
// Component configs
// ============================================================================

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub limits: ResourceLimits,
    pub watermarks: Watermarks,
    /// Serve relay reservations for other peers.
    pub relay_service: bool,
    /// Request port mappings from a UPnP gateway.
    pub upnp: bool,
    /// Treat bound listen addresses as externally reachable. Needed by relay service
    /// hosts on networks without address discovery (local setups, tests).
    pub announce_listen_addrs: bool,
    pub idle_connection_timeout: Duration,
    pub cleanup_interval: Duration,
    pub provider_ttl: Duration,
    pub query_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![
                tcp_listen_addr(Ipv4Addr::UNSPECIFIED),
                Multiaddr::empty()
                    .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                    .with(Protocol::Udp(0))
                    .with(Protocol::QuicV1),
            ],
            limits: ResourceLimits::default(),
            watermarks: Watermarks::default(),
            relay_service: true,
            upnp: true,
            announce_listen_addrs: false,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            query_timeout: Duration::from_secs(60),
        }
    }
}

impl HostConfig {
    /// Loopback-only host with NAT features off. Used by tests and local setups.
    pub fn local() -> Self {
        Self {
            listen_addrs: vec![tcp_listen_addr(Ipv4Addr::LOCALHOST)],
            upnp: false,
            announce_listen_addrs: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addrs.is_empty() {
            return Err(Error::Config("at least one listen address is required".into()));
        }
        if self.watermarks.low_water > self.watermarks.high_water {
            return Err(Error::Config(format!(
                "low water ({}) exceeds high water ({})",
                self.watermarks.low_water, self.watermarks.high_water
            )));
        }
        if self.limits.streams == Limit::Fixed(0) {
            return Err(Error::Config("stream limit must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Key used to look up the active sequencer in the directory.
    pub data_market: String,
    pub rendezvous_point: String,
    pub relayer_rendezvous_point: String,
    pub bootstrap_peers: Vec<Multiaddr>,
    pub connect_timeout: Duration,
    pub reservation_timeout: Duration,
    /// How long discovered relayers are tried after the trusted list is exhausted.
    pub discovery_window: Duration,
    pub discovery_interval: Duration,
    pub refresh_interval: Duration,
    pub stream_open_timeout: Duration,
    pub protocol: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            data_market: String::new(),
            rendezvous_point: DEFAULT_RENDEZVOUS_POINT.to_string(),
            relayer_rendezvous_point: DEFAULT_RELAYER_RENDEZVOUS_POINT.to_string(),
            bootstrap_peers: default_bootstrap_peers(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
            discovery_window: DEFAULT_DISCOVERY_WINDOW,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            stream_open_timeout: DEFAULT_STREAM_OPEN_TIMEOUT,
            protocol: COLLECT_PROTOCOL.to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connect timeout", self.connect_timeout),
            ("reservation timeout", self.reservation_timeout),
            ("discovery interval", self.discovery_interval),
            ("refresh interval", self.refresh_interval),
            ("stream open timeout", self.stream_open_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if !self.protocol.starts_with('/') {
            return Err(Error::Config(format!("protocol {:?} must start with '/'", self.protocol)));
        }
        if self.rendezvous_point.is_empty() || self.relayer_rendezvous_point.is_empty() {
            return Err(Error::Config("rendezvous points must be non-empty".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_size: usize,
    pub health_check_timeout: Duration,
    pub create_retry: RetryPolicy,
    pub resource_exhaustion_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            create_retry: RetryPolicy::default(),
            resource_exhaustion_threshold: DEFAULT_RESOURCE_EXHAUSTION_THRESHOLD,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("pool size must be at least 1".into()));
        }
        if self.health_check_timeout.is_zero() {
            return Err(Error::Config("health check timeout must be non-zero".into()));
        }
        if self.resource_exhaustion_threshold == 0 {
            return Err(Error::Config("resource exhaustion threshold must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub write_timeout: Duration,
    pub max_write_retries: u32,
    /// Delay schedule between write retries; attempts are bounded by `max_write_retries`.
    pub write_retry: RetryPolicy,
    pub max_concurrent_writes: usize,
    pub max_queue_size: usize,
    pub worker_pool_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
            write_retry: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30)),
            max_concurrent_writes: DEFAULT_MAX_CONCURRENT_WRITES,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_timeout.is_zero() {
            return Err(Error::Config("write timeout must be non-zero".into()));
        }
        if self.max_concurrent_writes == 0 || self.max_queue_size == 0 || self.worker_pool_size == 0 {
            return Err(Error::Config(
                "concurrent writes, queue size and worker pool size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn tcp_listen_addr(ip: Ipv4Addr) -> Multiaddr {
    Multiaddr::empty().with(Protocol::Ip4(ip)).with(Protocol::Tcp(0))
}

pub fn default_bootstrap_peers() -> Vec<Multiaddr> {
    DEFAULT_BOOTSTRAP_PEERS
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

// ============================================================================
// Log level
// ============================================================================

/// Verbosity on the 0..=6 scale (panic, fatal, error, warn, info, debug, trace) or by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevel(u8);

impl LogLevel {
    pub const INFO: LogLevel = LogLevel(4);

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn directive(self) -> &'static str {
        match self.0 {
            0 => "off",
            1 | 2 => "error",
            3 => "warn",
            4 => "info",
            5 => "debug",
            _ => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::INFO
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            if n <= 6 {
                return Ok(LogLevel(n));
            }
            return Err(Error::Config(format!("log level {n} is outside 0..=6")));
        }
        let level = match s.to_ascii_lowercase().as_str() {
            "panic" | "off" => 0,
            "fatal" => 1,
            "error" => 2,
            "warn" | "warning" => 3,
            "info" => 4,
            "debug" => 5,
            "trace" => 6,
            other => return Err(Error::Config(format!("unknown log level {other:?}"))),
        };
        Ok(LogLevel(level))
    }
}
