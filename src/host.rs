//! # Overlay Host
//!
//! The host owns the node's single libp2p swarm. A cheap [`OverlayHost`] handle talks to a
//! private actor task that owns the swarm and processes commands sequentially, so no swarm
//! state is ever shared behind a lock.
//!
//! ## Transport Stack
//!
//! | Layer | Implementation |
//! |-------|----------------|
//! | Transports | TCP, QUIC v1, DNS resolution, relay circuits |
//! | Security | TLS 1.3 and Noise XX, negotiated per connection |
//! | Multiplexing | yamux (QUIC is natively multiplexed) |
//! | NAT traversal | UPnP port mapping, DCUtR hole punching, relay v2 client |
//! | Relay service | relay v2 server (optional) |
//! | Routing | Kademlia (provider records for rendezvous) |
//!
//! ## Resource Management
//!
//! - Connection counts, per-peer and pending limits via `connection_limits`; a fixed
//!   file-descriptor budget also caps established connections.
//! - Process memory ceiling via `memory_connection_limits`.
//! - Outbound application streams via a semaphore; when it is exhausted
//!   [`OverlayHost::open_stream`] fails with [`Error::ResourceExhausted`].
//! - Watermark trimming: above `high_water` connected peers, the oldest unprotected peers
//!   past their grace period are disconnected down to `low_water`.
//!
//! ## Lifecycle
//!
//! [`OverlayHost::create`] returns once the first listen address is bound.
//! [`OverlayHost::close`] drops the swarm, which closes every connection and therefore
//! every stream opened from this host. A closed host answers every call with
//! [`Error::HostClosed`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{AsyncWriteExt, StreamExt};
use libp2p::core::transport::ListenerId;
use libp2p::core::ConnectedPoint;
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{
    connection_limits, dcutr, identify, memory_connection_limits, noise, ping, relay, tcp, tls,
    upnp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use libp2p_stream::{Control, IncomingStreams, OpenStreamError};
use lru::LruCache;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::config::{HostConfig, Watermarks};
use crate::error::{Error, Result};
use crate::protocols::SubmissionStream;

/// Identify protocol version advertised to peers.
pub const IDENTIFY_PROTOCOL: &str = "/snapshot-relay/id/1.0.0";

/// Time allowed for the first listen address to come up.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_CHANNEL_SIZE: usize = 256;
const PEER_EVENT_CHANNEL_SIZE: usize = 256;
/// Provider results buffered per lookup before the swarm task starts dropping them.
const PROVIDER_CHANNEL_SIZE: usize = 64;

/// SECURITY: bound on peers whose addresses we remember.
const ADDRESS_BOOK_CAPACITY: usize = 4096;
/// Addresses remembered per peer.
const MAX_ADDRS_PER_PEER: usize = 8;

/// Relay service circuit limits. Generous: circuits carry every submission until
/// hole punching succeeds.
const RELAY_CIRCUIT_DURATION: Duration = Duration::from_secs(30 * 60);
const RELAY_CIRCUIT_BYTES: u64 = 64 * 1024 * 1024;

// ============================================================================
// Public types
// ============================================================================

/// A peer as seen by routing: identity plus every address we know for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// An outbound stream opened on this host. Holds its stream-limit slot until dropped.
pub struct HostStream {
    inner: libp2p::Stream,
    peer: PeerId,
    _permit: Option<OwnedSemaphorePermit>,
}

impl HostStream {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

#[async_trait]
impl SubmissionStream for HostStream {
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await.map_err(Error::stream_dead)?;
        self.inner.flush().await.map_err(Error::stream_dead)
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            trace!(peer = %self.peer, error = %e, "stream close failed");
        }
    }
}

/// Append `/p2p/<peer>` unless the address already ends with it.
pub fn with_peer(addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    match addr.iter().last() {
        Some(Protocol::P2p(existing)) if existing == peer => addr.clone(),
        _ => addr.clone().with(Protocol::P2p(peer)),
    }
}

/// Split a trailing `/p2p/<peer>` off an address.
pub fn split_peer(addr: &Multiaddr) -> Option<(Multiaddr, PeerId)> {
    let mut base = addr.clone();
    match base.pop() {
        Some(Protocol::P2p(peer)) => Some((base, peer)),
        _ => None,
    }
}

/// `<relay addr>/p2p/<relay>/p2p-circuit/p2p/<target>`.
pub fn circuit_addr(relay_addr: &Multiaddr, relay: PeerId, target: PeerId) -> Multiaddr {
    with_peer(relay_addr, relay)
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(target))
}

/// Peers to disconnect so the connected count falls from above `high_water` to `low_water`.
///
/// Protected peers and peers connected for less than the grace period are never chosen.
/// Oldest connections go first.
pub fn select_trim_victims(
    peers: &[(PeerId, Instant)],
    protected: &HashSet<PeerId>,
    now: Instant,
    watermarks: &Watermarks,
) -> Vec<PeerId> {
    if peers.len() <= watermarks.high_water {
        return Vec::new();
    }
    let excess = peers.len() - watermarks.low_water;

    let mut eligible: Vec<&(PeerId, Instant)> = peers
        .iter()
        .filter(|(peer, since)| {
            !protected.contains(peer) && now.saturating_duration_since(*since) >= watermarks.grace_period
        })
        .collect();
    eligible.sort_by_key(|(_, since)| *since);
    eligible.into_iter().take(excess).map(|(peer, _)| *peer).collect()
}

// ============================================================================
// Behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
struct HostBehaviour {
    limits: connection_limits::Behaviour,
    memory: Toggle<memory_connection_limits::Behaviour>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kad: kad::Behaviour<MemoryStore>,
    relay_client: relay::client::Behaviour,
    relay: Toggle<relay::Behaviour>,
    dcutr: dcutr::Behaviour,
    upnp: Toggle<upnp::tokio::Behaviour>,
    stream: libp2p_stream::Behaviour,
}

fn build_behaviour(
    key: &Keypair,
    relay_client: relay::client::Behaviour,
    config: &HostConfig,
) -> HostBehaviour {
    let peer_id = key.public().to_peer_id();

    let limits = connection_limits::ConnectionLimits::default()
        .with_max_established(config.limits.max_established())
        .with_max_established_per_peer(config.limits.connections_per_peer.as_u32())
        .with_max_pending_incoming(config.limits.pending_connections.as_u32())
        .with_max_pending_outgoing(config.limits.pending_connections.as_u32());

    let memory = config
        .limits
        .memory_bytes
        .as_option()
        .map(|bytes| memory_connection_limits::Behaviour::with_max_bytes(bytes as usize));

    let mut kad_config = kad::Config::new(kad::PROTOCOL_NAME);
    kad_config
        .set_provider_record_ttl(Some(config.provider_ttl))
        .set_provider_publication_interval(Some(config.provider_ttl / 2))
        .set_query_timeout(config.query_timeout);
    let mut kad = kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);
    kad.set_mode(Some(kad::Mode::Server));

    let relay = config.relay_service.then(|| {
        let relay_config = relay::Config {
            max_circuit_duration: RELAY_CIRCUIT_DURATION,
            max_circuit_bytes: RELAY_CIRCUIT_BYTES,
            ..relay::Config::default()
        };
        relay::Behaviour::new(peer_id, relay_config)
    });

    HostBehaviour {
        limits: connection_limits::Behaviour::new(limits),
        memory: Toggle::from(memory),
        identify: identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            key.public(),
        )),
        ping: ping::Behaviour::default(),
        kad,
        relay_client,
        relay: Toggle::from(relay),
        dcutr: dcutr::Behaviour::new(peer_id),
        upnp: Toggle::from(config.upnp.then(upnp::tokio::Behaviour::default)),
        stream: libp2p_stream::Behaviour::new(),
    }
}

fn creation_failed(e: impl std::fmt::Display) -> Error {
    Error::HostCreationFailed(e.to_string())
}

fn build_swarm(keypair: &Keypair, config: &HostConfig) -> Result<Swarm<HostBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            (tls::Config::new, noise::Config::new),
            yamux::Config::default,
        )
        .map_err(creation_failed)?
        .with_quic()
        .with_dns()
        .map_err(creation_failed)?
        .with_relay_client((tls::Config::new, noise::Config::new), yamux::Config::default)
        .map_err(creation_failed)?
        .with_behaviour(|key, relay_client| build_behaviour(key, relay_client, config))
        .map_err(creation_failed)?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
        .build();
    Ok(swarm)
}

fn classify_dial_error(error: &DialError) -> Error {
    match error {
        DialError::Denied { cause } => Error::ResourceExhausted(cause.to_string()),
        other => Error::ConnectFailed(other.to_string()),
    }
}

fn classify_open_error(error: OpenStreamError) -> Error {
    match error {
        OpenStreamError::UnsupportedProtocol(p) => {
            Error::StreamCreateFailed(format!("peer does not support {p}"))
        }
        OpenStreamError::Io(e) if is_resource_limit(&e) => Error::ResourceExhausted(e.to_string()),
        other => Error::StreamCreateFailed(other.to_string()),
    }
}

fn is_resource_limit(e: &io::Error) -> bool {
    let text = e.to_string();
    text.contains("resource limit") || text.contains("max sub-streams")
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Dial {
        peer: PeerId,
        addr: Multiaddr,
        reply: oneshot::Sender<Result<()>>,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    ReserveRelay {
        relay: PeerId,
        addr: Multiaddr,
        reply: oneshot::Sender<Result<()>>,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    Bootstrap {
        reply: oneshot::Sender<Result<()>>,
    },
    StartProviding {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GetProviders {
        key: String,
        results: mpsc::Sender<PeerInfo>,
    },
    Protect {
        peer: PeerId,
        protected: bool,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a running overlay host. Clones share the same swarm.
#[derive(Clone)]
pub struct OverlayHost {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    control: Control,
    stream_permits: Option<Arc<Semaphore>>,
    connected: Arc<AtomicUsize>,
    events: broadcast::Sender<PeerEvent>,
}

impl std::fmt::Debug for OverlayHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayHost")
            .field("peer_id", &self.local_peer_id)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl OverlayHost {
    /// Build the swarm, start listening and spawn the host task.
    pub async fn create(keypair: &Keypair, config: HostConfig) -> Result<Self> {
        config.validate()?;
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, &config)?;

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| Error::HostCreationFailed(format!("listen on {addr}: {e}")))?;
        }

        let control = swarm.behaviour().stream.new_control();
        let stream_permits = config
            .limits
            .streams
            .as_option()
            .map(|n| Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS as u64) as usize)));
        let connected = Arc::new(AtomicUsize::new(0));
        let (events, _) = broadcast::channel(PEER_EVENT_CHANNEL_SIZE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let actor = HostActor::new(swarm, &config, connected.clone(), events.clone(), ready_tx);
        tokio::spawn(actor.run(cmd_rx));

        let host = Self {
            local_peer_id,
            cmd_tx,
            control,
            stream_permits,
            connected,
            events,
        };

        match tokio::time::timeout(LISTEN_TIMEOUT, ready_rx).await {
            Ok(Ok(addr)) => {
                info!(peer = %local_peer_id, %addr, "overlay host listening");
                Ok(host)
            }
            Ok(Err(_)) => Err(Error::HostCreationFailed("host task exited during startup".into())),
            Err(_) => {
                let _ = host.close().await;
                Err(Error::HostCreationFailed(format!(
                    "no listen address bound within {LISTEN_TIMEOUT:?}"
                )))
            }
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Number of distinct peers currently connected.
    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::HostClosed)?;
        reply_rx.await.map_err(|_| Error::HostClosed)
    }

    /// Connect to `peer` at `addr`. Returns immediately if already connected.
    pub async fn dial(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        self.request(|reply| Command::Dial { peer, addr, reply }).await?
    }

    pub async fn is_connected(&self, peer: &PeerId) -> Result<bool> {
        let peer = *peer;
        self.request(|reply| Command::IsConnected { peer, reply }).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.request(|reply| Command::ListenAddrs { reply }).await
    }

    /// Obtain a relay v2 reservation on `relay`, reachable at `addr`.
    pub async fn reserve_relay(&self, relay: PeerId, addr: Multiaddr) -> Result<()> {
        self.request(|reply| Command::ReserveRelay { relay, addr, reply }).await?
    }

    /// Seed the routing table.
    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        self.cmd_tx
            .send(Command::AddAddress { peer, addr })
            .await
            .map_err(|_| Error::HostClosed)
    }

    pub async fn bootstrap(&self) -> Result<()> {
        self.request(|reply| Command::Bootstrap { reply }).await?
    }

    /// Publish a provider record for `key`. Kademlia republishes it on its own schedule.
    pub async fn start_providing(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.request(|reply| Command::StartProviding { key, reply }).await?
    }

    /// One provider lookup. The receiver ends when the lookup finishes.
    pub async fn get_providers(&self, key: &str) -> Result<mpsc::Receiver<PeerInfo>> {
        let (results, rx) = mpsc::channel(PROVIDER_CHANNEL_SIZE);
        self.cmd_tx
            .send(Command::GetProviders { key: key.to_string(), results })
            .await
            .map_err(|_| Error::HostClosed)?;
        Ok(rx)
    }

    /// Exempt `peer` from watermark trimming.
    pub async fn protect(&self, peer: PeerId) -> Result<()> {
        self.cmd_tx
            .send(Command::Protect { peer, protected: true })
            .await
            .map_err(|_| Error::HostClosed)
    }

    pub async fn unprotect(&self, peer: PeerId) -> Result<()> {
        self.cmd_tx
            .send(Command::Protect { peer, protected: false })
            .await
            .map_err(|_| Error::HostClosed)
    }

    /// Open an outbound stream on `protocol`, bounded by the stream limit.
    pub async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<HostStream> {
        if self.cmd_tx.is_closed() {
            return Err(Error::HostClosed);
        }
        let permit = match &self.stream_permits {
            Some(permits) => Some(permits.clone().try_acquire_owned().map_err(|_| {
                Error::ResourceExhausted(format!("outbound stream limit reached for {protocol}"))
            })?),
            None => None,
        };
        let protocol = parse_protocol(protocol)?;
        let inner = self
            .control
            .clone()
            .open_stream(peer, protocol)
            .await
            .map_err(classify_open_error)?;
        Ok(HostStream {
            inner,
            peer,
            _permit: permit,
        })
    }

    /// Accept inbound streams on `protocol`.
    pub fn accept(&self, protocol: &str) -> Result<IncomingStreams> {
        let protocol = parse_protocol(protocol)?;
        self.control
            .clone()
            .accept(protocol)
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Shut the host down. Terminal: every later call fails with `HostClosed`.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }
}

fn parse_protocol(protocol: &str) -> Result<StreamProtocol> {
    StreamProtocol::try_from_owned(protocol.to_string())
        .map_err(|e| Error::Config(format!("invalid protocol {protocol:?}: {e}")))
}

// ============================================================================
// Actor
// ============================================================================

struct PeerEntry {
    connections: usize,
    since: Instant,
}

struct HostActor {
    swarm: Swarm<HostBehaviour>,
    watermarks: Watermarks,
    cleanup_interval: Duration,
    announce_listen_addrs: bool,
    connected: Arc<AtomicUsize>,
    events: broadcast::Sender<PeerEvent>,
    ready: Option<oneshot::Sender<Multiaddr>>,
    peers: HashMap<PeerId, PeerEntry>,
    protected: HashSet<PeerId>,
    address_book: LruCache<PeerId, Vec<Multiaddr>>,
    listen_addrs: Vec<Multiaddr>,
    pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<()>>>,
    pending_reservations: HashMap<PeerId, (ListenerId, oneshot::Sender<Result<()>>)>,
    reservations: HashMap<PeerId, ListenerId>,
    provider_queries: HashMap<QueryId, mpsc::Sender<PeerInfo>>,
}

impl HostActor {
    fn new(
        swarm: Swarm<HostBehaviour>,
        config: &HostConfig,
        connected: Arc<AtomicUsize>,
        events: broadcast::Sender<PeerEvent>,
        ready: oneshot::Sender<Multiaddr>,
    ) -> Self {
        let capacity = NonZeroUsize::new(ADDRESS_BOOK_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            swarm,
            watermarks: config.watermarks.clone(),
            cleanup_interval: config.cleanup_interval,
            announce_listen_addrs: config.announce_listen_addrs,
            connected,
            events,
            ready: Some(ready),
            peers: HashMap::new(),
            protected: HashSet::new(),
            address_book: LruCache::new(capacity),
            listen_addrs: Vec::new(),
            pending_dials: HashMap::new(),
            pending_reservations: HashMap::new(),
            reservations: HashMap::new(),
            provider_queries: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut cleanup = tokio::time::interval(self.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cleanup.tick().await;

        let close_reply = loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Close { reply }) => break Some(reply),
                    Some(cmd) => self.handle_command(cmd),
                    None => break None,
                },
                _ = cleanup.tick() => self.trim_connections(),
            }
        };

        drop(cmd_rx);
        self.fail_pending();
        self.connected.store(0, Ordering::Relaxed);
        let peer = *self.swarm.local_peer_id();
        drop(self);
        debug!(%peer, "overlay host closed");
        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending_dials.drain() {
            let _ = reply.send(Err(Error::HostClosed));
        }
        for (_, (_, reply)) in self.pending_reservations.drain() {
            let _ = reply.send(Err(Error::HostClosed));
        }
        self.provider_queries.clear();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { peer, addr, reply } => self.dial(peer, addr, reply),
            Command::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.listen_addrs.clone());
            }
            Command::ReserveRelay { relay, addr, reply } => self.reserve(relay, addr, reply),
            Command::AddAddress { peer, addr } => {
                self.remember(peer, addr.clone());
                self.swarm.behaviour_mut().kad.add_address(&peer, addr);
            }
            Command::Bootstrap { reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .bootstrap()
                    .map(|_| ())
                    .map_err(|e| Error::ConnectFailed(format!("routing bootstrap: {e}")));
                let _ = reply.send(result);
            }
            Command::StartProviding { key, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(RecordKey::new(&key))
                    .map(|_| ())
                    .map_err(|e| Error::ResourceExhausted(format!("provider store: {e}")));
                let _ = reply.send(result);
            }
            Command::GetProviders { key, results } => {
                let id = self.swarm.behaviour_mut().kad.get_providers(RecordKey::new(&key));
                self.provider_queries.insert(id, results);
            }
            Command::Protect { peer, protected } => {
                if protected {
                    self.protected.insert(peer);
                } else {
                    self.protected.remove(&peer);
                }
            }
            // Consumed by the run loop before dispatch.
            Command::Close { .. } => {}
        }
    }

    fn dial(&mut self, peer: PeerId, addr: Multiaddr, reply: oneshot::Sender<Result<()>>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        let opts = DialOpts::peer_id(peer)
            .addresses(vec![addr.clone()])
            .condition(PeerCondition::Always)
            .build();
        let id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                debug!(%peer, %addr, "dialing");
                self.pending_dials.insert(id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(classify_dial_error(&e)));
            }
        }
    }

    fn reserve(&mut self, relay: PeerId, addr: Multiaddr, reply: oneshot::Sender<Result<()>>) {
        if self.reservations.contains_key(&relay) {
            let _ = reply.send(Ok(()));
            return;
        }
        let listen = with_peer(&addr, relay).with(Protocol::P2pCircuit);
        match self.swarm.listen_on(listen.clone()) {
            Ok(listener) => {
                debug!(%relay, addr = %listen, "requesting relay reservation");
                if let Some((_, previous)) = self.pending_reservations.insert(relay, (listener, reply)) {
                    let _ = previous.send(Err(Error::ConnectFailed("superseded reservation".into())));
                }
            }
            Err(e) => {
                let _ = reply.send(Err(Error::ConnectFailed(format!("relay listen: {e}"))));
            }
        }
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        if addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)) {
            return;
        }
        let addrs = self.address_book.get_or_insert_mut(peer, Vec::new);
        if !addrs.contains(&addr) {
            if addrs.len() >= MAX_ADDRS_PER_PEER {
                addrs.remove(0);
            }
            addrs.push(addr);
        }
    }

    fn known_addrs(&mut self, peer: &PeerId) -> Vec<Multiaddr> {
        self.address_book.get(peer).cloned().unwrap_or_default()
    }

    fn trim_connections(&mut self) {
        let peers: Vec<(PeerId, Instant)> = self.peers.iter().map(|(p, e)| (*p, e.since)).collect();
        let victims = select_trim_victims(&peers, &self.protected, Instant::now(), &self.watermarks);
        if victims.is_empty() {
            return;
        }
        info!(connected = peers.len(), trimming = victims.len(), "connection count above high water");
        for peer in victims {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<HostBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                if address.iter().any(|p| matches!(p, Protocol::P2pCircuit)) {
                    debug!(%address, "relayed listen address");
                } else {
                    if self.announce_listen_addrs {
                        self.swarm.add_external_address(address.clone());
                    }
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(address.clone());
                    }
                }
                self.listen_addrs.push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                self.reservations.retain(|_, id| *id != listener_id);
                let relay = self
                    .pending_reservations
                    .iter()
                    .find(|(_, (id, _))| *id == listener_id)
                    .map(|(relay, _)| *relay);
                if let Some((_, reply)) = relay.and_then(|r| self.pending_reservations.remove(&r)) {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    let _ = reply.send(Err(Error::ConnectFailed(format!("relay reservation: {reason}"))));
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, connection_id, endpoint, .. } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
                if let ConnectedPoint::Dialer { address, .. } = &endpoint {
                    self.remember(peer_id, address.clone());
                }
                let entry = self.peers.entry(peer_id).or_insert_with(|| PeerEntry {
                    connections: 0,
                    since: Instant::now(),
                });
                entry.connections += 1;
                if entry.connections == 1 {
                    self.connected.store(self.peers.len(), Ordering::Relaxed);
                    let _ = self.events.send(PeerEvent::Connected(peer_id));
                    debug!(peer = %peer_id, relayed = endpoint.is_relayed(), "peer connected");
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 && self.peers.remove(&peer_id).is_some() {
                    self.connected.store(self.peers.len(), Ordering::Relaxed);
                    let _ = self.events.send(PeerEvent::Disconnected(peer_id));
                    debug!(peer = %peer_id, "peer disconnected");
                } else if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.connections = num_established as usize;
                }
            }
            SwarmEvent::OutgoingConnectionError { connection_id, peer_id, error, .. } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    debug!(peer = ?peer_id, error = %error, "dial failed");
                    let _ = reply.send(Err(classify_dial_error(&error)));
                }
            }
            SwarmEvent::NewExternalAddrOfPeer { peer_id, address } => {
                self.remember(peer_id, address);
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: HostBehaviourEvent) {
        match event {
            HostBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in info.listen_addrs {
                    if addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)) {
                        continue;
                    }
                    self.remember(peer_id, addr.clone());
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            HostBehaviourEvent::Kad(kad::Event::RoutingUpdated { peer, addresses, .. }) => {
                for addr in addresses.iter() {
                    self.remember(peer, addr.clone());
                }
            }
            HostBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed { id, result, step, .. }) => {
                match result {
                    QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                        let found: Vec<PeerInfo> = providers
                            .into_iter()
                            .map(|peer_id| PeerInfo {
                                peer_id,
                                addrs: self.known_addrs(&peer_id),
                            })
                            .collect();
                        if let Some(results) = self.provider_queries.get(&id) {
                            for info in found {
                                if results.try_send(info).is_err() {
                                    trace!(query = ?id, "provider consumer lagging, result dropped");
                                }
                            }
                        }
                    }
                    QueryResult::GetProviders(Err(e)) => {
                        debug!(query = ?id, error = %e, "provider lookup ended with error");
                    }
                    QueryResult::StartProviding(Err(e)) => {
                        debug!(error = %e, "provider record not replicated");
                    }
                    QueryResult::Bootstrap(Err(e)) => {
                        debug!(error = %e, "routing bootstrap step failed");
                    }
                    _ => {}
                }
                if step.last {
                    self.provider_queries.remove(&id);
                }
            }
            HostBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                if let Some((listener, reply)) = self.pending_reservations.remove(&relay_peer_id) {
                    self.reservations.insert(relay_peer_id, listener);
                    let _ = reply.send(Ok(()));
                }
                if !renewal {
                    info!(relay = %relay_peer_id, "relay reservation accepted");
                }
            }
            HostBehaviourEvent::Dcutr(event) => {
                debug!(peer = %event.remote_peer_id, result = ?event.result.map(|_| ()), "hole punch attempt");
            }
            HostBehaviourEvent::Upnp(upnp::Event::NewExternalAddr(addr)) => {
                info!(%addr, "UPnP mapped external address");
            }
            HostBehaviourEvent::Upnp(upnp::Event::GatewayNotFound) => {
                debug!("no UPnP gateway found");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    fn marks(low: usize, high: usize, grace_secs: u64) -> Watermarks {
        Watermarks {
            low_water: low,
            high_water: high,
            grace_period: Duration::from_secs(grace_secs),
        }
    }

    #[test]
    fn no_trim_at_or_below_high_water() {
        let now = Instant::now();
        let peers: Vec<_> = (0..4).map(|_| (peer(), now - Duration::from_secs(600))).collect();
        assert!(select_trim_victims(&peers, &HashSet::new(), now, &marks(2, 4, 0)).is_empty());
    }

    #[test]
    fn trims_down_to_low_water_oldest_first() {
        let now = Instant::now();
        let peers: Vec<_> = (0..6u64)
            .map(|i| (peer(), now - Duration::from_secs(1000 - i * 100)))
            .collect();
        let victims = select_trim_victims(&peers, &HashSet::new(), now, &marks(3, 5, 0));
        assert_eq!(victims, vec![peers[0].0, peers[1].0, peers[2].0]);
    }

    #[test]
    fn protected_and_young_peers_survive() {
        let now = Instant::now();
        let old = now - Duration::from_secs(600);
        let young = now - Duration::from_secs(5);
        let peers = vec![(peer(), old), (peer(), old), (peer(), young), (peer(), young)];
        let protected: HashSet<_> = [peers[0].0].into_iter().collect();

        let victims = select_trim_victims(&peers, &protected, now, &marks(1, 3, 60));
        assert_eq!(victims, vec![peers[1].0]);
    }

    #[test]
    fn circuit_address_layout() {
        let relay = peer();
        let target = peer();
        let base: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();

        let expected: Multiaddr = format!("/ip4/10.0.0.1/tcp/4001/p2p/{relay}/p2p-circuit/p2p/{target}")
            .parse()
            .unwrap();
        assert_eq!(circuit_addr(&base, relay, target), expected);
        assert_eq!(circuit_addr(&with_peer(&base, relay), relay, target), expected);
    }

    #[test]
    fn split_peer_handles_both_forms() {
        let id = peer();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/9000/p2p/{id}").parse().unwrap();
        let (base, parsed) = split_peer(&addr).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(base, "/ip4/127.0.0.1/tcp/9000".parse::<Multiaddr>().unwrap());
        assert!(split_peer(&base).is_none());
    }

    #[test]
    fn aborted_dials_are_connect_failures() {
        let err = classify_dial_error(&DialError::Aborted);
        assert!(matches!(err, Error::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn create_and_close() {
        let keypair = Keypair::generate_ed25519();
        let host = OverlayHost::create(&keypair, HostConfig::local()).await.unwrap();
        assert_eq!(host.local_peer_id(), keypair.public().to_peer_id());
        assert!(!host.listen_addrs().await.unwrap().is_empty());
        assert_eq!(host.connected_count(), 0);

        host.close().await.unwrap();
        assert!(matches!(host.listen_addrs().await, Err(Error::HostClosed)));
        assert!(matches!(host.close().await, Err(Error::HostClosed)));
        assert!(matches!(
            host.open_stream(peer(), "/collect").await,
            Err(Error::HostClosed)
        ));
    }
}
