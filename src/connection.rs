//! # Sequencer Connection Manager
//!
//! Owns the single [`ConnectionState`]: the current overlay host, the sequencer it is
//! connected to, and the generation that identifies this pairing. Everything else reaches
//! the host through the manager, fresh on every use.
//!
//! ## State Machine
//!
//! ```text
//! Absent -> Connecting -> Connected -> Degraded -> Resetting -> Connected
//!                                                            \-> Absent
//! ```
//!
//! - `establish_connection` builds a host, resolves the sequencer and connects within
//!   `connect_timeout`.
//! - Stream creation that finds the sequencer disconnected, or that hits a resource limit,
//!   marks the connection `Degraded`.
//! - `reset` runs under the exclusive state lock: close the old host (errors ignored),
//!   build a new one, re-resolve and reconnect. The generation moves forward exactly once
//!   per successful reset. A failed reset leaves the state `Absent` and returns the error.
//!
//! ## Generations
//!
//! Every installed host gets a new generation. Streams remember the generation they were
//! opened under, so anything opened on a torn-down host is recognisably stale. Resets are
//! requested with the generation the caller observed: if another caller already reset
//! past it, the request is a no-op that returns the current generation.
//!
//! ## Dial Order
//!
//! 1. Direct dial of the resolved sequencer address.
//! 2. Trusted relayers for the relayer rendezvous point, in list order: connect, reserve,
//!    dial `<relayer>/p2p-circuit/p2p/<sequencer>`. A failing relayer moves on to the next.
//! 3. Relayers found by discovery during `discovery_window`, if the trust store trusts them.
//!    Only this step bootstraps inside the connect budget; otherwise bootstrap and
//!    advertisement run in the background once the host is installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, HostConfig};
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::host::{circuit_addr, HostStream, OverlayHost, PeerEvent};
use crate::protocols::SequencerLink;
use crate::sequencer::{SequencerDirectory, SequencerTarget};
use crate::trust::TrustStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Absent,
    Connecting,
    Connected,
    Degraded,
    Resetting,
}

/// How the sequencer was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Direct,
    TrustedRelay,
    DiscoveredRelay,
}

/// The live connection. Host and sequencer id are always set or cleared together.
#[derive(Default)]
pub struct ConnectionState {
    host: Option<OverlayHost>,
    sequencer_id: Option<PeerId>,
    generation: u64,
}

pub struct ConnectionManager {
    keypair: Keypair,
    host_config: HostConfig,
    config: ConnectionConfig,
    trust: Arc<TrustStore>,
    directory: Arc<dyn SequencerDirectory>,
    state: RwLock<ConnectionState>,
    /// Mirror of `state.generation` readable without the lock.
    generation: Arc<AtomicU64>,
    phase: Arc<Mutex<ConnectionPhase>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        keypair: Keypair,
        host_config: HostConfig,
        config: ConnectionConfig,
        trust: Arc<TrustStore>,
        directory: Arc<dyn SequencerDirectory>,
    ) -> Result<Self> {
        host_config.validate()?;
        config.validate()?;
        Ok(Self {
            keypair,
            host_config,
            config,
            trust,
            directory,
            state: RwLock::new(ConnectionState::default()),
            generation: Arc::new(AtomicU64::new(0)),
            phase: Arc::new(Mutex::new(ConnectionPhase::Absent)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.lock() = phase;
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn sequencer_id(&self) -> Option<PeerId> {
        self.state.read().await.sequencer_id
    }

    /// Peers connected to the current host, or zero when absent.
    pub async fn connected_peers(&self) -> usize {
        self.state
            .read()
            .await
            .host
            .as_ref()
            .map_or(0, OverlayHost::connected_count)
    }

    /// Connect if nothing is connected yet. Returns the generation in effect.
    pub async fn establish_connection(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.host.is_some() && state.sequencer_id.is_some() {
            return Ok(state.generation);
        }
        self.rebuild(&mut state).await
    }

    /// Tear down and rebuild unless the generation already moved past `observed`.
    pub async fn reset_connection(&self, observed: u64) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.generation != observed {
            debug!(observed, current = state.generation, "reset already performed by another caller");
            return Ok(state.generation);
        }

        self.set_phase(ConnectionPhase::Resetting);
        info!(generation = state.generation, "resetting sequencer connection");
        state.sequencer_id = None;
        if let Some(old) = state.host.take() {
            if let Err(e) = old.close().await {
                debug!(error = %e, "ignoring error closing previous host");
            }
        }
        self.directory.invalidate();

        let result = self.rebuild(&mut state).await;
        match &result {
            Ok(generation) => info!(generation, "connection reset complete"),
            Err(e) => warn!(error = %e, "connection reset failed, connection is absent"),
        }
        result
    }

    /// Reset only if the sequencer is not currently connected.
    pub async fn ensure_sequencer_connected(&self) -> Result<u64> {
        let (generation, healthy) = {
            let state = self.state.read().await;
            let healthy = match (&state.host, state.sequencer_id) {
                (Some(host), Some(seq)) => host.is_connected(&seq).await.unwrap_or(false),
                _ => false,
            };
            (state.generation, healthy)
        };
        if healthy {
            return Ok(generation);
        }
        self.set_phase(ConnectionPhase::Degraded);
        self.reset_connection(generation).await
    }

    /// Open a stream to the sequencer on the configured protocol.
    pub async fn open_sequencer_stream(&self) -> Result<(HostStream, u64)> {
        let state = self.state.read().await;
        let (Some(host), Some(seq)) = (state.host.as_ref(), state.sequencer_id) else {
            return Err(Error::NotConnected);
        };
        let generation = state.generation;

        if !host.is_connected(&seq).await.unwrap_or(false) {
            self.set_phase(ConnectionPhase::Degraded);
            return Err(Error::NotConnected);
        }

        match tokio::time::timeout(
            self.config.stream_open_timeout,
            host.open_stream(seq, &self.config.protocol),
        )
        .await
        {
            Ok(Ok(stream)) => Ok((stream, generation)),
            Ok(Err(e)) => {
                if e.is_resource_exhausted() {
                    self.set_phase(ConnectionPhase::Degraded);
                }
                Err(e)
            }
            Err(_) => Err(Error::StreamCreateFailed(format!(
                "stream open timed out after {:?}",
                self.config.stream_open_timeout
            ))),
        }
    }

    /// Periodically re-resolve the sequencer and reset when it changed (or when absent).
    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.refresh_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                manager.directory.invalidate();
                let target = match manager.directory.resolve(&manager.config.data_market).await {
                    Ok(target) => target,
                    Err(e) => {
                        warn!(error = %e, "sequencer refresh failed");
                        continue;
                    }
                };
                let (current, generation) = {
                    let state = manager.state.read().await;
                    (state.sequencer_id, state.generation)
                };
                if current == Some(target.peer_id) {
                    continue;
                }
                info!(previous = ?current, next = %target.peer_id, "sequencer changed");
                if let Err(e) = manager.reset_connection(generation).await {
                    warn!(error = %e, "reset after sequencer change failed");
                }
            }
        })
    }

    /// Close the host and leave the connection absent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.write().await;
        state.sequencer_id = None;
        if let Some(host) = state.host.take() {
            let _ = host.close().await;
        }
        self.set_phase(ConnectionPhase::Absent);
        info!("connection manager shut down");
    }

    // ------------------------------------------------------------------------
    // Internals. All run with the state write guard held by the caller.
    // ------------------------------------------------------------------------

    async fn rebuild(&self, state: &mut ConnectionState) -> Result<u64> {
        self.set_phase(ConnectionPhase::Connecting);
        let host = match OverlayHost::create(&self.keypair, self.host_config.clone()).await {
            Ok(host) => host,
            Err(e) => {
                self.set_phase(ConnectionPhase::Absent);
                return Err(e);
            }
        };

        let discovery = Discovery::new(host.clone(), self.config.discovery_interval);
        match self.connect(&host, &discovery).await {
            Ok((sequencer, route)) => {
                if let Err(e) = host.protect(sequencer).await {
                    debug!(error = %e, "could not protect sequencer connection");
                }
                state.generation += 1;
                state.host = Some(host.clone());
                state.sequencer_id = Some(sequencer);
                self.generation.store(state.generation, Ordering::SeqCst);
                self.set_phase(ConnectionPhase::Connected);
                self.watch_sequencer(&host, sequencer, state.generation);
                self.spawn_announce(discovery, route != Route::DiscoveredRelay);
                info!(%sequencer, ?route, generation = state.generation, "connected to sequencer");
                Ok(state.generation)
            }
            Err(e) => {
                let _ = host.close().await;
                self.set_phase(ConnectionPhase::Absent);
                Err(e)
            }
        }
    }

    async fn connect(&self, host: &OverlayHost, discovery: &Discovery) -> Result<(PeerId, Route)> {
        let target = self.directory.resolve(&self.config.data_market).await?;
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.dial_sequencer(host, discovery, &target)).await {
            Ok(Ok(route)) => Ok((target.peer_id, route)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectTimeout(timeout)),
        }
    }

    async fn dial_sequencer(
        &self,
        host: &OverlayHost,
        discovery: &Discovery,
        target: &SequencerTarget,
    ) -> Result<Route> {
        let sequencer = target.peer_id;
        let mut last_error = match host.dial(sequencer, target.addr.clone()).await {
            Ok(()) => {
                debug!(%sequencer, "connected directly");
                return Ok(Route::Direct);
            }
            Err(e) => {
                debug!(%sequencer, error = %e, "direct dial failed, trying relayers");
                e
            }
        };

        let point = self.config.relayer_rendezvous_point.as_str();
        match self.trust.trusted_relayers(point) {
            Ok(relayers) => {
                for relayer in relayers {
                    match self.dial_via_relay(host, &relayer.address, relayer.id, sequencer).await {
                        Ok(()) => {
                            info!(relayer = %relayer.name, %sequencer, "connected through trusted relayer");
                            return Ok(Route::TrustedRelay);
                        }
                        Err(e) => {
                            warn!(relayer = %relayer.name, error = %e, "relayer failed, trying next");
                            last_error = e;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "trusted relayers unavailable"),
        }

        let trust = &self.trust;
        let discovered = tokio::time::timeout(self.config.discovery_window, async {
            // Relayer lookups need a populated routing table on this host.
            if !self.config.bootstrap_peers.is_empty() {
                discovery.bootstrap(&self.config.bootstrap_peers).await;
            }
            let cancel = CancellationToken::new();
            let _stop = cancel.clone().drop_guard();
            loop {
                let accept = |info: &crate::host::PeerInfo| {
                    trust.is_trusted(&info.peer_id, point).unwrap_or(false)
                };
                let Some(relayer) = discovery.connect_to_peer(point, cancel.clone(), accept).await else {
                    return Err(Error::ConnectFailed("relayer discovery ended".into()));
                };
                for addr in &relayer.addrs {
                    match self.dial_via_relay(host, addr, relayer.peer_id, sequencer).await {
                        Ok(()) => return Ok(relayer.peer_id),
                        Err(e) => debug!(relayer = %relayer.peer_id, error = %e, "discovered relayer failed"),
                    }
                }
            }
        })
        .await;

        match discovered {
            Ok(Ok(relayer)) => {
                info!(%relayer, %sequencer, "connected through discovered relayer");
                Ok(Route::DiscoveredRelay)
            }
            Ok(Err(e)) => Err(Error::ConnectFailed(format!("{last_error}; {e}"))),
            Err(_) => Err(Error::ConnectFailed(format!(
                "no route to sequencer {sequencer}: {last_error}"
            ))),
        }
    }

    async fn dial_via_relay(
        &self,
        host: &OverlayHost,
        relay_addr: &Multiaddr,
        relay: PeerId,
        sequencer: PeerId,
    ) -> Result<()> {
        host.dial(relay, relay_addr.clone()).await?;
        match tokio::time::timeout(
            self.config.reservation_timeout,
            host.reserve_relay(relay, relay_addr.clone()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectTimeout(self.config.reservation_timeout)),
        }
        let circuit = circuit_addr(relay_addr, relay, sequencer);
        debug!(%circuit, "dialing sequencer through relay");
        host.dial(sequencer, circuit).await
    }

    /// Bootstrap (unless the dial already did) and advertise on a freshly installed host,
    /// outside the state lock. Ends with the host or at shutdown.
    fn spawn_announce(&self, discovery: Discovery, bootstrap: bool) {
        let peers = if bootstrap { self.config.bootstrap_peers.clone() } else { Vec::new() };
        let point = self.config.rendezvous_point.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let announce = async {
                if !peers.is_empty() {
                    discovery.bootstrap(&peers).await;
                }
                if let Err(e) = discovery.advertise(&point).await {
                    debug!(error = %e, "advertisement not published");
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = announce => {}
            }
        });
    }

    /// Mark the connection degraded as soon as the sequencer drops off this generation's host.
    fn watch_sequencer(&self, host: &OverlayHost, sequencer: PeerId, generation: u64) {
        let mut events = host.subscribe();
        let current = Arc::clone(&self.generation);
        let phase = Arc::clone(&self.phase);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                match event {
                    Ok(PeerEvent::Disconnected(peer)) if peer == sequencer => {
                        warn!(%sequencer, generation, "sequencer disconnected");
                        *phase.lock() = ConnectionPhase::Degraded;
                    }
                    Ok(PeerEvent::Connected(peer)) if peer == sequencer => {
                        *phase.lock() = ConnectionPhase::Connected;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}

#[async_trait]
impl SequencerLink for ConnectionManager {
    type Stream = HostStream;

    fn generation(&self) -> u64 {
        self.current_generation()
    }

    async fn open_stream(&self) -> Result<(HostStream, u64)> {
        self.open_sequencer_stream().await
    }

    async fn reset(&self, observed: u64) -> Result<u64> {
        self.reset_connection(observed).await
    }

    async fn ensure_connected(&self) -> Result<u64> {
        self.ensure_sequencer_connected().await
    }
}
