//! Shared fixtures: a sequencer host that collects everything written on `/collect`, and
//! a connection manager wired to it.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use futures::{AsyncReadExt, StreamExt};
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use snapshot_relay::config::{ConnectionConfig, HostConfig, COLLECT_PROTOCOL};
use snapshot_relay::{
    with_peer, ConnectionManager, OverlayHost, SequencerDirectory, SequencerTarget, StaticDirectory, TrustStore,
};
use tokio::sync::mpsc;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

static INIT: Once = Once::new();

/// Use RUST_LOG=debug for verbose output.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct Sequencer {
    pub host: OverlayHost,
    pub addr: Multiaddr,
    received: mpsc::UnboundedReceiver<Vec<u8>>,
    seen: Vec<u8>,
}

impl Sequencer {
    pub async fn spawn() -> Self {
        let host = OverlayHost::create(&Keypair::generate_ed25519(), HostConfig::local())
            .await
            .expect("sequencer host");
        let addr = host
            .listen_addrs()
            .await
            .expect("listen addrs")
            .into_iter()
            .next()
            .expect("sequencer listens somewhere");

        let mut incoming = host.accept(COLLECT_PROTOCOL).expect("accept /collect");
        let (tx, received) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some((_peer, mut stream)) = incoming.next().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx.send(buf[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { host, addr, received, seen: Vec::new() }
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    pub fn target(&self) -> SequencerTarget {
        SequencerTarget { peer_id: self.peer_id(), addr: self.addr.clone() }
    }

    /// Wait until `needle` has arrived on any stream.
    pub async fn wait_for(&mut self, needle: &[u8]) -> bool {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            if self.seen.windows(needle.len()).any(|w| w == needle) {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.received.recv()).await {
                Ok(Some(chunk)) => self.seen.extend(chunk),
                _ => return false,
            }
        }
    }
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        data_market: "0xtest".into(),
        bootstrap_peers: vec![],
        connect_timeout: Duration::from_secs(10),
        reservation_timeout: Duration::from_secs(5),
        discovery_window: Duration::from_millis(500),
        stream_open_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
}

pub fn manager_with(directory: Arc<dyn SequencerDirectory>, trust: TrustStore) -> Arc<ConnectionManager> {
    manager_with_config(directory, trust, connection_config())
}

pub fn manager_with_config(
    directory: Arc<dyn SequencerDirectory>,
    trust: TrustStore,
    config: ConnectionConfig,
) -> Arc<ConnectionManager> {
    Arc::new(
        ConnectionManager::new(
            Keypair::generate_ed25519(),
            HostConfig::local(),
            config,
            Arc::new(trust),
            directory,
        )
        .expect("valid manager config"),
    )
}

/// A started loopback host and its full `/p2p/` address.
pub async fn local_host() -> (OverlayHost, Multiaddr) {
    let host = OverlayHost::create(&Keypair::generate_ed25519(), HostConfig::local())
        .await
        .expect("host");
    let addr = host
        .listen_addrs()
        .await
        .expect("listen addrs")
        .into_iter()
        .next()
        .expect("host listens somewhere");
    let full = with_peer(&addr, host.local_peer_id());
    (host, full)
}

/// A `/p2p/` address that accepts no connections.
pub fn dead_peer_addr() -> Multiaddr {
    let peer = Keypair::generate_ed25519().public().to_peer_id();
    with_peer(&"/ip4/127.0.0.1/tcp/1".parse().expect("addr"), peer)
}

pub fn manager_for(sequencer: &Sequencer) -> Arc<ConnectionManager> {
    manager_with(
        Arc::new(StaticDirectory::new(sequencer.target())),
        TrustStore::with_records(vec![]),
    )
}
