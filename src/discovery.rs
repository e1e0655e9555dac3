//! # Rendezvous Discovery
//!
//! Rendezvous on top of Kademlia provider records: advertising under a point publishes a
//! provider record for the point's key, and finding peers under a point is a provider
//! lookup. Lookups are repeated on an interval so [`Discovery::find_peers`] behaves as a
//! long-lived feed until its token is cancelled.
//!
//! Consumers filter the feed themselves: [`Discovery::connect_to_peer`] skips this node,
//! peers with no known address and peers that are already connected, and keeps going when
//! a dial fails.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::{split_peer, OverlayHost, PeerInfo};
use crate::retry::sleep_or_cancel;

/// Peers buffered between the lookup task and the consumer.
const FIND_CHANNEL_SIZE: usize = 64;

/// Timeout for each individual bootstrap dial.
pub const BOOTSTRAP_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// True for feed entries worth dialing: not ourselves, and reachable at some address.
pub fn is_candidate(info: &PeerInfo, local: &PeerId) -> bool {
    info.peer_id != *local && !info.addrs.is_empty()
}

#[derive(Clone)]
pub struct Discovery {
    host: OverlayHost,
    interval: Duration,
}

impl Discovery {
    pub fn new(host: OverlayHost, interval: Duration) -> Self {
        Self { host, interval }
    }

    /// Seed the routing table and connect to bootstrap peers. Returns how many connected.
    ///
    /// Individual failures are logged and skipped.
    pub async fn bootstrap(&self, peers: &[Multiaddr]) -> usize {
        let dials = peers.iter().filter_map(|addr| {
            let Some((base, peer)) = split_peer(addr) else {
                warn!(%addr, "bootstrap address has no /p2p/ component, skipping");
                return None;
            };
            let host = self.host.clone();
            Some(async move {
                host.add_address(peer, base.clone()).await?;
                let dialed = match tokio::time::timeout(BOOTSTRAP_DIAL_TIMEOUT, host.dial(peer, base)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ConnectTimeout(BOOTSTRAP_DIAL_TIMEOUT)),
                };
                dialed.map(|()| peer)
            })
        });

        let mut connected = 0;
        for result in join_all(dials).await {
            match result {
                Ok(peer) => {
                    debug!(%peer, "connected to bootstrap peer");
                    connected += 1;
                }
                Err(e) => warn!(error = %e, "bootstrap dial failed"),
            }
        }

        if let Err(e) = self.host.bootstrap().await {
            debug!(error = %e, "routing table bootstrap skipped");
        }
        info!(connected, total = peers.len(), "bootstrap complete");
        connected
    }

    /// Advertise this node under `point`. Renewal is handled by provider republication.
    pub async fn advertise(&self, point: &str) -> Result<()> {
        self.host.start_providing(point).await?;
        debug!(point, "advertised rendezvous point");
        Ok(())
    }

    /// Feed of peers advertising `point`, re-queried every interval until `cancel` fires
    /// or the stream is dropped.
    pub fn find_peers(&self, point: &str, cancel: CancellationToken) -> ReceiverStream<PeerInfo> {
        let (tx, rx) = mpsc::channel(FIND_CHANNEL_SIZE);
        let host = self.host.clone();
        let key = point.to_string();
        let interval = self.interval;

        tokio::spawn(async move {
            loop {
                let mut providers = match host.get_providers(&key).await {
                    Ok(providers) => providers,
                    Err(e) => {
                        debug!(point = %key, error = %e, "peer lookup stopped");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = providers.recv() => match next {
                            Some(info) => {
                                if tx.send(info).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                }
                if !sleep_or_cancel(interval, &cancel).await {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Connect to the first acceptable peer advertising `point`.
    ///
    /// `accept` is consulted after the self/zero-address/already-connected filters. Each
    /// peer is attempted at most once per call. Returns `None` when `cancel` fires first.
    pub async fn connect_to_peer<F>(
        &self,
        point: &str,
        cancel: CancellationToken,
        accept: F,
    ) -> Option<PeerInfo>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let local = self.host.local_peer_id();
        let lookup = cancel.child_token();
        let _stop_lookup = lookup.clone().drop_guard();
        let mut peers = self.find_peers(point, lookup);
        let mut attempted = HashSet::new();

        loop {
            let info = tokio::select! {
                _ = cancel.cancelled() => return None,
                next = peers.next() => next?,
            };
            if !is_candidate(&info, &local) || !attempted.insert(info.peer_id) {
                continue;
            }
            match self.host.is_connected(&info.peer_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(_) => return None,
            }
            if !accept(&info) {
                debug!(peer = %info.peer_id, "discovered peer rejected");
                continue;
            }
            for addr in &info.addrs {
                match self.host.dial(info.peer_id, addr.clone()).await {
                    Ok(()) => {
                        info!(peer = %info.peer_id, %addr, point, "connected to discovered peer");
                        return Some(info);
                    }
                    Err(e) => debug!(peer = %info.peer_id, %addr, error = %e, "dial failed"),
                }
            }
            warn!(peer = %info.peer_id, "could not connect to discovered peer, trying next");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    #[test]
    fn candidates_exclude_self_and_addressless() {
        let local = peer();
        let addr: Multiaddr = "/ip4/10.1.1.1/tcp/4001".parse().unwrap();

        let remote = PeerInfo { peer_id: peer(), addrs: vec![addr.clone()] };
        assert!(is_candidate(&remote, &local));

        let me = PeerInfo { peer_id: local, addrs: vec![addr] };
        assert!(!is_candidate(&me, &local));

        let silent = PeerInfo { peer_id: peer(), addrs: vec![] };
        assert!(!is_candidate(&silent, &local));
    }
}
