//! # Sequencer Directory
//!
//! Resolves the data market's current sequencer to a dialable `(PeerId, Multiaddr)`.
//!
//! | Directory | Source |
//! |-----------|--------|
//! | [`HttpDirectory`] | JSON document fetched over HTTP(S), cached between refreshes |
//! | [`StaticDirectory`] | one fixed multiaddr ending in `/p2p/<id>` |
//!
//! The HTTP document is an array of entries keyed by data market address:
//!
//! ```json
//! [{"dataMarketAddress": "0xabc...", "sequencerId": "12D3KooW...",
//!   "maddr": "/ip4/1.2.3.4/tcp/9100"}]
//! ```
//!
//! `sequencerId` may be omitted when `maddr` already ends in `/p2p/<id>`. Addresses are
//! matched case-insensitively. When a refresh fails, the last good answer is served.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::host::{split_peer, with_peer};
use crate::retry::{retry, RetryPolicy};

/// HTTP fetch timeout for the directory document.
pub const DIRECTORY_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Where the sequencer can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencerTarget {
    pub peer_id: PeerId,
    /// Transport address without the trailing `/p2p/<id>`.
    pub addr: Multiaddr,
}

impl SequencerTarget {
    /// Parse a full `.../p2p/<id>` multiaddr.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self> {
        let (addr, peer_id) = split_peer(addr)
            .ok_or_else(|| Error::Directory(format!("{addr} does not end in /p2p/<peer id>")))?;
        Ok(Self { peer_id, addr })
    }

    pub fn full_addr(&self) -> Multiaddr {
        with_peer(&self.addr, self.peer_id)
    }
}

#[async_trait]
pub trait SequencerDirectory: Send + Sync + 'static {
    /// Current sequencer for `data_market`. May serve a cached answer.
    async fn resolve(&self, data_market: &str) -> Result<SequencerTarget>;

    /// Drop any cached answer so the next `resolve` consults the source.
    fn invalidate(&self) {}
}

// ============================================================================
// Static
// ============================================================================

pub struct StaticDirectory {
    target: SequencerTarget,
}

impl StaticDirectory {
    pub fn new(target: SequencerTarget) -> Self {
        Self { target }
    }

    pub fn from_addr(addr: &Multiaddr) -> Result<Self> {
        SequencerTarget::from_p2p_addr(addr).map(Self::new)
    }
}

#[async_trait]
impl SequencerDirectory for StaticDirectory {
    async fn resolve(&self, _data_market: &str) -> Result<SequencerTarget> {
        Ok(self.target.clone())
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryEntry {
    data_market_address: String,
    #[serde(default)]
    sequencer_id: Option<String>,
    maddr: String,
}

/// Pick the entry for `data_market` out of a directory document.
pub fn parse_directory(document: &str, data_market: &str) -> Result<SequencerTarget> {
    let entries: Vec<DirectoryEntry> = serde_json::from_str(document)
        .map_err(|e| Error::Directory(format!("malformed directory: {e}")))?;
    let entry = entries
        .into_iter()
        .find(|e| e.data_market_address.eq_ignore_ascii_case(data_market))
        .ok_or_else(|| Error::Directory(format!("no sequencer listed for data market {data_market}")))?;

    let maddr = Multiaddr::from_str(&entry.maddr)
        .map_err(|e| Error::Directory(format!("bad sequencer address {:?}: {e}", entry.maddr)))?;

    match entry.sequencer_id {
        Some(id) => {
            let peer_id = PeerId::from_str(&id)
                .map_err(|e| Error::Directory(format!("bad sequencer id {id:?}: {e}")))?;
            let addr = match split_peer(&maddr) {
                Some((base, embedded)) if embedded == peer_id => base,
                Some((_, embedded)) => {
                    return Err(Error::Directory(format!(
                        "sequencer id {peer_id} disagrees with address peer {embedded}"
                    )))
                }
                None => maddr,
            };
            Ok(SequencerTarget { peer_id, addr })
        }
        None => SequencerTarget::from_p2p_addr(&maddr),
    }
}

struct Cached {
    data_market: String,
    target: SequencerTarget,
    fetched_at: Instant,
    invalidated: bool,
}

pub struct HttpDirectory {
    url: String,
    client: reqwest::Client,
    max_age: Duration,
    retry: RetryPolicy,
    cache: Mutex<Option<Cached>>,
}

impl HttpDirectory {
    pub fn new(url: impl Into<String>, max_age: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DIRECTORY_FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("directory http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
            max_age,
            retry: RetryPolicy::new(Duration::from_millis(500), DIRECTORY_FETCH_TIMEOUT).with_max_attempts(2),
            cache: Mutex::new(None),
        })
    }

    fn cached(&self, data_market: &str, fresh_only: bool) -> Option<SequencerTarget> {
        let cache = self.cache.lock();
        cache.as_ref().and_then(|c| {
            let usable = c.data_market.eq_ignore_ascii_case(data_market)
                && (!fresh_only || (!c.invalidated && c.fetched_at.elapsed() < self.max_age));
            usable.then(|| c.target.clone())
        })
    }

    async fn fetch(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Directory(format!("{}: {e}", self.url)))?;
        if !response.status().is_success() {
            return Err(Error::Directory(format!("{}: HTTP {}", self.url, response.status())));
        }
        response
            .text()
            .await
            .map_err(|e| Error::Directory(format!("{}: {e}", self.url)))
    }
}

#[async_trait]
impl SequencerDirectory for HttpDirectory {
    async fn resolve(&self, data_market: &str) -> Result<SequencerTarget> {
        if let Some(target) = self.cached(data_market, true) {
            return Ok(target);
        }

        let fetched = retry(&self.retry, "sequencer directory fetch", || self.fetch())
            .await
            .and_then(|doc| parse_directory(&doc, data_market));

        match fetched {
            Ok(target) => {
                debug!(sequencer = %target.peer_id, addr = %target.addr, "resolved sequencer");
                *self.cache.lock() = Some(Cached {
                    data_market: data_market.to_string(),
                    target: target.clone(),
                    fetched_at: Instant::now(),
                    invalidated: false,
                });
                Ok(target)
            }
            Err(e) => match self.cached(data_market, false) {
                Some(stale) => {
                    warn!(error = %e, "sequencer directory refresh failed, using cached address");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    fn invalidate(&self) {
        if let Some(cached) = self.cache.lock().as_mut() {
            cached.invalidated = true;
        }
    }
}
