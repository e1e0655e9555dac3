//! # Trusted Relayers
//!
//! The trust store indexes the externally published list of relayers that are authorized
//! to carry circuits for a rendezvous point. A relayer is trusted for point `P` iff a record
//! with its id and `rendezvousPoint == P` exists in the most recently loaded list.
//!
//! ## List Format
//!
//! ```json
//! [{"id": "12D3KooW...", "name": "relayer-1",
//!   "address": "/ip4/1.2.3.4/tcp/9100", "rendezvousPoint": "snapshot-relayers"}]
//! ```
//!
//! ## Load Semantics
//!
//! - A load either replaces the whole list or changes nothing. Empty lists, missing fields,
//!   bad peer ids and bad multiaddrs all fail the load and keep the previous list.
//! - Queries before the first successful load fail with [`Error::TrustStoreNotLoaded`];
//!   an unloaded store never answers "not trusted" as if it were empty.
//! - Records keep source order and duplicates are not collapsed.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_RELAYER_LIST_URL;
use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};

/// HTTP fetch timeout for a remote relayer list.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Retries of a failed remote fetch before the load fails.
pub const FETCH_RETRIES: u32 = 2;

/// SECURITY: upper bound on the fetched list body.
pub const MAX_LIST_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayerRecord {
    pub id: PeerId,
    pub name: String,
    pub address: Multiaddr,
    pub rendezvous_point: String,
}

/// Raw entry as published. Every field is required.
#[derive(Deserialize)]
struct RawRelayer {
    id: String,
    name: String,
    address: String,
    #[serde(rename = "rendezvousPoint")]
    rendezvous_point: String,
}

#[derive(Clone, Debug)]
pub enum RelayerSource {
    File(PathBuf),
    Url(String),
    Inline(String),
}

impl std::fmt::Display for RelayerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayerSource::File(p) => write!(f, "file {}", p.display()),
            RelayerSource::Url(u) => write!(f, "url {u}"),
            RelayerSource::Inline(_) => write!(f, "inline list"),
        }
    }
}

/// Parse a relayer list. Any malformed entry rejects the whole list.
pub fn parse_relayer_list(text: &str) -> Result<Vec<RelayerRecord>> {
    let raw: Vec<RawRelayer> =
        serde_json::from_str(text).map_err(|e| Error::RelayerListParse(e.to_string()))?;
    if raw.is_empty() {
        return Err(Error::RelayerListParse("list is empty".into()));
    }

    raw.into_iter()
        .enumerate()
        .map(|(i, r)| {
            let id = PeerId::from_str(&r.id)
                .map_err(|e| Error::RelayerListParse(format!("entry {i}: bad id {:?}: {e}", r.id)))?;
            let address = Multiaddr::from_str(&r.address).map_err(|e| {
                Error::RelayerListParse(format!("entry {i}: bad address {:?}: {e}", r.address))
            })?;
            if r.rendezvous_point.is_empty() {
                return Err(Error::RelayerListParse(format!("entry {i}: empty rendezvousPoint")));
            }
            Ok(RelayerRecord {
                id,
                name: r.name,
                address,
                rendezvous_point: r.rendezvous_point,
            })
        })
        .collect()
}

/// Shared, reloadable index of trusted relayers.
#[derive(Default)]
pub struct TrustStore {
    records: RwLock<Option<Arc<Vec<RelayerRecord>>>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `records`. Used by tests and static setups.
    pub fn with_records(records: Vec<RelayerRecord>) -> Self {
        Self {
            records: RwLock::new(Some(Arc::new(records))),
        }
    }

    /// Fetch and install a list. Returns the number of records on success.
    pub async fn load(&self, source: &RelayerSource) -> Result<usize> {
        let text = fetch_source(source).await?;
        let records = parse_relayer_list(&text)?;
        let count = records.len();
        *self.records.write() = Some(Arc::new(records));
        info!(%source, relayers = count, "loaded trusted relayer list");
        Ok(count)
    }

    /// Load `primary` if given, falling back to the built-in list URL on any failure.
    pub async fn load_with_fallback(&self, primary: Option<&RelayerSource>) -> Result<usize> {
        if let Some(source) = primary {
            match self.load(source).await {
                Ok(n) => return Ok(n),
                Err(e) => warn!(%source, error = %e, "relayer list load failed, using fallback"),
            }
        }
        self.load(&RelayerSource::Url(DEFAULT_RELAYER_LIST_URL.to_string())).await
    }

    pub fn is_loaded(&self) -> bool {
        self.records.read().is_some()
    }

    fn snapshot(&self) -> Result<Arc<Vec<RelayerRecord>>> {
        self.records.read().clone().ok_or(Error::TrustStoreNotLoaded)
    }

    pub fn is_trusted(&self, id: &PeerId, rendezvous_point: &str) -> Result<bool> {
        let records = self.snapshot()?;
        Ok(records
            .iter()
            .any(|r| r.id == *id && r.rendezvous_point == rendezvous_point))
    }

    /// Relayers for `rendezvous_point` in source order, duplicates included.
    pub fn trusted_relayers(&self, rendezvous_point: &str) -> Result<Vec<RelayerRecord>> {
        let records = self.snapshot()?;
        Ok(records
            .iter()
            .filter(|r| r.rendezvous_point == rendezvous_point)
            .cloned()
            .collect())
    }
}

async fn fetch_source(source: &RelayerSource) -> Result<String> {
    match source {
        RelayerSource::Inline(text) => Ok(text.clone()),
        RelayerSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::RelayerListNotFound(path.display().to_string())
            } else {
                Error::RelayerListParse(format!("{}: {e}", path.display()))
            }
        }),
        RelayerSource::Url(url) => {
            let client = reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .map_err(|e| Error::RelayerListNotFound(e.to_string()))?;
            let policy = RetryPolicy::new(Duration::from_millis(500), FETCH_TIMEOUT).with_max_attempts(FETCH_RETRIES);
            retry(&policy, "relayer list fetch", || fetch_url(&client, url)).await
        }
    }
}

async fn fetch_url(client: &reqwest::Client, url: &str) -> Result<String> {
    debug!(url = %url, "fetching relayer list");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::RelayerListNotFound(format!("{url}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::RelayerListNotFound(format!(
            "{url}: HTTP {}",
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::RelayerListNotFound(format!("{url}: {e}")))?;
    if body.len() > MAX_LIST_SIZE {
        return Err(Error::RelayerListParse(format!(
            "list is {} bytes, limit is {MAX_LIST_SIZE}",
            body.len()
        )));
    }
    String::from_utf8(body.to_vec()).map_err(|e| Error::RelayerListParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    fn entry(id: &PeerId, name: &str, point: &str) -> String {
        format!(
            r#"{{"id":"{id}","name":"{name}","address":"/ip4/10.0.0.1/tcp/9100","rendezvousPoint":"{point}"}}"#
        )
    }

    fn list(entries: &[String]) -> String {
        format!("[{}]", entries.join(","))
    }

    #[tokio::test]
    async fn queries_fail_before_load() {
        let store = TrustStore::new();
        assert!(!store.is_loaded());
        assert!(matches!(store.is_trusted(&peer(), "p"), Err(Error::TrustStoreNotLoaded)));
        assert!(matches!(store.trusted_relayers("p"), Err(Error::TrustStoreNotLoaded)));
    }

    #[tokio::test]
    async fn membership_is_per_rendezvous_point() {
        let (a, b) = (peer(), peer());
        let store = TrustStore::new();
        let text = list(&[entry(&a, "a", "relayers"), entry(&b, "b", "other")]);
        assert_eq!(store.load(&RelayerSource::Inline(text)).await.unwrap(), 2);

        assert!(store.is_trusted(&a, "relayers").unwrap());
        assert!(!store.is_trusted(&a, "other").unwrap());
        assert!(store.is_trusted(&b, "other").unwrap());
        assert!(!store.is_trusted(&peer(), "relayers").unwrap());
    }

    #[tokio::test]
    async fn order_and_duplicates_preserved() {
        let (a, b) = (peer(), peer());
        let store = TrustStore::new();
        let text = list(&[
            entry(&b, "b", "r"),
            entry(&a, "a", "r"),
            entry(&b, "b-again", "r"),
            entry(&a, "elsewhere", "x"),
        ]);
        store.load(&RelayerSource::Inline(text)).await.unwrap();

        let names: Vec<_> = store
            .trusted_relayers("r")
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "b-again"]);
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_list() {
        let a = peer();
        let store = TrustStore::new();
        store
            .load(&RelayerSource::Inline(list(&[entry(&a, "a", "r")])))
            .await
            .unwrap();

        let empty = store.load(&RelayerSource::Inline("[]".into())).await;
        assert!(matches!(empty, Err(Error::RelayerListParse(_))));

        let bad_id = r#"[{"id":"nope","name":"x","address":"/ip4/1.1.1.1/tcp/1","rendezvousPoint":"r"}]"#;
        assert!(store.load(&RelayerSource::Inline(bad_id.into())).await.is_err());

        let missing_field = r#"[{"id":"x","name":"x","rendezvousPoint":"r"}]"#;
        assert!(store.load(&RelayerSource::Inline(missing_field.into())).await.is_err());

        assert!(store.is_trusted(&a, "r").unwrap());
    }

    #[tokio::test]
    async fn failed_first_load_stays_unloaded() {
        let store = TrustStore::new();
        assert!(store.load(&RelayerSource::Inline("not json".into())).await.is_err());
        assert!(matches!(store.is_trusted(&peer(), "r"), Err(Error::TrustStoreNotLoaded)));
    }

    #[tokio::test]
    async fn one_bad_address_rejects_whole_list() {
        let (a, b) = (peer(), peer());
        let bad = format!(
            r#"{{"id":"{b}","name":"b","address":"not-a-multiaddr","rendezvousPoint":"r"}}"#
        );
        let store = TrustStore::new();
        let result = store
            .load(&RelayerSource::Inline(list(&[entry(&a, "a", "r"), bad])))
            .await;
        assert!(matches!(result, Err(Error::RelayerListParse(_))));
        assert!(!store.is_loaded());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let a = peer();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayers.json");
        std::fs::write(&path, list(&[entry(&a, "a", "r")])).unwrap();

        let store = TrustStore::new();
        store.load(&RelayerSource::File(path)).await.unwrap();
        assert_eq!(store.trusted_relayers("r").unwrap()[0].id, a);

        let missing = store
            .load(&RelayerSource::File(dir.path().join("absent.json")))
            .await;
        assert!(matches!(missing, Err(Error::RelayerListNotFound(_))));
    }
}
