//! # Snapshot Relay
//!
//! A resilient bridge that accepts snapshot submissions over a local RPC endpoint and
//! forwards each one over a libp2p overlay to a single upstream sequencer.
//!
//! - **Overlay**: libp2p host with TCP and QUIC, TLS or Noise, yamux, Kademlia, relay v2,
//!   DCUtR and UPnP
//! - **Reachability**: direct dial first, then trusted relayers, then discovered relayers
//! - **Delivery**: pooled streams, bounded retries, one answer per submission
//! - **Recovery**: generation-tagged atomic reset of the whole host when repair is not enough
//!
//! ## Architecture
//!
//! The overlay host follows the **Actor Pattern**: a cheap-to-clone [`OverlayHost`] handle
//! sends commands to a private task that owns the swarm. The single live connection is owned
//! by the [`ConnectionManager`] behind one read/write lock; every other component reaches the
//! host through it, fresh on each use, and recognises stale streams by generation.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `host` | libp2p swarm actor: dialing, relays, provider records, streams, trimming |
//! | `trust` | Trusted relayer list, loaded from file, URL or inline JSON |
//! | `discovery` | Rendezvous on Kademlia provider records, bootstrap |
//! | `sequencer` | Sequencer address directory (HTTP or static) |
//! | `connection` | Connection state machine, relay fallback, atomic reset |
//! | `pool` | Bounded, health-checked stream pool |
//! | `bridge` | Submission delivery with retries, queue and workers |
//! | `server` | Local gRPC submission endpoint (tonic) |
//! | `messages` | gRPC message types and the generated service |
//! | `protocols` | Traits the pool and bridge are written against |
//! | `retry` | The one bounded backoff utility |
//! | `reporting` | Failure report sinks |
//! | `identity` | ed25519 node key loading |
//! | `config` | Defaults, limits and validated component configs |

mod bridge;
pub mod config;
mod connection;
mod discovery;
mod error;
mod host;
mod identity;
pub mod messages;
mod pool;
mod protocols;
mod reporting;
mod retry;
mod sequencer;
mod server;
mod trust;

#[cfg(test)]
mod testing;

pub use bridge::{Dispatcher, SubmissionBridge, SubmissionEnvelope, SubmissionOutcome};
pub use connection::{ConnectionManager, ConnectionPhase};
pub use discovery::Discovery;
pub use error::{Error, Result};
pub use host::{circuit_addr, split_peer, with_peer, HostStream, OverlayHost, PeerEvent, PeerInfo};
pub use identity::{keypair_from_hex, load_keypair, secret_hex, KeySource};
pub use pool::{PooledStream, StreamPool};
pub use protocols::{FailureReporter, SequencerLink, SubmissionStream, PROBE_FRAME};
pub use reporting::{FailureReport, HttpReporter, LogReporter};
pub use retry::{retry, RetryPolicy};
pub use sequencer::{parse_directory, HttpDirectory, SequencerDirectory, SequencerTarget, StaticDirectory};
pub use server::{RpcServer, SubmissionService};
pub use trust::{parse_relayer_list, RelayerRecord, RelayerSource, TrustStore};
