//! Protocol trait definitions for the delivery path.
//!
//! The pool and bridge are written against these traits rather than the concrete
//! libp2p-backed types, so the retry and reset logic can be driven by scripted
//! implementations in tests.
//!
//! ## Traits
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`SequencerLink`] | `connection::ConnectionManager` | Open streams, observe and bump the generation |
//! | [`SubmissionStream`] | `host::HostStream` | Write bytes, probe liveness, close |
//! | [`FailureReporter`] | `reporting::HttpReporter`, `reporting::LogReporter` | Terminal failure sink |

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Bytes written by a liveness probe.
pub const PROBE_FRAME: &[u8] = b"ping";

/// One bidirectional stream to the sequencer.
#[async_trait]
pub trait SubmissionStream: Send + 'static {
    /// Write and flush `bytes`.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Graceful close.
    async fn close(&mut self);

    /// True if a probe write completes within `deadline`.
    async fn probe(&mut self, deadline: Duration) -> bool {
        matches!(
            tokio::time::timeout(deadline, self.write_bytes(PROBE_FRAME)).await,
            Ok(Ok(()))
        )
    }

    /// Abort without a graceful close.
    fn reset(self)
    where
        Self: Sized,
    {
        drop(self)
    }
}

/// Access to the current sequencer connection.
#[async_trait]
pub trait SequencerLink: Send + Sync + 'static {
    type Stream: SubmissionStream;

    /// Generation of the installed connection. Never decreases.
    fn generation(&self) -> u64;

    /// Open a stream on the current connection, returning it with the generation it belongs to.
    async fn open_stream(&self) -> Result<(Self::Stream, u64)>;

    /// Tear down and rebuild the connection unless it already moved past `observed`.
    /// Returns the generation in effect afterwards.
    async fn reset(&self, observed: u64) -> Result<u64>;

    /// Repair path: reset only if the sequencer is not connected.
    async fn ensure_connected(&self) -> Result<u64>;
}

/// One-way sink for submissions that could not be delivered.
#[async_trait]
pub trait FailureReporter: Send + Sync + 'static {
    async fn report(&self, payload: &[u8], message: &str);
}
