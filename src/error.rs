//! # Error Taxonomy
//!
//! Every library operation returns [`Result<T>`](Result) with the crate-wide [`Error`].
//! Variants map onto the recovery policy applied by callers:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | `Config` | Fatal at startup |
//! | `HostCreationFailed` | Fatal to the establish/reset that requested it |
//! | `ConnectTimeout`, `ConnectFailed` | Retried by outer loops, then surfaced |
//! | `NotConnected` | Triggers a connection reset |
//! | `ResourceExhausted` | Escalates to one full reset before retrying |
//! | `StreamCreateFailed` | Surfaced after the creation budget is spent |
//! | `StreamDead` | Stream is discarded, never pooled again |
//! | `SubmissionDeliveryFailed` | Reported externally, answered as a failure |
//! | `Rpc` | The submission server itself stopped; fatal to the process |

use std::io;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("overlay host creation failed: {0}")]
    HostCreationFailed(String),

    #[error("overlay host is closed")]
    HostClosed,

    #[error("timed out connecting to sequencer after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("failed to connect to sequencer: {0}")]
    ConnectFailed(String),

    #[error("sequencer is not connected")]
    NotConnected,

    #[error("resource limit exceeded: {0}")]
    ResourceExhausted(String),

    #[error("failed to create stream: {0}")]
    StreamCreateFailed(String),

    #[error("stream is dead: {0}")]
    StreamDead(String),

    #[error("submission {id} could not be delivered: {reason}")]
    SubmissionDeliveryFailed { id: Uuid, reason: String },

    #[error("trusted relayer list has not been loaded")]
    TrustStoreNotLoaded,

    #[error("trusted relayer list not found: {0}")]
    RelayerListNotFound(String),

    #[error("trusted relayer list is malformed: {0}")]
    RelayerListParse(String),

    #[error("sequencer directory error: {0}")]
    Directory(String),

    #[error("stream pool is stopped")]
    PoolStopped,

    #[error("submission server failed: {0}")]
    Rpc(String),
}

impl Error {
    /// True for the signal that escalates to a full connection reset.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }

    pub(crate) fn stream_dead(err: io::Error) -> Self {
        Error::StreamDead(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhaustion_is_classified() {
        assert!(Error::ResourceExhausted("streams".into()).is_resource_exhausted());
        assert!(!Error::NotConnected.is_resource_exhausted());
        assert!(!Error::StreamCreateFailed("x".into()).is_resource_exhausted());
    }

    #[test]
    fn delivery_failure_names_submission() {
        let id = Uuid::nil();
        let err = Error::SubmissionDeliveryFailed { id, reason: "write timed out".into() };
        let text = err.to_string();
        assert!(text.contains("00000000-0000-0000-0000-000000000000"));
        assert!(text.contains("write timed out"));
    }
}
