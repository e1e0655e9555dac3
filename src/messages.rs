//! # RPC Wire Messages
//!
//! Protobuf messages of the `submission.Submission` gRPC service, plus the generated
//! client and server for it. The schema is in `proto/submission.proto`; the message types
//! are declared here with `prost` derives and the service code is generated by `build.rs`.
//!
//! ## Methods
//!
//! | Method | Shape | Responses |
//! |--------|-------|-----------|
//! | `SubmitSnapshot` | unary | one for the single submission |
//! | `SubmitSnapshotSimulation` | client streaming | one when the client finishes sending |
//! | `StreamSnapshots` | bidirectional streaming | one per submission |
//!
//! ## Payload
//!
//! What travels to the sequencer is the submission rendered as JSON with lowerCamel field
//! names, zero-valued fields omitted. The relay never interprets it beyond that.
//!
//! ## Security Limits
//!
//! - `MAX_SUBMISSION_SIZE`: largest decoded request message. Larger messages are rejected
//!   by the codec before they reach a handler.

use serde::Serialize;

/// SECURITY: Largest accepted submission message (1 MiB). Submissions are small documents.
pub const MAX_SUBMISSION_SIZE: usize = 1024 * 1024;

mod generated {
    include!(concat!(env!("OUT_DIR"), "/submission.Submission.rs"));
}

pub use generated::submission_client::SubmissionClient;
pub use generated::submission_server::{Submission, SubmissionServer};

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// The snapshot a submission is about.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[prost(uint64, tag = "1")]
    #[serde(skip_serializing_if = "is_zero")]
    pub slot_id: u64,
    #[prost(uint64, tag = "2")]
    #[serde(skip_serializing_if = "is_zero")]
    pub deadline: u64,
    #[prost(string, tag = "3")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub snapshot_cid: String,
    #[prost(uint64, tag = "4")]
    #[serde(skip_serializing_if = "is_zero")]
    pub epoch_id: u64,
    #[prost(string, tag = "5")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub project_id: String,
}

#[derive(Clone, PartialEq, Eq, prost::Message, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSubmission {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
    #[prost(string, tag = "2")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[prost(string, tag = "3")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header: String,
    #[prost(string, tag = "4")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data_market: String,
}

impl SnapshotSubmission {
    /// Bytes forwarded to the sequencer after the submission id.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubmissionResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl SubmissionResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn submission() -> SnapshotSubmission {
        SnapshotSubmission {
            request: Some(Request {
                slot_id: 7,
                deadline: 0,
                snapshot_cid: "bafy-snapshot".into(),
                epoch_id: 42,
                project_id: "pairContract_trade_volume:0xabc".into(),
            }),
            signature: "0xsig".into(),
            header: String::new(),
            data_market: "0xmarket".into(),
        }
    }

    #[test]
    fn payload_is_camel_case_json_without_zero_fields() {
        let payload = submission().to_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["request"]["slotId"], 7);
        assert_eq!(json["request"]["snapshotCid"], "bafy-snapshot");
        assert_eq!(json["request"]["epochId"], 42);
        assert_eq!(json["dataMarket"], "0xmarket");
        assert!(json["request"].get("deadline").is_none());
        assert!(json.get("header").is_none());
    }

    #[test]
    fn protobuf_field_numbers_are_stable() {
        let response = SubmissionResponse::new("Success");
        // field 1, wire type 2 (length-delimited), length 7
        assert_eq!(response.encode_to_vec(), b"\x0a\x07Success".to_vec());

        let decoded = SnapshotSubmission::decode(submission().encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, submission());
    }

    #[test]
    fn empty_submission_is_empty_json_object() {
        assert_eq!(SnapshotSubmission::default().to_payload().unwrap(), b"{}".to_vec());
    }
}
