//! # Submission RPC Server
//!
//! Serves the `submission.Submission` gRPC service (see [`crate::messages`]) and hands every
//! submission to the [`Dispatcher`]. tonic runs each call as its own task.
//!
//! A single submission's failure is answered as `Failure: <id>`; it never ends the call,
//! let alone the server. End of input, a client that goes away and server shutdown all end
//! the call quietly.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::bridge::{Dispatcher, SubmissionOutcome};
use crate::error::{Error, Result};
use crate::messages::{
    SnapshotSubmission, Submission, SubmissionResponse, SubmissionServer, MAX_SUBMISSION_SIZE,
};
use crate::protocols::SequencerLink;

/// Responses buffered per streaming call before the handler waits on the client.
const RESPONSE_BUFFER: usize = 64;

/// The gRPC handler. Cheap to clone; every clone feeds the same dispatcher.
pub struct SubmissionService<L: SequencerLink> {
    dispatcher: Arc<Dispatcher<L>>,
}

impl<L: SequencerLink> Clone for SubmissionService<L> {
    fn clone(&self) -> Self {
        Self { dispatcher: Arc::clone(&self.dispatcher) }
    }
}

impl<L: SequencerLink> SubmissionService<L> {
    pub fn new(dispatcher: Arc<Dispatcher<L>>) -> Self {
        Self { dispatcher }
    }

    async fn deliver(&self, submission: SnapshotSubmission) -> std::result::Result<SubmissionOutcome, Status> {
        if let Some(request) = &submission.request {
            debug!(slot = request.slot_id, epoch = request.epoch_id, project = %request.project_id, "received submission");
        }
        let payload = submission
            .to_payload()
            .map_err(|e| Status::invalid_argument(format!("unencodable submission: {e}")))?;
        Ok(self.dispatcher.submit(payload).await)
    }
}

fn answer(outcome: SubmissionOutcome) -> SubmissionResponse {
    SubmissionResponse::new(outcome.message())
}

#[tonic::async_trait]
impl<L: SequencerLink> Submission for SubmissionService<L> {
    async fn submit_snapshot(
        &self,
        request: Request<SnapshotSubmission>,
    ) -> std::result::Result<Response<SubmissionResponse>, Status> {
        let outcome = self.deliver(request.into_inner()).await?;
        Ok(Response::new(answer(outcome)))
    }

    async fn submit_snapshot_simulation(
        &self,
        request: Request<Streaming<SnapshotSubmission>>,
    ) -> std::result::Result<Response<SubmissionResponse>, Status> {
        let mut inbound = request.into_inner();
        let mut first_failure = None;
        loop {
            let submission = match inbound.message().await {
                Ok(Some(submission)) => submission,
                Ok(None) => break,
                Err(status) => {
                    debug!(%status, "call ended by client");
                    break;
                }
            };
            let outcome = self.deliver(submission).await?;
            if !outcome.is_success() && first_failure.is_none() {
                first_failure = Some(outcome);
            }
        }
        Ok(Response::new(answer(first_failure.unwrap_or(SubmissionOutcome::Success))))
    }

    type StreamSnapshotsStream = ReceiverStream<std::result::Result<SubmissionResponse, Status>>;

    async fn stream_snapshots(
        &self,
        request: Request<Streaming<SnapshotSubmission>>,
    ) -> std::result::Result<Response<Self::StreamSnapshotsStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let service = self.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = inbound.message() => next,
                };
                let submission = match next {
                    Ok(Some(submission)) => submission,
                    Ok(None) => break,
                    Err(status) => {
                        debug!(%status, "call ended by client");
                        break;
                    }
                };
                let reply = service.deliver(submission).await.map(answer);
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct RpcServer<L: SequencerLink> {
    listener: TcpListener,
    service: SubmissionService<L>,
}

impl<L: SequencerLink> RpcServer<L> {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher<L>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, service: SubmissionService::new(dispatcher) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve calls until `cancel` fires, then let in-flight calls finish.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "submission server listening");
        }
        let service = SubmissionServer::new(self.service).max_decoding_message_size(MAX_SUBMISSION_SIZE);
        let result = Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), async move {
                cancel.cancelled().await
            })
            .await;
        info!("submission server stopped");
        result.map_err(|e| Error::Rpc(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Request as SnapshotRequest, SubmissionClient};
    use crate::testing::{dispatcher, MockLink, RecordingReporter};
    use tonic::transport::Channel;

    async fn start(link: Arc<MockLink>, reporter: Arc<RecordingReporter>) -> (SubmissionClient<Channel>, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), dispatcher(link, reporter))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        let client = SubmissionClient::connect(format!("http://{addr}")).await.unwrap();
        (client, cancel)
    }

    fn submission(slot_id: u64) -> SnapshotSubmission {
        SnapshotSubmission {
            request: Some(SnapshotRequest {
                slot_id,
                snapshot_cid: format!("bafy-{slot_id}"),
                epoch_id: 1,
                ..Default::default()
            }),
            data_market: "0xmarket".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streaming_call_answers_each_submission() {
        let link = Arc::new(MockLink::new());
        let (mut client, cancel) = start(Arc::clone(&link), Default::default()).await;

        let outbound = tokio_stream::iter(vec![submission(1), submission(2), submission(3)]);
        let mut responses = client.stream_snapshots(outbound).await.unwrap().into_inner();
        let mut messages = Vec::new();
        while let Some(response) = responses.message().await.unwrap() {
            messages.push(response.message);
        }

        assert_eq!(messages, vec!["Success", "Success", "Success"]);
        assert_eq!(link.written().len(), 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn client_stream_answers_once_at_end() {
        let link = Arc::new(MockLink::new());
        let (mut client, cancel) = start(Arc::clone(&link), Default::default()).await;

        let outbound = tokio_stream::iter(vec![submission(1), submission(2)]);
        let response = client.submit_snapshot_simulation(outbound).await.unwrap().into_inner();

        assert_eq!(response.message, "Success");
        assert_eq!(link.written().len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn client_stream_answers_with_first_failure() {
        let link = Arc::new(MockLink::new());
        link.fail_writes(u32::MAX);
        let reporter = Arc::new(RecordingReporter::default());
        let (mut client, cancel) = start(Arc::clone(&link), Arc::clone(&reporter)).await;

        let outbound = tokio_stream::iter(vec![submission(1), submission(2)]);
        let response = client.submit_snapshot_simulation(outbound).await.unwrap().into_inner();

        assert!(response.message.starts_with("Failure: "));
        assert_eq!(reporter.reports().len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unary_failure_is_answered_and_reported() {
        let link = Arc::new(MockLink::new());
        link.fail_writes(u32::MAX);
        let reporter = Arc::new(RecordingReporter::default());
        let (mut client, cancel) = start(Arc::clone(&link), Arc::clone(&reporter)).await;

        let response = client.submit_snapshot(submission(9)).await.unwrap().into_inner();

        assert!(response.message.starts_with("Failure: "));
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, submission(9).to_payload().unwrap());
        cancel.cancel();
    }

    #[tokio::test]
    async fn forwarded_bytes_are_id_then_json_payload() {
        let link = Arc::new(MockLink::new());
        let (mut client, cancel) = start(Arc::clone(&link), Default::default()).await;

        let response = client.submit_snapshot(submission(5)).await.unwrap().into_inner();
        assert_eq!(response.message, "Success");

        let written = link.written();
        assert_eq!(written.len(), 1);
        let (id, payload) = written[0].split_at(36);
        assert!(uuid::Uuid::parse_str(std::str::from_utf8(id).unwrap()).is_ok());
        assert_eq!(payload, submission(5).to_payload().unwrap().as_slice());
        cancel.cancel();
    }

    #[tokio::test]
    async fn oversized_submission_is_rejected() {
        let link = Arc::new(MockLink::new());
        let (mut client, cancel) = start(Arc::clone(&link), Default::default()).await;

        let mut big = submission(1);
        big.signature = "x".repeat(MAX_SUBMISSION_SIZE + 1);
        let status = client.submit_snapshot(big).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::OutOfRange);
        assert!(link.written().is_empty());
        cancel.cancel();
    }
}
