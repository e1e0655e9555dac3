//! # Submission Bridge
//!
//! Delivers one submission to the sequencer with bounded retries and answers the RPC caller
//! exactly once.
//!
//! ```text
//! envelope -> get_stream -> write (write_timeout) -> return_stream      => "Success"
//!                              | failure
//!                              v
//!                 remove_stream -> ensure_connected -> backoff -> retry
//!                              | budget spent
//!                              v
//!                 report(payload, reason) once                      => "Failure: <id>"
//! ```
//!
//! The [`Dispatcher`] sits in front of the bridge: a bounded queue drained by a fixed set of
//! workers. A queue that stays full for `write_timeout` answers with a failure instead of
//! blocking the caller.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::pool::StreamPool;
use crate::protocols::{FailureReporter, SequencerLink};

/// One submission as written to the sequencer: the hyphenated id text, then the payload.
#[derive(Clone, Debug)]
pub struct SubmissionEnvelope {
    id: Uuid,
    payload: Vec<u8>,
}

impl SubmissionEnvelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { id: Uuid::new_v4(), payload }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.id.hyphenated().to_string();
        let mut bytes = Vec::with_capacity(id.len() + self.payload.len());
        bytes.extend_from_slice(id.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Success,
    Failure(Uuid),
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmissionOutcome::Success)
    }

    /// Status string sent back to the RPC caller.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionOutcome::Success => f.write_str("Success"),
            SubmissionOutcome::Failure(id) => write!(f, "Failure: {id}"),
        }
    }
}

pub struct SubmissionBridge<L: SequencerLink> {
    pool: Arc<StreamPool<L>>,
    link: Arc<L>,
    reporter: Arc<dyn FailureReporter>,
    config: BridgeConfig,
    writes: Semaphore,
}

impl<L: SequencerLink> SubmissionBridge<L> {
    pub fn new(
        pool: Arc<StreamPool<L>>,
        link: Arc<L>,
        reporter: Arc<dyn FailureReporter>,
        config: BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            link,
            reporter,
            writes: Semaphore::new(config.max_concurrent_writes),
            config,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub async fn submit(&self, envelope: SubmissionEnvelope) -> SubmissionOutcome {
        match self.deliver(&envelope).await {
            Ok(attempts) => {
                debug!(id = %envelope.id, attempts, "submission delivered");
                SubmissionOutcome::Success
            }
            Err(e) => self.fail(&envelope, &e).await,
        }
    }

    /// Terminal failure: report once and build the caller's answer.
    pub async fn fail(&self, envelope: &SubmissionEnvelope, err: &Error) -> SubmissionOutcome {
        error!(id = %envelope.id, error = %err, "submission not delivered");
        self.reporter.report(&envelope.payload, &err.to_string()).await;
        SubmissionOutcome::Failure(envelope.id)
    }

    async fn deliver(&self, envelope: &SubmissionEnvelope) -> Result<u32> {
        let bytes = envelope.to_bytes();
        let mut schedule = self
            .config
            .write_retry
            .clone()
            .with_max_attempts(self.config.max_write_retries)
            .start();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.write_once(&bytes).await {
                Ok(()) => return Ok(attempt),
                Err(e) => e,
            };
            warn!(id = %envelope.id, attempt, error = %err, "submission write failed");

            if matches!(err, Error::PoolStopped) {
                return Err(Error::SubmissionDeliveryFailed { id: envelope.id, reason: err.to_string() });
            }
            if let Err(e) = self.link.ensure_connected().await {
                warn!(error = %e, "connection repair failed");
            }
            let Some(delay) = schedule.next_delay() else {
                return Err(Error::SubmissionDeliveryFailed {
                    id: envelope.id,
                    reason: format!("{err} (after {attempt} attempts)"),
                });
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn write_once(&self, bytes: &[u8]) -> Result<()> {
        let _permit = self.writes.acquire().await.map_err(|_| Error::PoolStopped)?;
        let mut stream = self.pool.get_stream().await?;
        match tokio::time::timeout(self.config.write_timeout, stream.write(bytes)).await {
            Ok(Ok(())) => {
                self.pool.return_stream(stream).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.pool.remove_stream(stream).await;
                Err(e)
            }
            Err(_) => {
                self.pool.remove_stream(stream).await;
                Err(Error::StreamDead(format!("write timed out after {:?}", self.config.write_timeout)))
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Job {
    envelope: SubmissionEnvelope,
    reply: oneshot::Sender<SubmissionOutcome>,
}

/// Bounded queue plus worker tasks in front of a [`SubmissionBridge`].
pub struct Dispatcher<L: SequencerLink> {
    bridge: Arc<SubmissionBridge<L>>,
    queue: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl<L: SequencerLink> Dispatcher<L> {
    pub fn spawn(bridge: Arc<SubmissionBridge<L>>) -> Self {
        let (mut dispatcher, rx) = Self::unstarted(bridge);
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..dispatcher.bridge.config.worker_pool_size {
            let bridge = Arc::clone(&dispatcher.bridge);
            let rx = Arc::clone(&rx);
            dispatcher.workers.push(tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    let outcome = bridge.submit(job.envelope).await;
                    // The caller may have gone away; the submission was still handled.
                    let _ = job.reply.send(outcome);
                }
                debug!(worker, "submission worker stopped");
            }));
        }
        dispatcher
    }

    fn unstarted(bridge: Arc<SubmissionBridge<L>>) -> (Self, mpsc::Receiver<Job>) {
        let (queue, rx) = mpsc::channel(bridge.config.max_queue_size);
        (Self { bridge, queue, workers: Vec::new() }, rx)
    }

    /// Queue one payload and wait for its outcome.
    pub async fn submit(&self, payload: Vec<u8>) -> SubmissionOutcome {
        let envelope = SubmissionEnvelope::new(payload);
        let id = envelope.id;
        let (reply, outcome) = oneshot::channel();
        let timeout = self.bridge.config.write_timeout;

        match self.queue.send_timeout(Job { envelope, reply }, timeout).await {
            Ok(()) => outcome.await.unwrap_or(SubmissionOutcome::Failure(id)),
            Err(e) => {
                let job = match e {
                    mpsc::error::SendTimeoutError::Timeout(job) => job,
                    mpsc::error::SendTimeoutError::Closed(job) => job,
                };
                let err = Error::SubmissionDeliveryFailed {
                    id,
                    reason: format!("submission queue full for {timeout:?}"),
                };
                self.bridge.fail(&job.envelope, &err).await
            }
        }
    }

    /// Close the queue and wait for queued submissions to drain.
    pub async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
