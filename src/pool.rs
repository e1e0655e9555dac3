//! # Stream Pool
//!
//! Bounded set of reusable streams to the sequencer.
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | [`StreamPool::get_stream`] | Reuse the most recently returned idle stream if it probes alive, else create |
//! | [`StreamPool::return_stream`] | Probe; keep if alive and room remains, else close |
//! | [`StreamPool::remove_stream`] | Close unconditionally |
//! | [`StreamPool::stop`] | Reset every idle stream; later gets fail with `PoolStopped` |
//!
//! ## Capacity
//!
//! Every [`PooledStream`] holds a permit from one slot semaphore of `max_size` permits,
//! whether it sits idle or is checked out. Dropping or closing a stream releases its slot, so
//! `idle + checked_out <= max_size` holds structurally. The idle list lock is held only to
//! push or pop; probes and stream creation run outside it, and concurrent callers may create
//! streams in parallel.
//!
//! ## Creation
//!
//! Stream creation retries under the configured backoff. `NotConnected` asks the link for a
//! reset before the next attempt. Consecutive `ResourceExhausted` failures are counted
//! instead (any other outcome clears the count): once the count reaches the threshold,
//! exactly one reset runs and exactly one more attempt is made on the new generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::protocols::{SequencerLink, SubmissionStream};
use crate::retry::sleep_or_cancel;

/// A stream owned either by the pool or by exactly one caller.
pub struct PooledStream<S> {
    id: u64,
    generation: u64,
    stream: S,
    _slot: OwnedSemaphorePermit,
}

impl<S: SubmissionStream> PooledStream<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Generation of the connection the stream was opened on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_bytes(bytes).await
    }

    #[cfg(test)]
    pub(crate) fn inner_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    async fn close(mut self) {
        self.stream.close().await;
    }

    fn reset(self) {
        self.stream.reset();
    }
}

pub struct StreamPool<L: SequencerLink> {
    link: Arc<L>,
    config: PoolConfig,
    idle: Mutex<Vec<PooledStream<L::Stream>>>,
    slots: Arc<Semaphore>,
    returned: Notify,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl<L: SequencerLink> StreamPool<L> {
    pub fn new(link: Arc<L>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            link,
            slots: Arc::new(Semaphore::new(config.max_size)),
            config,
            idle: Mutex::new(Vec::new()),
            returned: Notify::new(),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Slots in use that are not idle: streams held by callers or being created.
    pub fn checked_out_count(&self) -> usize {
        let idle = self.idle.lock().len();
        self.config
            .max_size
            .saturating_sub(self.slots.available_permits())
            .saturating_sub(idle)
    }

    pub async fn get_stream(&self) -> Result<PooledStream<L::Stream>> {
        let slot = loop {
            if self.cancel.is_cancelled() {
                return Err(Error::PoolStopped);
            }
            if let Some(stream) = self.take_healthy_idle().await {
                return Ok(stream);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::PoolStopped),
                // A stream came back while every slot was taken; go reuse it.
                _ = self.returned.notified() => continue,
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    break permit.map_err(|_| Error::PoolStopped)?;
                }
            }
        };
        self.create(slot).await
    }

    pub async fn return_stream(&self, mut stream: PooledStream<L::Stream>) {
        if self.cancel.is_cancelled() {
            stream.reset();
            return;
        }
        if stream.generation != self.link.generation() {
            debug!(stream = stream.id, generation = stream.generation, "closing stale stream on return");
            stream.close().await;
            return;
        }
        if !stream.stream.probe(self.config.health_check_timeout).await {
            debug!(stream = stream.id, "returned stream is dead");
            stream.close().await;
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() < self.config.max_size {
                idle.push(stream);
                None
            } else {
                Some(stream)
            }
        };
        match overflow {
            Some(stream) => stream.close().await,
            None => self.returned.notify_one(),
        }
    }

    /// Discard a stream after a failed write. A checked-out stream is never in the idle
    /// list, so closing it is all that is left to do.
    pub async fn remove_stream(&self, stream: PooledStream<L::Stream>) {
        debug!(stream = stream.id, "removing stream");
        stream.close().await;
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.slots.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        let count = drained.len();
        for stream in drained {
            stream.reset();
        }
        info!(reset = count, "stream pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn take_healthy_idle(&self) -> Option<PooledStream<L::Stream>> {
        loop {
            let mut stream = self.idle.lock().pop()?;
            if stream.generation != self.link.generation() {
                debug!(stream = stream.id, generation = stream.generation, "discarding stale idle stream");
                stream.reset();
                continue;
            }
            if stream.stream.probe(self.config.health_check_timeout).await {
                return Some(stream);
            }
            debug!(stream = stream.id, "idle stream failed probe");
            stream.close().await;
        }
    }

    async fn create(&self, slot: OwnedSemaphorePermit) -> Result<PooledStream<L::Stream>> {
        let mut schedule = self.config.create_retry.start();
        let mut exhausted = 0u32;

        loop {
            let observed = self.link.generation();
            let err = match self.link.open_stream().await {
                Ok((stream, generation)) => return Ok(self.wrap(stream, generation, slot)),
                Err(e) => e,
            };

            match &err {
                Error::ResourceExhausted(_) => {
                    exhausted += 1;
                    warn!(attempt = exhausted, error = %err, "stream creation hit resource limit");
                    if exhausted >= self.config.resource_exhaustion_threshold {
                        return self.reset_and_open(observed, slot).await;
                    }
                }
                Error::NotConnected => {
                    warn!("sequencer not connected, resetting before next attempt");
                    if let Err(e) = self.link.reset(observed).await {
                        warn!(error = %e, "reset failed");
                    }
                }
                _ => debug!(error = %err, "stream creation failed"),
            }
            if !err.is_resource_exhausted() {
                exhausted = 0;
            }

            let Some(delay) = schedule.next_delay() else {
                return Err(Error::StreamCreateFailed(format!(
                    "gave up after {} retries: {err}",
                    schedule.retries()
                )));
            };
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Err(Error::PoolStopped);
            }
        }
    }

    async fn reset_and_open(&self, observed: u64, slot: OwnedSemaphorePermit) -> Result<PooledStream<L::Stream>> {
        warn!(generation = observed, "resource exhaustion persists, resetting connection");
        let generation = self
            .link
            .reset(observed)
            .await
            .map_err(|e| Error::StreamCreateFailed(format!("reset after resource exhaustion failed: {e}")))?;
        match self.link.open_stream().await {
            Ok((stream, generation)) => Ok(self.wrap(stream, generation, slot)),
            Err(e) => Err(Error::StreamCreateFailed(format!(
                "creation still failing on generation {generation}: {e}"
            ))),
        }
    }

    fn wrap(&self, stream: L::Stream, generation: u64, slot: OwnedSemaphorePermit) -> PooledStream<L::Stream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(stream = id, generation, "created stream");
        PooledStream { id, generation, stream, _slot: slot }
    }
}
