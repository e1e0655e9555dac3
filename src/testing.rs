//! Scripted stand-ins for the delivery-path traits, shared by the pool, bridge and server tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocols::{FailureReporter, SequencerLink, SubmissionStream, PROBE_FRAME};

/// What the next `open_stream` call does.
#[derive(Clone, Copy, Debug)]
pub enum Open {
    Healthy,
    /// Opens, but every write (and so every probe) fails.
    Dead,
    /// Opens, but writes never complete.
    Hung,
    Exhausted,
    NotConnected,
    Fail,
}

#[derive(Default)]
pub struct Counters {
    pub opens: AtomicU32,
    pub resets: AtomicU32,
    pub probes: AtomicU32,
    pub closes: AtomicU32,
    pub ensures: AtomicU32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    Dead,
    Hung,
}

pub struct MockStream {
    health: Health,
    shared: Arc<Shared>,
}

impl MockStream {
    pub fn kill(&mut self) {
        self.health = Health::Dead;
    }
}

#[async_trait]
impl SubmissionStream for MockStream {
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match self.health {
            Health::Dead => return Err(Error::StreamDead("scripted".into())),
            Health::Hung => std::future::pending::<()>().await,
            Health::Healthy => {}
        }
        if bytes != PROBE_FRAME {
            let fail = self
                .shared
                .write_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(Error::StreamDead("scripted write failure".into()));
            }
            self.shared.writes.lock().push(bytes.to_vec());
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.shared.counters.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn probe(&mut self, deadline: Duration) -> bool {
        self.shared.counters.probes.fetch_add(1, Ordering::SeqCst);
        matches!(
            tokio::time::timeout(deadline, self.write_bytes(PROBE_FRAME)).await,
            Ok(Ok(()))
        )
    }
}

#[derive(Default)]
struct Shared {
    counters: Counters,
    script: Mutex<VecDeque<Open>>,
    write_failures: AtomicU32,
    writes: Mutex<Vec<Vec<u8>>>,
}

/// A link whose stream opens follow a script and default to healthy once it runs out.
#[derive(Default)]
pub struct MockLink {
    shared: Arc<Shared>,
    generation: AtomicU64,
}

impl MockLink {
    pub fn new() -> Self {
        let link = Self::default();
        link.generation.store(1, Ordering::SeqCst);
        link
    }

    pub fn script(&self, opens: impl IntoIterator<Item = Open>) {
        self.shared.script.lock().extend(opens);
    }

    /// Fail the next `n` payload writes across all streams. Probes are unaffected.
    pub fn fail_writes(&self, n: u32) {
        self.shared.write_failures.store(n, Ordering::SeqCst);
    }

    pub fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    pub fn opens(&self) -> u32 {
        self.shared.counters.opens.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.shared.counters.resets.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u32 {
        self.shared.counters.probes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.writes.lock().clone()
    }

    /// A stream outside the pool, for probing directly.
    pub fn stream(&self, open: Open) -> MockStream {
        let health = match open {
            Open::Dead => Health::Dead,
            Open::Hung => Health::Hung,
            _ => Health::Healthy,
        };
        MockStream { health, shared: Arc::clone(&self.shared) }
    }
}

#[async_trait]
impl SequencerLink for MockLink {
    type Stream = MockStream;

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn open_stream(&self) -> Result<(MockStream, u64)> {
        self.shared.counters.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.shared.script.lock().pop_front().unwrap_or(Open::Healthy);
        match next {
            Open::Exhausted => Err(Error::ResourceExhausted("streams".into())),
            Open::NotConnected => Err(Error::NotConnected),
            Open::Fail => Err(Error::StreamCreateFailed("scripted".into())),
            open => Ok((self.stream(open), self.generation())),
        }
    }

    async fn reset(&self, observed: u64) -> Result<u64> {
        let bumped = self
            .generation
            .compare_exchange(observed, observed + 1, Ordering::SeqCst, Ordering::SeqCst);
        if bumped.is_ok() {
            self.shared.counters.resets.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.generation())
    }

    async fn ensure_connected(&self) -> Result<u64> {
        self.shared.counters.ensures.fetch_add(1, Ordering::SeqCst);
        Ok(self.generation())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(Vec<u8>, String)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(Vec<u8>, String)> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl FailureReporter for RecordingReporter {
    async fn report(&self, payload: &[u8], message: &str) {
        self.reports.lock().push((payload.to_vec(), message.to_string()));
    }
}

/// Pool, bridge and dispatcher over `link` with short timeouts and near-instant backoff.
pub fn dispatcher(
    link: Arc<MockLink>,
    reporter: Arc<RecordingReporter>,
) -> Arc<crate::bridge::Dispatcher<MockLink>> {
    use crate::bridge::{Dispatcher, SubmissionBridge};
    use crate::config::{BridgeConfig, PoolConfig};
    use crate::pool::StreamPool;
    use crate::retry::RetryPolicy;

    let quick = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(1)).without_jitter();
    let pool_config = PoolConfig {
        max_size: 4,
        health_check_timeout: Duration::from_millis(50),
        create_retry: quick.clone().with_max_attempts(3),
        ..PoolConfig::default()
    };
    let bridge_config = BridgeConfig {
        write_timeout: Duration::from_millis(200),
        write_retry: quick,
        worker_pool_size: 2,
        ..BridgeConfig::default()
    };
    let pool = Arc::new(StreamPool::new(Arc::clone(&link), pool_config).expect("pool config"));
    let bridge = SubmissionBridge::new(pool, link, reporter, bridge_config).expect("bridge config");
    Arc::new(Dispatcher::spawn(Arc::new(bridge)))
}
