//! # Bounded Retry
//!
//! One retry utility shared by every layer that retries: stream creation in the pool,
//! writes in the bridge, and the HTTP fetches for the relayer list and sequencer directory.
//! Each layer declares a [`RetryPolicy`] instead of hand-rolling its loop bounds.
//!
//! A policy is bounded twice: by total elapsed time (`max_elapsed`) and optionally by
//! attempt count (`max_attempts`). Whichever runs out first ends the schedule.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// Default first delay between attempts.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Default ceiling for a single delay.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Default total budget for one retried operation.
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(120);

/// Default jitter applied to each delay (fraction of the delay).
pub const DEFAULT_RANDOMIZATION: f64 = 0.5;

/// Exponential backoff parameters for one retried operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time budget; `None` means bounded by attempts only.
    pub max_elapsed: Option<Duration>,
    /// Maximum number of retries after the first attempt; `None` means bounded by time only.
    pub max_attempts: Option<u32>,
    pub randomization: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed: Some(DEFAULT_MAX_ELAPSED),
            max_attempts: None,
            randomization: DEFAULT_RANDOMIZATION,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial_interval,
            max_elapsed: Some(max_elapsed),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Deterministic delays. Used where tests need exact schedules.
    pub fn without_jitter(mut self) -> Self {
        self.randomization = 0.0;
        self
    }

    /// Begin a fresh schedule. The elapsed-time clock starts now.
    pub fn start(&self) -> RetrySchedule {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval.max(self.initial_interval))
            .with_randomization_factor(self.randomization)
            .with_max_elapsed_time(self.max_elapsed)
            .build();
        RetrySchedule {
            inner,
            retries: 0,
            max_attempts: self.max_attempts,
        }
    }
}

/// A running backoff schedule.
pub struct RetrySchedule {
    inner: ExponentialBackoff,
    retries: u32,
    max_attempts: Option<u32>,
}

impl RetrySchedule {
    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.retries >= max {
                return None;
            }
        }
        let delay = self.inner.next_backoff()?;
        self.retries += 1;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Run `op` until it succeeds or the policy is exhausted, returning the last error.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut schedule = policy.start();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match schedule.next_delay() {
                Some(delay) => {
                    debug!(operation = what, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(5)).without_jitter()
    }

    #[test]
    fn attempt_bound_ends_schedule() {
        let mut schedule = fast().with_max_attempts(2).start();
        assert!(schedule.next_delay().is_some());
        assert!(schedule.next_delay().is_some());
        assert!(schedule.next_delay().is_none());
        assert_eq!(schedule.retries(), 2);
    }

    #[test]
    fn delays_grow_without_jitter() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60)).without_jitter();
        let mut schedule = policy.start();
        let first = schedule.next_delay().unwrap();
        let second = schedule.next_delay().unwrap();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(101));
        assert!(second > first);
    }

    #[test]
    fn max_interval_caps_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(60))
            .with_max_interval(Duration::from_millis(15))
            .without_jitter();
        let mut schedule = policy.start();
        for _ in 0..5 {
            assert!(schedule.next_delay().unwrap() <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = retry(&fast().with_max_attempts(5), "test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::NotConnected)
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry(&fast().with_max_attempts(2), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotConnected)
            }
        })
        .await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(10), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
