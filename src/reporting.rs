//! Failure reporting sinks.
//!
//! Reports are fire-and-forget: [`HttpReporter`] hands each POST to a spawned task and never
//! lets a slow or broken reporting endpoint hold up the submission path.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::protocols::FailureReporter;

/// Timeout for one report POST.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a failure report.
#[derive(Debug, Serialize)]
pub struct FailureReport {
    /// Original request payload, lossily decoded as UTF-8.
    pub payload: String,
    pub message: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl FailureReport {
    pub fn new(payload: &[u8], message: &str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            payload: String::from_utf8_lossy(payload).into_owned(),
            message: message.to_string(),
            timestamp,
        }
    }
}

pub struct HttpReporter {
    url: String,
    client: reqwest::Client,
}

impl HttpReporter {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("reporting http client: {e}")))?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl FailureReporter for HttpReporter {
    async fn report(&self, payload: &[u8], message: &str) {
        let body = FailureReport::new(payload, message);
        let request = self.client.post(&self.url).json(&body);
        let url = self.url.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => debug!(%url, "failure reported"),
                Ok(response) => warn!(%url, status = %response.status(), "reporting endpoint rejected report"),
                Err(e) => warn!(%url, error = %e, "failure report not sent"),
            }
        });
    }
}

/// Logs reports when no reporting endpoint is configured.
#[derive(Default)]
pub struct LogReporter;

#[async_trait]
impl FailureReporter for LogReporter {
    async fn report(&self, payload: &[u8], message: &str) {
        error!(payload_len = payload.len(), message, "submission failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_body_carries_payload_and_message() {
        let report = FailureReport::new(b"{\"cid\":\"bafy\"}", "Failure: x");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["payload"], "{\"cid\":\"bafy\"}");
        assert_eq!(json["message"], "Failure: x");
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn non_utf8_payload_is_lossy() {
        let report = FailureReport::new(&[0xff, b'a'], "m");
        assert!(report.payload.ends_with('a'));
    }

    #[tokio::test]
    async fn unreachable_endpoint_does_not_block() {
        let reporter = HttpReporter::new("http://127.0.0.1:9/report").unwrap();
        tokio::time::timeout(Duration::from_millis(100), reporter.report(b"p", "m"))
            .await
            .expect("report returns immediately");
    }
}
