//! HTTP health probe against a forwarded service.

use backon::{BackoffBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::VerificationConfig;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub attempts: u32,
    /// Attempt `n` waits `n * backoff` before retrying
    pub backoff: Duration,
    pub timeout: Duration,
    pub healthy_statuses: Vec<u16>,
}

impl HealthCheckConfig {
    pub fn from_verification(config: &VerificationConfig) -> Self {
        Self {
            attempts: config.health_attempts.max(1),
            backoff: config.health_backoff(),
            timeout: config.health_timeout(),
            healthy_statuses: config.healthy_statuses.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unhealthy status {0}")]
    Unhealthy(u16),
}

impl ProbeError {
    fn status(&self) -> Option<u16> {
        match self {
            ProbeError::Unhealthy(code) => Some(*code),
            ProbeError::Request(_) => None,
        }
    }
}

/// Backoff that grows by one unit per attempt
#[derive(Debug, Clone)]
struct LinearBackoff {
    unit: Duration,
    max_times: u32,
}

impl BackoffBuilder for LinearBackoff {
    type Backoff = std::vec::IntoIter<Duration>;

    fn build(self) -> Self::Backoff {
        (1..=self.max_times)
            .map(|n| self.unit * n)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

pub struct HealthChecker {
    client: reqwest::Client,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Probe `url` until it answers with a healthy status or attempts run out
    pub async fn check(&self, url: &str) -> HealthCheckResult {
        let counter = AtomicU32::new(0);
        let started = Instant::now();

        let attempts = &counter;
        let client = &self.client;
        let healthy = &self.config.healthy_statuses;
        let probe = move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| ProbeError::Request(e.to_string()))?;
            let status = response.status().as_u16();
            if healthy.contains(&status) {
                Ok(status)
            } else {
                Err(ProbeError::Unhealthy(status))
            }
        };

        let backoff = LinearBackoff {
            unit: self.config.backoff,
            max_times: self.config.attempts.saturating_sub(1),
        };
        let outcome = probe
            .retry(backoff)
            .notify(|err, dur| {
                warn!(url, "Health probe failed: {}, retrying in {:?}", err, dur);
            })
            .await;

        let mut result = HealthCheckResult {
            response_time_ms: started.elapsed().as_millis() as u64,
            attempts: counter.load(Ordering::SeqCst),
            ..Default::default()
        };
        match outcome {
            Ok(status) => {
                result.success = true;
                result.status_code = Some(status);
            }
            Err(e) => {
                result.status_code = e.status();
                result.error = Some(e.to_string());
            }
        }
        debug!(url, ?result, "Health probe finished");
        result
    }
}
