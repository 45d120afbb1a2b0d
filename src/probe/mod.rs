//! Health probe client
//!
//! One probe is one bounded `GET {base}/health`. Probes never retry; the
//! discovery engine and the readiness poller own retry policy.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

/// Path of the backend health endpoint
pub const HEALTH_PATH: &str = "/health";

/// Classification of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum ProbeOutcome {
    /// 2xx response
    Healthy,
    /// Response arrived with a non-2xx status
    Unhealthy(u16),
    /// No response within the bound
    Timeout,
    /// Refused, unreachable, DNS failure...
    ConnectionError(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy => f.write_str("healthy"),
            ProbeOutcome::Unhealthy(status) => write!(f, "unhealthy (HTTP {})", status),
            ProbeOutcome::Timeout => f.write_str("timeout"),
            ProbeOutcome::ConnectionError(e) => write!(f, "connection error: {}", e),
        }
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Base URL that was probed
    pub endpoint: String,
    pub outcome: ProbeOutcome,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Join a base URL and the health path without doubling slashes
pub fn health_url(base: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), HEALTH_PATH)
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeResult;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone, Default)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout_duration: Duration) -> ProbeResult {
        let target = health_url(url);
        let start = Instant::now();

        let result = timeout(timeout_duration, self.client.get(&target).send()).await;

        let latency_ms = start.elapsed().as_millis() as u64;
        let outcome = match result {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(Ok(response)) => ProbeOutcome::Unhealthy(response.status().as_u16()),
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Timeout,
            Ok(Err(e)) => ProbeOutcome::ConnectionError(e.to_string()),
            Err(_) => ProbeOutcome::Timeout,
        };

        debug!("Probe {} -> {} ({}ms)", target, outcome, latency_ms);

        ProbeResult {
            endpoint: url.to_string(),
            outcome,
            latency_ms,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url() {
        assert_eq!(health_url("http://localhost:8000"), "http://localhost:8000/health");
        assert_eq!(health_url("http://localhost:8000/"), "http://localhost:8000/health");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(ProbeOutcome::Unhealthy(503).to_string(), "unhealthy (HTTP 503)");
        assert!(ProbeOutcome::Healthy.is_healthy());
        assert!(!ProbeOutcome::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // Port 9 (discard) is essentially never listening on loopback
        let probe = HttpProbe::new();
        let result = probe
            .probe("http://127.0.0.1:9", Duration::from_secs(2))
            .await;
        assert!(!result.outcome.is_healthy());
        assert_eq!(result.endpoint, "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_mock_probe_script_then_sticky() {
        let probe = mock::MockProbe::new();
        probe.script(
            "http://a",
            vec![ProbeOutcome::Timeout, ProbeOutcome::Healthy],
        );

        let t = Duration::from_secs(1);
        assert_eq!(probe.probe("http://a", t).await.outcome, ProbeOutcome::Timeout);
        assert_eq!(probe.probe("http://a", t).await.outcome, ProbeOutcome::Healthy);
        assert_eq!(probe.probe("http://a", t).await.outcome, ProbeOutcome::Healthy);
        assert!(matches!(
            probe.probe("http://b", t).await.outcome,
            ProbeOutcome::ConnectionError(_)
        ));
        assert_eq!(probe.calls_to("http://a"), 3);
    }
}
