//! Client-side service discovery
//!
//! Walks an ordered list of candidate endpoints, probing one at a time, and
//! settles on the first healthy one. Order encodes priority: the cluster
//! port-forward address first, then compose/local defaults, then in-network
//! service names, then loopback alternates.
//!
//! A send failure against the selected endpoint invalidates the session; a
//! fresh discovery runs only after a fixed backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::probe::{HealthProbe, ProbeResult};

/// Per-candidate probe bound
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between a send failure and the next discovery
pub const DEFAULT_REDISCOVERY_BACKOFF: Duration = Duration::from_secs(2);

/// One place the backend might be running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEndpoint {
    pub url: String,
    pub label: String,
}

impl CandidateEndpoint {
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for CandidateEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.label)
    }
}

/// Built-in candidate order matching the default deployment layout
pub fn default_candidates() -> Vec<CandidateEndpoint> {
    vec![
        CandidateEndpoint::new("http://localhost:8080", "kubernetes"),
        CandidateEndpoint::new("http://localhost:8000", "docker-compose/local"),
        CandidateEndpoint::new("http://mental-health-app-service", "kubernetes-internal"),
        CandidateEndpoint::new("http://mental-health-app:8000", "docker-compose-internal"),
        CandidateEndpoint::new("http://127.0.0.1:8080", "loopback-8080"),
        CandidateEndpoint::new("http://127.0.0.1:8000", "loopback-8000"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Detecting,
    Connected,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Detecting => "Detecting",
            SessionStatus::Connected => "Connected",
            SessionStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Connection state of the client. Connected iff an endpoint is selected and
/// its latest probe was healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySession {
    pub selected: Option<CandidateEndpoint>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<ProbeResult>,
    /// Candidates probed in the most recent discovery run
    pub probed: usize,
}

impl DiscoverySession {
    pub fn detecting() -> Self {
        Self {
            selected: None,
            status: SessionStatus::Detecting,
            last_probe: None,
            probed: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected && self.selected.is_some()
    }

    pub fn base_url(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.url.as_str())
    }
}

impl Default for DiscoverySession {
    fn default() -> Self {
        Self::detecting()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("No backend found: all {0} candidate endpoints are unreachable")]
    Exhausted(usize),

    #[error("No backend found after {0} re-discovery attempts")]
    RetriesExhausted(u32),
}

/// Probe candidates in order and stop at the first healthy one
pub async fn discover(
    probe: &dyn HealthProbe,
    candidates: &[CandidateEndpoint],
    probe_timeout: Duration,
) -> DiscoverySession {
    let mut session = DiscoverySession::detecting();

    for candidate in candidates {
        let result = probe.probe(&candidate.url, probe_timeout).await;
        session.probed += 1;

        if result.outcome.is_healthy() {
            info!("Connected to backend at {}", candidate);
            session.selected = Some(candidate.clone());
            session.status = SessionStatus::Connected;
            session.last_probe = Some(result);
            return session;
        }

        debug!("Candidate {} not reachable: {}", candidate, result.outcome);
        session.last_probe = Some(result);
    }

    warn!(
        "No backend found among {} candidate endpoints",
        candidates.len()
    );
    session.status = SessionStatus::Error;
    session
}

/// Owns the discovery session and its recovery policy
pub struct DiscoveryEngine {
    probe: Arc<dyn HealthProbe>,
    candidates: Vec<CandidateEndpoint>,
    probe_timeout: Duration,
    backoff: Duration,
    max_rediscovery_attempts: Option<u32>,
    session: DiscoverySession,
}

impl DiscoveryEngine {
    pub fn new(probe: Arc<dyn HealthProbe>, candidates: Vec<CandidateEndpoint>) -> Self {
        Self {
            probe,
            candidates,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            backoff: DEFAULT_REDISCOVERY_BACKOFF,
            max_rediscovery_attempts: None,
            session: DiscoverySession::detecting(),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bound re-discovery attempts. `None` keeps retrying for as long as the
    /// client lives.
    pub fn with_max_rediscovery_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_rediscovery_attempts = attempts;
        self
    }

    pub fn session(&self) -> &DiscoverySession {
        &self.session
    }

    pub fn candidates(&self) -> &[CandidateEndpoint] {
        &self.candidates
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Run a fresh discovery pass
    pub async fn discover(&mut self) -> &DiscoverySession {
        self.session = discover(self.probe.as_ref(), &self.candidates, self.probe_timeout).await;
        &self.session
    }

    /// Drop the current selection after a failed send
    pub fn invalidate(&mut self) {
        if let Some(selected) = &self.session.selected {
            warn!("Invalidating backend selection {}", selected);
        }
        self.session.selected = None;
        self.session.status = SessionStatus::Error;
    }

    /// Invalidate, wait out the backoff, then discover again
    pub async fn rediscover(&mut self) -> &DiscoverySession {
        self.invalidate();
        debug!("Re-discovering backend in {:?}", self.backoff);
        sleep(self.backoff).await;
        self.discover().await
    }

    /// Return the selected endpoint, discovering (and re-discovering with
    /// backoff) until one is found or the attempt bound is hit.
    pub async fn ensure_connected(&mut self) -> Result<CandidateEndpoint, DiscoveryError> {
        if let Some(selected) = self.connected_endpoint() {
            return Ok(selected);
        }

        if self.session.status == SessionStatus::Detecting {
            self.discover().await;
            if let Some(selected) = self.connected_endpoint() {
                return Ok(selected);
            }
        }

        let mut attempts = 0u32;
        loop {
            if let Some(max) = self.max_rediscovery_attempts {
                if attempts >= max {
                    return Err(if max == 0 {
                        DiscoveryError::Exhausted(self.candidates.len())
                    } else {
                        DiscoveryError::RetriesExhausted(attempts)
                    });
                }
            }
            attempts += 1;
            self.rediscover().await;
            if let Some(selected) = self.connected_endpoint() {
                return Ok(selected);
            }
        }
    }

    fn connected_endpoint(&self) -> Option<CandidateEndpoint> {
        if self.session.is_connected() {
            self.session.selected.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::probe::ProbeOutcome;
    use tokio::time::Instant;

    fn abc() -> Vec<CandidateEndpoint> {
        vec![
            CandidateEndpoint::new("http://a", "A"),
            CandidateEndpoint::new("http://b", "B"),
            CandidateEndpoint::new("http://c", "C"),
        ]
    }

    #[tokio::test]
    async fn test_discover_selects_first_healthy_and_stops() {
        let probe = MockProbe::new();
        probe.set("http://a", ProbeOutcome::Unhealthy(503));
        probe.set("http://b", ProbeOutcome::Healthy);
        probe.set("http://c", ProbeOutcome::Healthy);

        let session = discover(&probe, &abc(), DEFAULT_PROBE_TIMEOUT).await;

        assert_eq!(session.status, SessionStatus::Connected);
        assert_eq!(session.selected.unwrap().label, "B");
        assert_eq!(session.probed, 2);
        assert_eq!(probe.calls(), vec!["http://a", "http://b"]);
        assert_eq!(probe.calls_to("http://c"), 0);
    }

    #[tokio::test]
    async fn test_discover_all_unhealthy() {
        let probe = MockProbe::new();
        probe.set("http://a", ProbeOutcome::Timeout);
        probe.set("http://b", ProbeOutcome::Unhealthy(500));

        let session = discover(&probe, &abc(), DEFAULT_PROBE_TIMEOUT).await;

        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.selected.is_none());
        assert!(!session.is_connected());
        assert_eq!(session.probed, 3);
    }

    #[tokio::test]
    async fn test_discover_empty_candidates() {
        let probe = MockProbe::new();
        let session = discover(&probe, &[], DEFAULT_PROBE_TIMEOUT).await;
        assert_eq!(session.status, SessionStatus::Error);
        assert!(probe.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscover_waits_for_backoff() {
        let probe = Arc::new(MockProbe::new());
        probe.script(
            "http://a",
            vec![ProbeOutcome::Healthy, ProbeOutcome::ConnectionError("down".into())],
        );
        probe.set("http://b", ProbeOutcome::Healthy);

        let mut engine = DiscoveryEngine::new(probe.clone(), abc());
        assert!(engine.discover().await.is_connected());
        assert_eq!(engine.session().base_url(), Some("http://a"));

        let start = Instant::now();
        engine.invalidate();
        assert_eq!(engine.session().status, SessionStatus::Error);
        assert!(engine.session().selected.is_none());

        let session = engine.rediscover().await;
        assert!(start.elapsed() >= DEFAULT_REDISCOVERY_BACKOFF);
        assert_eq!(session.status, SessionStatus::Connected);
        assert_eq!(session.base_url(), Some("http://b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probe_before_backoff_elapses() {
        let probe = Arc::new(MockProbe::new());
        probe.set("http://a", ProbeOutcome::Healthy);
        let mut engine = DiscoveryEngine::new(probe.clone(), abc());
        engine.discover().await;
        assert_eq!(probe.calls().len(), 1);

        let handle = tokio::spawn(async move {
            engine.rediscover().await;
            engine
        });

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(probe.calls().len(), 1);

        let engine = handle.await.unwrap();
        assert_eq!(probe.calls().len(), 2);
        assert!(engine.session().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_bounded_retries() {
        let probe = Arc::new(MockProbe::new());
        let mut engine = DiscoveryEngine::new(probe.clone(), abc())
            .with_max_rediscovery_attempts(Some(2));

        let start = Instant::now();
        let err = engine.ensure_connected().await.unwrap_err();

        assert_eq!(err, DiscoveryError::RetriesExhausted(2));
        // Initial pass plus two retries, three candidates each
        assert_eq!(probe.calls().len(), 9);
        assert!(start.elapsed() >= DEFAULT_REDISCOVERY_BACKOFF * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_recovers() {
        let probe = Arc::new(MockProbe::new());
        probe.script(
            "http://c",
            vec![ProbeOutcome::Timeout, ProbeOutcome::Healthy],
        );
        let mut engine = DiscoveryEngine::new(probe.clone(), abc());

        let endpoint = engine.ensure_connected().await.unwrap();
        assert_eq!(endpoint.label, "C");
    }

    #[tokio::test]
    async fn test_ensure_connected_zero_attempts_reports_exhausted() {
        let probe = Arc::new(MockProbe::new());
        let mut engine = DiscoveryEngine::new(probe, abc()).with_max_rediscovery_attempts(Some(0));
        assert_eq!(
            engine.ensure_connected().await.unwrap_err(),
            DiscoveryError::Exhausted(3)
        );
    }

    #[test]
    fn test_default_candidate_order() {
        let candidates = default_candidates();
        assert_eq!(candidates[0].label, "kubernetes");
        assert_eq!(candidates[1].url, "http://localhost:8000");
        assert!(candidates.last().unwrap().url.starts_with("http://127.0.0.1"));
    }
}
