//! Bounded readiness polling
//!
//! A deployed backend is polled with a target-specific check until it reports
//! Ready, reports Failed, or the timeout elapses. The loop sleeps cooperatively
//! between checks and never issues a check once the deadline has passed.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Default pause between readiness checks
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Observed readiness of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessState {
    Unknown,
    Pending,
    Ready,
    TimedOut,
    Failed,
}

impl ReadinessState {
    /// Ready and Failed end polling; everything else keeps waiting
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadinessState::Ready | ReadinessState::Failed)
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessState::Unknown => "Unknown",
            ReadinessState::Pending => "Pending",
            ReadinessState::Ready => "Ready",
            ReadinessState::TimedOut => "TimedOut",
            ReadinessState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Result of a polling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Final state: Ready, Failed or TimedOut
    pub state: ReadinessState,
    /// What the last check reported
    pub last_observed: ReadinessState,
    /// Number of checks performed
    pub checks: u32,
    pub elapsed: Duration,
}

/// Interval/timeout pair driving [`await_ready`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub async fn await_ready<F, Fut>(&self, check: F) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReadinessState>,
    {
        await_ready(check, self.interval, self.timeout).await
    }
}

/// Poll `check` every `interval` until it reports a terminal state or
/// `timeout` elapses.
pub async fn await_ready<F, Fut>(mut check: F, interval: Duration, timeout: Duration) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReadinessState>,
{
    let start = Instant::now();
    let mut checks = 0u32;
    let mut last_observed;

    loop {
        last_observed = check().await;
        checks += 1;
        trace!("Readiness check #{}: {}", checks, last_observed);

        if last_observed.is_terminal() {
            debug!(
                "Readiness settled on {} after {} checks ({:?})",
                last_observed,
                checks,
                start.elapsed()
            );
            return PollOutcome {
                state: last_observed,
                last_observed,
                checks,
                elapsed: start.elapsed(),
            };
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            break;
        }

        sleep(interval.min(timeout - elapsed)).await;

        if start.elapsed() >= timeout {
            break;
        }
    }

    debug!(
        "Readiness timed out after {} checks ({:?}), last observed {}",
        checks,
        start.elapsed(),
        last_observed
    );
    PollOutcome {
        state: ReadinessState::TimedOut,
        last_observed,
        checks,
        elapsed: start.elapsed(),
    }
}
