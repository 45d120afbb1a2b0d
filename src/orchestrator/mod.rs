//! Deployment orchestrator
//!
//! Drives one target through
//! `Idle → PrereqCheck → Build → Deploy → AwaitReady → ExposePorts → Verify → Ready`.
//! Any stage may end the run in `Failed` with a typed [`DeployError`]. The
//! orchestrator only talks to the [`TargetDeployer`] capability set and never
//! branches on the target kind.

pub mod cleanup;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::client::{BackendApi, ChatRequest};
use crate::config::{AppConfig, DeployConfig};
use crate::deploy::{
    deployer_for, DeployContext, DeployError, DeploymentTarget, ReadyInfo, TargetDeployer,
    TargetKind,
};
use crate::discovery::DEFAULT_PROBE_TIMEOUT;
use crate::exposure::BindingRegistry;
use crate::probe::HealthProbe;
use crate::readiness::{ReadinessState, DEFAULT_INTERVAL};
use crate::runtime::CommandRunner;

pub use cleanup::{cleanup, CleanupOptions, CleanupReport};

/// Default bound on a whole run
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(900);

/// Minimal functional request sent once the app is exposed
pub const VERIFY_PROMPT: &str = "Deployment check: please reply briefly.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Idle,
    PrereqCheck,
    Build,
    Deploy,
    AwaitReady,
    ExposePorts,
    Verify,
    Ready,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of the post-exposure smoke check. Never rolls a deployment back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Verification {
    Verified,
    Unverified(String),
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: TargetKind,
    pub ready: ReadyInfo,
    pub verification: Verification,
    pub stages: Vec<Stage>,
    pub elapsed: Duration,
}

/// One health check plus one functional call against an exposed app
pub async fn verify_endpoint(
    probe: &dyn HealthProbe,
    backend: &dyn BackendApi,
    app_url: &str,
    probe_timeout: Duration,
) -> Verification {
    let result = probe.probe(app_url, probe_timeout).await;
    if !result.outcome.is_healthy() {
        return Verification::Unverified(format!("health check: {}", result.outcome));
    }

    match backend
        .send_prompt(app_url, &ChatRequest::new(VERIFY_PROMPT))
        .await
    {
        Ok(reply) if reply.response.trim().is_empty() => {
            Verification::Unverified("functional check: empty response".to_string())
        }
        Ok(_) => Verification::Verified,
        Err(e) => Verification::Unverified(format!("functional check: {}", e)),
    }
}

pub struct Orchestrator {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn HealthProbe>,
    backend: Arc<dyn BackendApi>,
    bindings: BindingRegistry,
    app: AppConfig,
    interval: Duration,
    probe_timeout: Duration,
    run_timeout: Duration,
    skip_build: bool,
    history: Vec<Stage>,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn HealthProbe>,
        backend: Arc<dyn BackendApi>,
        bindings: BindingRegistry,
    ) -> Self {
        Self {
            runner,
            probe,
            backend,
            bindings,
            app: AppConfig::default(),
            interval: DEFAULT_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            skip_build: false,
            history: Vec::new(),
        }
    }

    /// Take app, interval, probe and run bounds from a loaded config
    pub fn configured(mut self, config: &DeployConfig) -> Self {
        self.app = config.app.clone();
        self.interval = config.readiness.interval();
        self.probe_timeout = config.discovery.probe_timeout();
        self.run_timeout = config.run_timeout();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn skip_build(mut self, skip: bool) -> Self {
        self.skip_build = skip;
        self
    }

    /// Stages visited by the most recent run
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut BindingRegistry {
        &mut self.bindings
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn context(&self) -> DeployContext {
        DeployContext {
            app: self.app.clone(),
            runner: self.runner.clone(),
            probe: self.probe.clone(),
            interval: self.interval,
            probe_timeout: self.probe_timeout,
        }
    }

    /// Deploy `target` and bring it to Ready, or fail with the cause
    pub async fn run(&mut self, target: &DeploymentTarget) -> Result<RunReport, DeployError> {
        let deployer = deployer_for(target, self.context());
        self.run_with(deployer.as_ref()).await
    }

    pub async fn run_with(
        &mut self,
        deployer: &dyn TargetDeployer,
    ) -> Result<RunReport, DeployError> {
        self.history.clear();
        self.enter(Stage::Idle);

        let start = Instant::now();
        let run_timeout = self.run_timeout;
        let result = match timeout(run_timeout, self.drive(deployer)).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::RunTimeout(run_timeout)),
        };

        match result {
            Ok((ready, verification)) => {
                self.enter(Stage::Ready);
                let report = RunReport {
                    target: deployer.kind(),
                    ready,
                    verification,
                    stages: self.history.clone(),
                    elapsed: start.elapsed(),
                };
                info!(
                    "{} deployment ready at {} after {:?}",
                    report.target, report.ready.app_url, report.elapsed
                );
                Ok(report)
            }
            Err(e) => {
                self.enter(Stage::Failed);
                error!("{} deployment failed: {}", deployer.kind(), e);
                deployer.abort().await;
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        deployer: &dyn TargetDeployer,
    ) -> Result<(ReadyInfo, Verification), DeployError> {
        self.enter(Stage::PrereqCheck);
        deployer.check_prerequisites().await?;

        if self.skip_build {
            info!("Skipping build");
        } else {
            self.enter(Stage::Build);
            deployer.build().await?;
        }

        self.enter(Stage::Deploy);
        let stale = self
            .bindings
            .release_ports(&deployer.exposed_ports(), self.runner.as_ref())
            .await;
        if let Some(e) = stale.failed.into_iter().next() {
            return Err(e.into());
        }
        if stale.released > 0 {
            info!("Released {} stale bindings", stale.released);
        }
        deployer.apply().await?;

        self.enter(Stage::AwaitReady);
        let outcome = deployer
            .readiness_poller()
            .await_ready(|| deployer.check_readiness())
            .await;
        match outcome.state {
            ReadinessState::Ready => {}
            ReadinessState::Failed => {
                return Err(DeployError::DeployApply {
                    target: deployer.kind(),
                    detail: format!(
                        "deployment entered a failed state after {} checks",
                        outcome.checks
                    ),
                })
            }
            _ => {
                return Err(DeployError::ReadinessTimeout {
                    elapsed: outcome.elapsed,
                    last_state: outcome.last_observed,
                })
            }
        }

        self.enter(Stage::ExposePorts);
        let ready = deployer.expose(&mut self.bindings).await?;

        self.enter(Stage::Verify);
        let verification = verify_endpoint(
            self.probe.as_ref(),
            self.backend.as_ref(),
            &ready.app_url,
            self.probe_timeout,
        )
        .await;
        if let Verification::Unverified(reason) = &verification {
            warn!("Deployed but unverified: {}", reason);
        }

        Ok((ready, verification))
    }

    fn enter(&mut self, stage: Stage) {
        if stage != Stage::Idle {
            info!("Stage: {}", stage);
        }
        self.history.push(stage);
    }
}
