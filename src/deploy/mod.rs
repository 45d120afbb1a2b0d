//! Deployment targets
//!
//! A [`DeploymentTarget`] is frozen when a run starts. Each variant has a
//! [`TargetDeployer`] implementation exposing the same capability set, so the
//! orchestrator never branches on the target kind.

pub mod cluster;
pub mod compose;
pub mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{expand_path, AppConfig, ClusterConfig, ComposeConfig, LocalConfig};
use crate::exposure::{BindingError, BindingRegistry};
use crate::probe::HealthProbe;
use crate::readiness::{ReadinessPoller, ReadinessState};
use crate::runtime::{CommandOutput, CommandRunner, CommandSpec};

pub use cluster::ClusterDeployer;
pub use compose::ComposeDeployer;
pub use local::LocalDeployer;

/// Environment variable carrying the credentials file path to the backend
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Cluster,
    Compose,
    Local,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::Cluster => "cluster",
            TargetKind::Compose => "compose",
            TargetKind::Local => "local",
        };
        f.write_str(s)
    }
}

/// Where and how the backend runs for one orchestrator run
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentTarget {
    Cluster(ClusterConfig),
    Compose(ComposeConfig),
    Local(LocalConfig),
}

impl DeploymentTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            DeploymentTarget::Cluster(_) => TargetKind::Cluster,
            DeploymentTarget::Compose(_) => TargetKind::Compose,
            DeploymentTarget::Local(_) => TargetKind::Local,
        }
    }
}

/// Reachable addresses of a ready deployment, identical in shape for every target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyInfo {
    pub app_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auxiliary_urls: BTreeMap<String, String>,
}

impl ReadyInfo {
    pub fn new(app_url: impl Into<String>) -> Self {
        Self {
            app_url: app_url.into(),
            auxiliary_urls: BTreeMap::new(),
        }
    }
}

/// Why a run ended in Failed
#[derive(Error, Debug)]
pub enum DeployError {
    /// Missing tooling or connectivity. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Deterministic build failure. Never retried.
    #[error("Build failed: {0}")]
    Build(String),

    #[error("Deployment rejected by {target} target: {detail}")]
    DeployApply { target: TargetKind, detail: String },

    #[error("Readiness timeout after {elapsed:?} (last observed state: {last_state})")]
    ReadinessTimeout {
        elapsed: Duration,
        last_state: ReadinessState,
    },

    #[error("Deployment run exceeded {0:?}")]
    RunTimeout(Duration),

    #[error("Port exposure failed: {0}")]
    Exposure(#[from] BindingError),
}

/// Shared collaborators and settings handed to every deployer
#[derive(Clone)]
pub struct DeployContext {
    pub app: AppConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn HealthProbe>,
    /// Pause between readiness checks
    pub interval: Duration,
    /// Bound for a single readiness health probe
    pub probe_timeout: Duration,
}

impl DeployContext {
    /// Environment handed to the backend: configured entries plus the
    /// credentials path, never read here
    pub fn backend_env(&self) -> BTreeMap<String, String> {
        let mut env = self.app.env.clone();
        if let Some(path) = &self.app.credentials_file {
            env.insert(
                CREDENTIALS_ENV.to_string(),
                expand_path(path).display().to_string(),
            );
        }
        env
    }

    /// The credentials file must exist if one is configured
    pub fn check_credentials(&self) -> Result<(), DeployError> {
        match &self.app.credentials_file {
            Some(path) if !expand_path(path).exists() => Err(DeployError::Configuration(format!(
                "credentials file {} not found",
                path.display()
            ))),
            _ => Ok(()),
        }
    }
}

/// Capability set implemented by every target variant
#[async_trait]
pub trait TargetDeployer: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Required tools and connectivity are present
    async fn check_prerequisites(&self) -> Result<(), DeployError>;

    /// Produce deployable artifacts
    async fn build(&self) -> Result<(), DeployError>;

    /// Apply declarations or start the process. Re-running converges.
    async fn apply(&self) -> Result<(), DeployError>;

    /// One readiness observation
    async fn check_readiness(&self) -> ReadinessState;

    /// How long and how often to poll `check_readiness`
    fn readiness_poller(&self) -> ReadinessPoller;

    /// Local ports this target binds; stale bindings on them are released
    /// before apply
    fn exposed_ports(&self) -> Vec<u16>;

    /// Make the deployment reachable and report where
    async fn expose(&self, bindings: &mut BindingRegistry) -> Result<ReadyInfo, DeployError>;

    /// Stop whatever `apply` started that no binding owns yet. Called when a
    /// run fails after Deploy; must be safe to call at any point.
    async fn abort(&self) {}
}

/// Build the deployer for a target
pub fn deployer_for(target: &DeploymentTarget, ctx: DeployContext) -> Box<dyn TargetDeployer> {
    match target {
        DeploymentTarget::Cluster(config) => Box::new(ClusterDeployer::new(ctx, config.clone())),
        DeploymentTarget::Compose(config) => Box::new(ComposeDeployer::new(ctx, config.clone())),
        DeploymentTarget::Local(config) => Box::new(LocalDeployer::new(ctx, config.clone())),
    }
}

/// Run a command and turn a non-zero exit into its failure detail
pub(crate) async fn run_step(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandOutput, String> {
    match runner.run(spec).await {
        Ok(output) if output.success => Ok(output),
        Ok(output) => Err(format!("`{}` failed: {}", spec, output.failure_detail())),
        Err(e) => Err(e.to_string()),
    }
}

/// Health-probe readiness shared by compose and local targets
pub(crate) async fn probe_readiness(
    probe: &dyn HealthProbe,
    base_url: &str,
    timeout: Duration,
) -> ReadinessState {
    if probe.probe(base_url, timeout).await.outcome.is_healthy() {
        ReadinessState::Ready
    } else {
        ReadinessState::Pending
    }
}

pub(crate) fn local_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

pub(crate) fn require_file(path: &Path, what: &str) -> Result<(), DeployError> {
    if expand_path(path).exists() {
        Ok(())
    } else {
        Err(DeployError::Configuration(format!(
            "{} {} not found",
            what,
            path.display()
        )))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::runtime::process::mock::MockRunner;

    pub fn context(runner: Arc<MockRunner>, probe: Arc<MockProbe>) -> DeployContext {
        DeployContext {
            app: AppConfig::default(),
            runner,
            probe,
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}
