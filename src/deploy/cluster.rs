//! Cluster target: image build, manifest apply, pod-phase readiness and one
//! `kubectl port-forward` tunnel per exposed service.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    local_url, run_step, DeployContext, DeployError, ReadyInfo, TargetDeployer, TargetKind,
};
use crate::config::{expand_path, ClusterConfig, ServiceForward};
use crate::exposure::{BindingError, BindingRegistry, BindingRequest, PortBinding};
use crate::probe::ProbeOutcome;
use crate::readiness::{ReadinessPoller, ReadinessState};
use crate::runtime::{docker, kubectl};

/// Pause between checks of a freshly started tunnel
const TUNNEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// A tunnel is up once its local port answers. The app tunnel must reach a
/// healthy backend; dashboards only need to answer at all.
pub fn tunnel_readiness(outcome: &ProbeOutcome, require_healthy: bool) -> ReadinessState {
    match outcome {
        ProbeOutcome::Healthy => ReadinessState::Ready,
        ProbeOutcome::Unhealthy(_) if !require_healthy => ReadinessState::Ready,
        _ => ReadinessState::Pending,
    }
}

// ============================================================================
// SBIO: Deployer
// ============================================================================

pub struct ClusterDeployer {
    ctx: DeployContext,
    config: ClusterConfig,
}

impl ClusterDeployer {
    pub fn new(ctx: DeployContext, config: ClusterConfig) -> Self {
        Self { ctx, config }
    }

    fn apply_error(detail: String) -> DeployError {
        DeployError::DeployApply {
            target: TargetKind::Cluster,
            detail,
        }
    }

    /// Observability manifests present on disk; the stack is optional
    fn observability_manifests(&self) -> Vec<PathBuf> {
        let Some(observability) = &self.config.observability else {
            return Vec::new();
        };
        observability
            .manifests
            .iter()
            .map(|p| expand_path(p))
            .filter(|p| {
                let exists = p.exists();
                if !exists {
                    debug!("Observability manifest {} not present, skipping", p.display());
                }
                exists
            })
            .collect()
    }

    fn auxiliary_forwards(&self) -> Vec<ServiceForward> {
        match &self.config.observability {
            Some(observability) if !self.observability_manifests().is_empty() => {
                observability.forwards.clone()
            }
            _ => Vec::new(),
        }
    }

    async fn ensure_namespace(&self) -> Result<(), DeployError> {
        let ns = &self.config.namespace;
        if run_step(self.ctx.runner.as_ref(), &kubectl::generate_get_namespace(ns))
            .await
            .is_ok()
        {
            return Ok(());
        }
        info!("Creating namespace {}", ns);
        run_step(self.ctx.runner.as_ref(), &kubectl::generate_create_namespace(ns))
            .await
            .map(|_| ())
            .map_err(Self::apply_error)
    }

    /// Recreate the credentials secret so a changed file is picked up
    async fn sync_credentials(&self) -> Result<(), DeployError> {
        let Some(file) = &self.ctx.app.credentials_file else {
            return Ok(());
        };
        let ns = &self.config.namespace;
        let name = &self.config.credentials_secret;

        run_step(
            self.ctx.runner.as_ref(),
            &kubectl::generate_delete_secret(ns, name),
        )
        .await
        .map_err(Self::apply_error)?;

        run_step(
            self.ctx.runner.as_ref(),
            &kubectl::generate_create_secret_from_file(
                ns,
                name,
                &self.config.credentials_key,
                &expand_path(file),
            ),
        )
        .await
        .map(|_| ())
        .map_err(Self::apply_error)
    }

    fn tunnel(&self, forward: &ServiceForward) -> BindingRequest {
        BindingRequest::new(
            forward.name.clone(),
            forward.local_port,
            format!("svc/{}:{}", forward.service, forward.remote_port),
            TargetKind::Cluster,
        )
        .launch(kubectl::generate_port_forward(
            &self.config.namespace,
            &forward.service,
            forward.local_port,
            forward.remote_port,
        ))
    }

    /// Start one tunnel and wait until it answers. A tunnel that never comes
    /// up is released again instead of being recorded as live.
    async fn open_tunnel(
        &self,
        forward: &ServiceForward,
        bindings: &mut BindingRegistry,
        require_healthy: bool,
    ) -> Result<PortBinding, BindingError> {
        let runner = self.ctx.runner.as_ref();
        let binding = bindings.bind(self.tunnel(forward), runner).await?;

        let state = self.await_tunnel(&binding, require_healthy).await;
        if state == ReadinessState::Ready {
            return Ok(binding);
        }

        if let Err(e) = bindings.release(binding.local_port, runner).await {
            warn!("{}", e);
        }
        Err(BindingError::Unreachable {
            name: binding.name,
            port: binding.local_port,
            state,
        })
    }

    async fn await_tunnel(&self, binding: &PortBinding, require_healthy: bool) -> ReadinessState {
        let runner = self.ctx.runner.as_ref();
        let probe = self.ctx.probe.as_ref();
        let process = binding.process.as_ref();
        let url = binding.local_url();
        let url = url.as_str();
        let probe_timeout = self.ctx.probe_timeout;

        let poller = ReadinessPoller::new(TUNNEL_POLL_INTERVAL, self.config.tunnel_timeout());
        let outcome = poller
            .await_ready(move || async move {
                if let Some(process) = process {
                    if !runner.is_alive(process).await {
                        return ReadinessState::Failed;
                    }
                }
                let result = probe.probe(url, probe_timeout).await;
                tunnel_readiness(&result.outcome, require_healthy)
            })
            .await;
        debug!(
            "Tunnel {} settled on {} after {} checks",
            url, outcome.state, outcome.checks
        );
        outcome.state
    }
}

#[async_trait]
impl TargetDeployer for ClusterDeployer {
    fn kind(&self) -> TargetKind {
        TargetKind::Cluster
    }

    async fn check_prerequisites(&self) -> Result<(), DeployError> {
        let runner = self.ctx.runner.as_ref();

        run_step(runner, &kubectl::generate_cluster_info())
            .await
            .map_err(|e| DeployError::Configuration(format!("no cluster connectivity: {}", e)))?;

        run_step(runner, &docker::generate_version_check())
            .await
            .map_err(|e| DeployError::Configuration(format!("docker unavailable: {}", e)))?;

        for manifest in &self.config.manifests {
            super::require_file(manifest, "manifest")?;
        }
        self.ctx.check_credentials()
    }

    async fn build(&self) -> Result<(), DeployError> {
        let app = &self.ctx.app;
        info!("Building image {}", app.image);
        run_step(
            self.ctx.runner.as_ref(),
            &docker::generate_build(&expand_path(&app.dockerfile), &expand_path(&app.context), &app.image),
        )
        .await
        .map(|_| ())
        .map_err(DeployError::Build)
    }

    async fn apply(&self) -> Result<(), DeployError> {
        self.ensure_namespace().await?;
        self.sync_credentials().await?;

        let runner = self.ctx.runner.as_ref();
        for manifest in &self.config.manifests {
            info!("Applying {}", manifest.display());
            run_step(
                runner,
                &kubectl::generate_apply(&self.config.namespace, &expand_path(manifest)),
            )
            .await
            .map_err(Self::apply_error)?;
        }

        for manifest in self.observability_manifests() {
            info!("Applying observability stack {}", manifest.display());
            if let Err(e) =
                run_step(runner, &kubectl::generate_apply(&self.config.namespace, &manifest)).await
            {
                warn!("Observability stack not applied: {}", e);
            }
        }
        Ok(())
    }

    async fn check_readiness(&self) -> ReadinessState {
        let spec = kubectl::generate_pod_phases(&self.config.namespace, &self.config.app_selector);
        match run_step(self.ctx.runner.as_ref(), &spec).await {
            Ok(output) => kubectl::phases_to_readiness(&output.stdout),
            Err(e) => {
                debug!("Pod phase query failed: {}", e);
                ReadinessState::Pending
            }
        }
    }

    fn readiness_poller(&self) -> ReadinessPoller {
        ReadinessPoller::new(
            self.ctx.interval,
            Duration::from_secs(self.config.readiness_timeout_secs),
        )
    }

    fn exposed_ports(&self) -> Vec<u16> {
        std::iter::once(self.config.app_forward.local_port)
            .chain(self.auxiliary_forwards().iter().map(|f| f.local_port))
            .collect()
    }

    async fn expose(&self, bindings: &mut BindingRegistry) -> Result<ReadyInfo, DeployError> {
        let app = self
            .open_tunnel(&self.config.app_forward, bindings, true)
            .await?;
        let mut info = ReadyInfo::new(app.local_url());

        for forward in self.auxiliary_forwards() {
            match self.open_tunnel(&forward, bindings, false).await {
                Ok(binding) => {
                    info.auxiliary_urls
                        .insert(forward.name.clone(), binding.local_url());
                }
                Err(e) => warn!("Auxiliary endpoint '{}' not exposed: {}", forward.name, e),
            }
        }

        debug!("Cluster app reachable at {}", local_url(self.config.app_forward.local_port));
        Ok(info)
    }
}
