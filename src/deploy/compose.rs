//! Compose target: the whole stack (backend plus monitoring services) is
//! declared in one compose file and published on fixed host ports.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{
    local_url, probe_readiness, require_file, run_step, DeployContext, DeployError, ReadyInfo,
    TargetDeployer, TargetKind,
};
use crate::config::{expand_path, ComposeConfig};
use crate::exposure::{BindingRegistry, BindingRequest};
use crate::readiness::{ReadinessPoller, ReadinessState};
use crate::runtime::{docker, CommandSpec};

pub struct ComposeDeployer {
    ctx: DeployContext,
    config: ComposeConfig,
}

impl ComposeDeployer {
    pub fn new(ctx: DeployContext, config: ComposeConfig) -> Self {
        Self { ctx, config }
    }

    fn file(&self) -> PathBuf {
        expand_path(&self.config.file)
    }

    fn project(&self) -> Option<&str> {
        self.config.project.as_deref()
    }

    /// Compose interpolates these into the stack file
    fn with_backend_env(&self, spec: CommandSpec) -> CommandSpec {
        docker::with_env(spec, &self.ctx.backend_env())
    }
}

#[async_trait]
impl TargetDeployer for ComposeDeployer {
    fn kind(&self) -> TargetKind {
        TargetKind::Compose
    }

    async fn check_prerequisites(&self) -> Result<(), DeployError> {
        run_step(
            self.ctx.runner.as_ref(),
            &docker::generate_compose_version_check(),
        )
        .await
        .map_err(|e| DeployError::Configuration(format!("docker compose unavailable: {}", e)))?;

        require_file(&self.config.file, "compose file")?;
        self.ctx.check_credentials()
    }

    async fn build(&self) -> Result<(), DeployError> {
        info!("Building compose stack {}", self.config.file.display());
        let spec = self.with_backend_env(docker::generate_compose_build(&self.file(), self.project()));
        run_step(self.ctx.runner.as_ref(), &spec)
            .await
            .map(|_| ())
            .map_err(DeployError::Build)
    }

    async fn apply(&self) -> Result<(), DeployError> {
        info!("Starting compose stack {}", self.config.file.display());
        let spec = self.with_backend_env(docker::generate_compose_up(&self.file(), self.project()));
        run_step(self.ctx.runner.as_ref(), &spec)
            .await
            .map(|_| ())
            .map_err(|detail| DeployError::DeployApply {
                target: TargetKind::Compose,
                detail,
            })
    }

    async fn check_readiness(&self) -> ReadinessState {
        probe_readiness(
            self.ctx.probe.as_ref(),
            &local_url(self.config.app_port),
            self.ctx.probe_timeout,
        )
        .await
    }

    fn readiness_poller(&self) -> ReadinessPoller {
        ReadinessPoller::new(
            self.ctx.interval,
            Duration::from_secs(self.config.readiness_timeout_secs),
        )
    }

    fn exposed_ports(&self) -> Vec<u16> {
        std::iter::once(self.config.app_port)
            .chain(self.config.auxiliary.iter().map(|p| p.port))
            .collect()
    }

    /// Ports are published by the stack itself; only record the mappings
    async fn expose(&self, bindings: &mut BindingRegistry) -> Result<ReadyInfo, DeployError> {
        let runner = self.ctx.runner.as_ref();
        let app = bindings
            .bind(
                BindingRequest::new("app", self.config.app_port, "compose:app", TargetKind::Compose),
                runner,
            )
            .await?;

        let mut info = ReadyInfo::new(app.local_url());
        for published in &self.config.auxiliary {
            let binding = bindings
                .bind(
                    BindingRequest::new(
                        published.name.clone(),
                        published.port,
                        format!("compose:{}", published.name),
                        TargetKind::Compose,
                    ),
                    runner,
                )
                .await?;
            info.auxiliary_urls
                .insert(published.name.clone(), binding.local_url());
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::test_support::context;
    use crate::probe::mock::MockProbe;
    use crate::probe::ProbeOutcome;
    use crate::runtime::process::mock::MockRunner;
    use std::sync::Arc;

    fn deployer(runner: Arc<MockRunner>, probe: Arc<MockProbe>, file: PathBuf) -> ComposeDeployer {
        let config = ComposeConfig {
            file,
            project: Some("companion".to_string()),
            ..Default::default()
        };
        ComposeDeployer::new(context(runner, probe), config)
    }

    #[tokio::test]
    async fn test_prereq_requires_compose_plugin() {
        let runner = Arc::new(MockRunner::new());
        runner.fail("docker", &["compose", "version"], "'compose' is not a docker command");
        let d = deployer(runner, Arc::new(MockProbe::new()), PathBuf::from("docker-compose.yml"));

        let err = d.check_prerequisites().await.unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_prereq_requires_compose_file() {
        let runner = Arc::new(MockRunner::new());
        let d = deployer(
            runner,
            Arc::new(MockProbe::new()),
            PathBuf::from("/nonexistent/docker-compose.yml"),
        );
        let err = d.check_prerequisites().await.unwrap_err();
        assert!(err.to_string().contains("compose file"));
    }

    #[tokio::test]
    async fn test_up_carries_backend_env() {
        let runner = Arc::new(MockRunner::new());
        let mut d = deployer(runner.clone(), Arc::new(MockProbe::new()), PathBuf::from("stack.yml"));
        d.ctx
            .app
            .env
            .insert("GOOGLE_CLOUD_PROJECT".to_string(), "demo".to_string());

        d.apply().await.unwrap();

        let up = runner
            .calls()
            .into_iter()
            .find(|c| c.matches("docker", &["compose", "-f", "stack.yml", "-p", "companion", "up"]))
            .unwrap();
        assert!(up
            .env
            .contains(&("GOOGLE_CLOUD_PROJECT".to_string(), "demo".to_string())));
    }

    #[tokio::test]
    async fn test_build_failure_is_build_error() {
        let runner = Arc::new(MockRunner::new());
        runner.fail("docker", &["compose"], "failed to solve: requirements.txt not found");
        let d = deployer(runner, Arc::new(MockProbe::new()), PathBuf::from("stack.yml"));

        match d.build().await.unwrap_err() {
            DeployError::Build(detail) => assert!(detail.contains("requirements.txt")),
            other => panic!("Expected Build, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_readiness_follows_health_probe() {
        let probe = Arc::new(MockProbe::new());
        let d = deployer(Arc::new(MockRunner::new()), probe.clone(), PathBuf::from("stack.yml"));

        assert_eq!(d.check_readiness().await, ReadinessState::Pending);
        probe.set("http://localhost:8000", ProbeOutcome::Healthy);
        assert_eq!(d.check_readiness().await, ReadinessState::Ready);
    }

    #[tokio::test]
    async fn test_expose_records_published_ports() {
        let runner = Arc::new(MockRunner::new());
        let d = deployer(runner.clone(), Arc::new(MockProbe::new()), PathBuf::from("stack.yml"));
        let mut bindings = BindingRegistry::in_memory();

        let info = d.expose(&mut bindings).await.unwrap();
        assert_eq!(info.app_url, "http://localhost:8000");
        assert_eq!(info.auxiliary_urls.get("prometheus").unwrap(), "http://localhost:9090");
        assert_eq!(bindings.len(), 4);
        assert!(runner.spawned().is_empty());

        d.expose(&mut bindings).await.unwrap();
        assert_eq!(bindings.len(), 4);
    }
}
