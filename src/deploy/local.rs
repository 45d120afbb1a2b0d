//! Local target: the backend runs as a host process supervised by the CLI.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    local_url, probe_readiness, run_step, DeployContext, DeployError, ReadyInfo, TargetDeployer,
    TargetKind,
};
use crate::config::{expand_path, LocalConfig};
use crate::exposure::{BindingRegistry, BindingRequest};
use crate::readiness::{ReadinessPoller, ReadinessState};
use crate::runtime::{docker, CommandSpec, ProcessHandle};

/// Environment variable telling the backend which port to listen on
pub const PORT_ENV: &str = "PORT";

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// `<program> --version`: the interpreter must be installed
pub fn generate_program_check(config: &LocalConfig) -> CommandSpec {
    CommandSpec::new(&config.program).arg("--version")
}

/// Dependency install step, if one is configured
pub fn generate_install(config: &LocalConfig) -> Option<CommandSpec> {
    let (program, args) = config.install.split_first()?;
    let mut spec = CommandSpec::new(program).args(args);
    if let Some(dir) = &config.workdir {
        spec = spec.current_dir(expand_path(dir));
    }
    Some(spec)
}

/// The backend process itself
pub fn generate_launch(config: &LocalConfig) -> CommandSpec {
    let mut spec = CommandSpec::new(&config.program)
        .args(&config.args)
        .env(PORT_ENV, config.port.to_string());
    if let Some(dir) = &config.workdir {
        spec = spec.current_dir(expand_path(dir));
    }
    spec
}

// ============================================================================
// SBIO: Deployer
// ============================================================================

/// Backend process started by `apply` and whether a binding owns it yet
#[derive(Debug, Default)]
struct Started {
    process: Option<ProcessHandle>,
    bound: bool,
}

pub struct LocalDeployer {
    ctx: DeployContext,
    config: LocalConfig,
    started: Mutex<Started>,
}

impl LocalDeployer {
    pub fn new(ctx: DeployContext, config: LocalConfig) -> Self {
        Self {
            ctx,
            config,
            started: Mutex::new(Started::default()),
        }
    }

    /// The backend process started by `apply`
    pub fn process(&self) -> Option<ProcessHandle> {
        self.started
            .lock()
            .ok()
            .and_then(|started| started.process.clone())
    }

    fn set_process(&self, process: ProcessHandle) {
        if let Ok(mut started) = self.started.lock() {
            *started = Started {
                process: Some(process),
                bound: false,
            };
        }
    }

    fn mark_bound(&self) {
        if let Ok(mut started) = self.started.lock() {
            started.bound = true;
        }
    }

    /// The started process, unless a binding already owns it
    fn unbound_process(&self) -> Option<ProcessHandle> {
        self.started.lock().ok().and_then(|mut started| {
            if started.bound {
                None
            } else {
                started.process.take()
            }
        })
    }
}

#[async_trait]
impl TargetDeployer for LocalDeployer {
    fn kind(&self) -> TargetKind {
        TargetKind::Local
    }

    async fn check_prerequisites(&self) -> Result<(), DeployError> {
        run_step(self.ctx.runner.as_ref(), &generate_program_check(&self.config))
            .await
            .map_err(|e| {
                DeployError::Configuration(format!("'{}' unavailable: {}", self.config.program, e))
            })?;
        self.ctx.check_credentials()
    }

    async fn build(&self) -> Result<(), DeployError> {
        let Some(spec) = generate_install(&self.config) else {
            return Ok(());
        };
        info!("Installing dependencies: {}", spec);
        run_step(self.ctx.runner.as_ref(), &spec)
            .await
            .map(|_| ())
            .map_err(DeployError::Build)
    }

    /// Stale processes on the port were released before this runs
    async fn apply(&self) -> Result<(), DeployError> {
        let spec = docker::with_env(generate_launch(&self.config), &self.ctx.backend_env());
        info!("Starting {}", spec);
        let process = self
            .ctx
            .runner
            .spawn(&spec)
            .await
            .map_err(|e| DeployError::DeployApply {
                target: TargetKind::Local,
                detail: e.to_string(),
            })?;
        info!("Backend process started: {}", process);
        self.set_process(process);
        Ok(())
    }

    async fn check_readiness(&self) -> ReadinessState {
        let state = probe_readiness(
            self.ctx.probe.as_ref(),
            &local_url(self.config.port),
            self.ctx.probe_timeout,
        )
        .await;
        if state == ReadinessState::Ready {
            return state;
        }
        match self.process() {
            Some(process) if !self.ctx.runner.is_alive(&process).await => {
                warn!("Backend {} exited before becoming healthy", process);
                ReadinessState::Failed
            }
            _ => ReadinessState::Pending,
        }
    }

    fn readiness_poller(&self) -> ReadinessPoller {
        ReadinessPoller::new(
            self.ctx.interval,
            Duration::from_secs(self.config.readiness_timeout_secs),
        )
    }

    fn exposed_ports(&self) -> Vec<u16> {
        vec![self.config.port]
    }

    async fn expose(&self, bindings: &mut BindingRegistry) -> Result<ReadyInfo, DeployError> {
        let mut request = BindingRequest::new(
            "app",
            self.config.port,
            format!("process:{}", self.config.program),
            TargetKind::Local,
        );
        if let Some(process) = self.process() {
            request = request.existing(process);
        }
        let binding = bindings.bind(request, self.ctx.runner.as_ref()).await?;
        self.mark_bound();
        Ok(ReadyInfo::new(binding.local_url()))
    }

    async fn abort(&self) {
        let Some(process) = self.unbound_process() else {
            return;
        };
        info!("Stopping backend {} after failed run", process);
        if let Err(e) = self.ctx.runner.terminate(&process).await {
            warn!("Failed to stop backend {}: {}", process, e);
        }
    }
}
