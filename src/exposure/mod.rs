//! Port bindings
//!
//! Everything that makes a deployment reachable from a fixed local port is
//! recorded here: cluster tunnels, compose host-port mappings and the local
//! app process. The registry is keyed by local port, persisted between CLI
//! invocations, and is the only place processes are looked up for release.
//!
//! Binding a port that is already bound releases the previous binding first,
//! so repeated exposure converges on exactly one binding per port.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::deploy::TargetKind;
use crate::readiness::ReadinessState;
use crate::runtime::{CommandRunner, CommandSpec, ProcessHandle};

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Failed to start '{name}' binding on port {port}: {detail}")]
    Spawn {
        name: String,
        port: u16,
        detail: String,
    },

    #[error("Failed to stop '{name}' binding on port {port} ({process}): {detail}")]
    Release {
        name: String,
        port: u16,
        process: ProcessHandle,
        detail: String,
    },

    #[error("'{name}' binding on port {port} did not come up ({state})")]
    Unreachable {
        name: String,
        port: u16,
        state: ReadinessState,
    },

    #[error("Binding registry IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Binding registry is corrupt: {0}")]
    Parse(String),
}

/// An active exposure of a deployed service on a local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Logical name (app, prometheus, ...)
    pub name: String,
    pub local_port: u16,
    /// What the port reaches: `svc/name:80`, a compose service, a process
    pub remote: String,
    pub target: TargetKind,
    /// Owning process, if the binding is held open by one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessHandle>,
    pub created_at: DateTime<Utc>,
}

impl PortBinding {
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }
}

/// How a requested binding is held open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingProcess {
    /// Static mapping, nothing to run
    None,
    /// Start this command in the background (tunnels)
    Launch(CommandSpec),
    /// Adopt an already running process
    Existing(ProcessHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRequest {
    pub name: String,
    pub local_port: u16,
    pub remote: String,
    pub target: TargetKind,
    pub process: BindingProcess,
}

impl BindingRequest {
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote: impl Into<String>,
        target: TargetKind,
    ) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote: remote.into(),
            target,
            process: BindingProcess::None,
        }
    }

    pub fn launch(mut self, spec: CommandSpec) -> Self {
        self.process = BindingProcess::Launch(spec);
        self
    }

    pub fn existing(mut self, process: ProcessHandle) -> Self {
        self.process = BindingProcess::Existing(process);
        self
    }
}

/// What a batch release managed to give back
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: usize,
    /// Bindings whose process could not be stopped; they stay registered
    pub failed: Vec<BindingError>,
}

/// Registry of active bindings, optionally persisted as JSON
#[derive(Debug, Default)]
pub struct BindingRegistry {
    path: Option<PathBuf>,
    bindings: BTreeMap<u16, PortBinding>,
}

impl BindingRegistry {
    /// Registry that lives only as long as this process
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the registry persisted at `path`; a missing file is empty
    pub fn load(path: &Path) -> Result<Self, BindingError> {
        let bindings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            parse_bindings(&content)?
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} bindings from {}", bindings.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            bindings,
        })
    }

    pub fn save(&self) -> Result<(), BindingError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let list: Vec<&PortBinding> = self.bindings.values().collect();
        let content =
            serde_json::to_string_pretty(&list).map_err(|e| BindingError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn get(&self, local_port: u16) -> Option<&PortBinding> {
        self.bindings.get(&local_port)
    }

    pub fn by_name(&self, name: &str) -> Option<&PortBinding> {
        self.bindings.values().find(|b| b.name == name)
    }

    pub fn list(&self) -> Vec<&PortBinding> {
        self.bindings.values().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Create a binding, replacing whatever held the same port or name before.
    /// Fails if a previous holder cannot be stopped.
    pub async fn bind(
        &mut self,
        request: BindingRequest,
        runner: &dyn CommandRunner,
    ) -> Result<PortBinding, BindingError> {
        let adopted = match &request.process {
            BindingProcess::Existing(process) => Some(process.clone()),
            _ => None,
        };

        // Stale binding on the port: kill-and-recreate, unless it is the very
        // process being adopted
        if let Some(previous) = self.bindings.get(&request.local_port) {
            if adopted.is_some() && previous.process == adopted {
                debug!("Port {} already held by {:?}", request.local_port, adopted);
                self.bindings.remove(&request.local_port);
            } else {
                info!(
                    "Replacing existing '{}' binding on port {}",
                    previous.name, request.local_port
                );
                self.release(request.local_port, runner).await?;
            }
        }

        // Same logical binding moved to another port
        let moved: Vec<u16> = self
            .bindings
            .values()
            .filter(|b| b.name == request.name && b.target == request.target)
            .map(|b| b.local_port)
            .collect();
        for port in moved {
            self.release(port, runner).await?;
        }

        let process = match request.process {
            BindingProcess::None => None,
            BindingProcess::Existing(process) => Some(process),
            BindingProcess::Launch(spec) => {
                let process = runner.spawn(&spec).await.map_err(|e| BindingError::Spawn {
                    name: request.name.clone(),
                    port: request.local_port,
                    detail: e.to_string(),
                })?;
                Some(process)
            }
        };

        let binding = PortBinding {
            name: request.name,
            local_port: request.local_port,
            remote: request.remote,
            target: request.target,
            process,
            created_at: Utc::now(),
        };
        info!(
            "Bound {} -> {} ({})",
            binding.local_url(),
            binding.remote,
            binding.name
        );
        self.bindings.insert(binding.local_port, binding.clone());
        self.save()?;
        Ok(binding)
    }

    /// Release one binding. Unknown ports are a no-op.
    ///
    /// The binding is only forgotten once its process is gone; if it cannot
    /// be stopped it stays registered so a later cleanup can retry.
    pub async fn release(
        &mut self,
        local_port: u16,
        runner: &dyn CommandRunner,
    ) -> Result<Option<PortBinding>, BindingError> {
        let Some(binding) = self.bindings.get(&local_port) else {
            return Ok(None);
        };

        if let Some(process) = &binding.process {
            if runner.is_alive(process).await {
                runner
                    .terminate(process)
                    .await
                    .map_err(|e| BindingError::Release {
                        name: binding.name.clone(),
                        port: local_port,
                        process: process.clone(),
                        detail: e.to_string(),
                    })?;
            } else {
                debug!("{} for '{}' already gone", process, binding.name);
            }
        }

        let binding = self.bindings.remove(&local_port);
        if let Err(e) = self.save() {
            warn!("Failed to persist binding registry: {}", e);
        }
        if let Some(binding) = &binding {
            info!("Released '{}' binding on port {}", binding.name, local_port);
        }
        Ok(binding)
    }

    /// Release any bindings on the given ports, carrying on past failures
    pub async fn release_ports(
        &mut self,
        ports: &[u16],
        runner: &dyn CommandRunner,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for port in ports {
            match self.release(*port, runner).await {
                Ok(Some(_)) => report.released += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!("{}", e);
                    report.failed.push(e);
                }
            }
        }
        report
    }

    /// Release everything. Safe to call on an empty registry.
    pub async fn release_all(&mut self, runner: &dyn CommandRunner) -> ReleaseReport {
        let ports: Vec<u16> = self.bindings.keys().copied().collect();
        self.release_ports(&ports, runner).await
    }
}

// ============================================================================
// SBIO: Pure parsing
// ============================================================================

fn parse_bindings(content: &str) -> Result<BTreeMap<u16, PortBinding>, BindingError> {
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let list: Vec<PortBinding> =
        serde_json::from_str(content).map_err(|e| BindingError::Parse(e.to_string()))?;
    Ok(list.into_iter().map(|b| (b.local_port, b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::kubectl::generate_port_forward;
    use crate::runtime::process::mock::MockRunner;

    fn tunnel_request() -> BindingRequest {
        BindingRequest::new("app", 8080, "svc/mental-health-app-service:80", TargetKind::Cluster)
            .launch(generate_port_forward("mental-health", "mental-health-app-service", 8080, 80))
    }

    #[tokio::test]
    async fn test_bind_spawns_tunnel() {
        let runner = MockRunner::new();
        let mut registry = BindingRegistry::in_memory();

        let binding = registry.bind(tunnel_request(), &runner).await.unwrap();

        assert_eq!(binding.local_port, 8080);
        assert_eq!(binding.process.as_ref().unwrap().program, "kubectl");
        assert_eq!(registry.len(), 1);
        assert_eq!(runner.spawned().len(), 1);
        assert_eq!(binding.local_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_bind_twice_leaves_one_binding() {
        let runner = MockRunner::new();
        let mut registry = BindingRegistry::in_memory();

        let first = registry.bind(tunnel_request(), &runner).await.unwrap();
        let second = registry.bind(tunnel_request(), &runner).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_ne!(first.pid(), second.pid());
        assert_eq!(runner.terminated(), vec![first.pid().unwrap()]);
        assert_eq!(runner.running(), 1);
        assert_eq!(registry.get(8080).unwrap().pid(), second.pid());
    }

    #[tokio::test]
    async fn test_bind_moved_port_releases_old() {
        let runner = MockRunner::new();
        let mut registry = BindingRegistry::in_memory();

        registry.bind(tunnel_request(), &runner).await.unwrap();
        let moved = BindingRequest::new("app", 8081, "svc/x:80", TargetKind::Cluster)
            .launch(generate_port_forward("ns", "x", 8081, 80));
        registry.bind(moved, &runner).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get(8080).is_none());
        assert_eq!(registry.by_name("app").unwrap().local_port, 8081);
    }

    #[tokio::test]
    async fn test_adopting_same_pid_does_not_kill_it() {
        let runner = MockRunner::new();
        runner.mark_alive(4242);
        let backend = ProcessHandle::new(4242, "python");
        let mut registry = BindingRegistry::in_memory();

        let request = BindingRequest::new("app", 8000, "python app.py", TargetKind::Local)
            .existing(backend.clone());
        registry.bind(request.clone(), &runner).await.unwrap();
        registry.bind(request, &runner).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert!(runner.terminated().is_empty());
        assert!(runner.is_alive(&backend).await);
    }

    #[tokio::test]
    async fn test_release_all_on_empty_registry() {
        let runner = MockRunner::new();
        let mut registry = BindingRegistry::in_memory();
        let report = registry.release_all(&runner).await;
        assert_eq!(report.released, 0);
        assert!(report.failed.is_empty());
        assert!(registry.release(8080, &runner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_skips_dead_process() {
        let runner = MockRunner::new();
        let mut registry = BindingRegistry::in_memory();
        let binding = registry.bind(tunnel_request(), &runner).await.unwrap();
        runner.mark_exited(binding.pid().unwrap());

        assert!(registry.release(8080, &runner).await.unwrap().is_some());
        assert!(runner.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_unstoppable_process_stays_registered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");
        let runner = MockRunner::new();
        let mut registry = BindingRegistry::load(&path).unwrap();
        let binding = registry.bind(tunnel_request(), &runner).await.unwrap();
        runner.refuse_termination(true);

        let err = registry.release(8080, &runner).await.unwrap_err();
        assert!(matches!(err, BindingError::Release { port: 8080, .. }));
        assert_eq!(registry.get(8080).unwrap().pid(), binding.pid());
        assert_eq!(BindingRegistry::load(&path).unwrap().len(), 1);

        let report = registry.release_all(&runner).await;
        assert_eq!(report.released, 0);
        assert_eq!(report.failed.len(), 1);

        // Rebinding cannot take over a port whose holder survives
        assert!(registry.bind(tunnel_request(), &runner).await.is_err());
        assert_eq!(runner.spawned().len(), 1);

        runner.refuse_termination(false);
        assert_eq!(registry.release_all(&runner).await.released, 1);
        assert!(registry.is_empty());
        assert_eq!(runner.running(), 0);
    }

    #[tokio::test]
    async fn test_registry_persists_between_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("bindings.json");
        let runner = MockRunner::new();

        let mut registry = BindingRegistry::load(&path).unwrap();
        assert!(registry.is_empty());
        registry.bind(tunnel_request(), &runner).await.unwrap();
        registry
            .bind(
                BindingRequest::new("grafana", 3000, "grafana:3000", TargetKind::Compose),
                &runner,
            )
            .await
            .unwrap();

        let mut reloaded = BindingRegistry::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.get(3000).unwrap().process.is_none());
        assert_eq!(
            reloaded.get(8080).unwrap().process.as_ref().unwrap().program,
            "kubectl"
        );

        assert_eq!(reloaded.release_all(&runner).await.released, 2);
        assert!(BindingRegistry::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_parse_corrupt_registry() {
        assert!(matches!(
            parse_bindings("{not json"),
            Err(BindingError::Parse(_))
        ));
        assert!(parse_bindings("  ").unwrap().is_empty());
    }
}
