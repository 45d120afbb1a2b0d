//! Cleanup handler: the only place that gives local ports back.
//!
//! Every step is best effort. Failures become warnings in the report and
//! never fail the command, so cleanup can always be re-run.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{expand_path, DeployConfig};
use crate::deploy::run_step;
use crate::exposure::BindingRegistry;
use crate::runtime::{docker, kubectl, CommandRunner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Stop the compose stack if its file is present
    pub compose: bool,
    /// Delete the applied cluster manifests
    pub cluster: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub released: usize,
    pub compose_stopped: bool,
    pub manifests_deleted: usize,
    pub warnings: Vec<String>,
}

impl CleanupReport {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub async fn cleanup(
    bindings: &mut BindingRegistry,
    runner: &dyn CommandRunner,
    config: &DeployConfig,
    options: CleanupOptions,
) -> CleanupReport {
    let released = bindings.release_all(runner).await;
    let mut report = CleanupReport {
        released: released.released,
        ..Default::default()
    };
    if report.released > 0 {
        info!("Released {} port bindings", report.released);
    }
    for failure in released.failed {
        report.warn(failure.to_string());
    }

    if options.compose {
        let file = expand_path(&config.compose.file);
        if file.exists() {
            let spec = docker::generate_compose_down(&file, config.compose.project.as_deref());
            match run_step(runner, &spec).await {
                Ok(_) => report.compose_stopped = true,
                Err(e) => report.warn(format!("compose stack not stopped: {}", e)),
            }
        }
    }

    if options.cluster {
        let cluster = &config.cluster;
        let observability = cluster
            .observability
            .iter()
            .flat_map(|o| o.manifests.iter());
        // Reverse apply order
        let manifests: Vec<_> = cluster.manifests.iter().chain(observability).collect();
        for manifest in manifests.into_iter().rev() {
            let path = expand_path(manifest);
            if !path.exists() {
                continue;
            }
            match run_step(runner, &kubectl::generate_delete(&cluster.namespace, &path)).await {
                Ok(_) => report.manifests_deleted += 1,
                Err(e) => report.warn(format!("{} not deleted: {}", manifest.display(), e)),
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::TargetKind;
    use crate::exposure::BindingRequest;
    use crate::runtime::process::mock::MockRunner;
    use crate::runtime::CommandSpec;

    #[tokio::test]
    async fn test_cleanup_with_nothing_deployed() {
        let runner = MockRunner::new();
        let mut bindings = BindingRegistry::in_memory();
        let config = DeployConfig::default();
        let options = CleanupOptions {
            compose: true,
            cluster: true,
        };

        let first = cleanup(&mut bindings, &runner, &config, options).await;
        let second = cleanup(&mut bindings, &runner, &config, options).await;

        assert_eq!(first, CleanupReport::default());
        assert_eq!(second, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_cleanup_releases_tunnels() {
        let runner = MockRunner::new();
        let mut bindings = BindingRegistry::in_memory();
        bindings
            .bind(
                BindingRequest::new("app", 8080, "svc/app:80", TargetKind::Cluster)
                    .launch(CommandSpec::new("kubectl").arg("port-forward")),
                &runner,
            )
            .await
            .unwrap();

        let report = cleanup(
            &mut bindings,
            &runner,
            &DeployConfig::default(),
            CleanupOptions::default(),
        )
        .await;

        assert_eq!(report.released, 1);
        assert!(bindings.is_empty());
        assert_eq!(runner.running(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_reports_unstoppable_tunnel() {
        let runner = MockRunner::new();
        let mut bindings = BindingRegistry::in_memory();
        bindings
            .bind(
                BindingRequest::new("app", 8080, "svc/app:80", TargetKind::Cluster)
                    .launch(CommandSpec::new("kubectl").arg("port-forward")),
                &runner,
            )
            .await
            .unwrap();
        runner.refuse_termination(true);

        let report = cleanup(
            &mut bindings,
            &runner,
            &DeployConfig::default(),
            CleanupOptions::default(),
        )
        .await;

        assert_eq!(report.released, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("port 8080"));
        assert_eq!(bindings.len(), 1);
        assert_eq!(runner.running(), 1);

        // Re-running once the process can be stopped finishes the job
        runner.refuse_termination(false);
        let report = cleanup(
            &mut bindings,
            &runner,
            &DeployConfig::default(),
            CleanupOptions::default(),
        )
        .await;
        assert_eq!(report.released, 1);
        assert!(report.warnings.is_empty());
        assert!(bindings.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let compose = dir.path().join("docker-compose.yml");
        let manifest = dir.path().join("deployment.yaml");
        std::fs::write(&compose, "services: {}\n").unwrap();
        std::fs::write(&manifest, "kind: Deployment\n").unwrap();

        let mut config = DeployConfig::default();
        config.compose.file = compose;
        config.cluster.manifests = vec![manifest];
        config.cluster.observability = None;

        let runner = MockRunner::new();
        runner.fail("docker", &["compose"], "daemon not running");
        let mut bindings = BindingRegistry::in_memory();

        let report = cleanup(
            &mut bindings,
            &runner,
            &config,
            CleanupOptions {
                compose: true,
                cluster: true,
            },
        )
        .await;

        assert!(!report.compose_stopped);
        assert_eq!(report.manifests_deleted, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("daemon not running"));
    }
}
