//! kubectl command generation and output parsing

use std::path::Path;

use super::process::CommandSpec;
use crate::readiness::ReadinessState;

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// `kubectl cluster-info`: fails without a reachable API server
pub fn generate_cluster_info() -> CommandSpec {
    CommandSpec::new("kubectl").arg("cluster-info")
}

pub fn generate_get_namespace(namespace: &str) -> CommandSpec {
    CommandSpec::new("kubectl").args(["get", "namespace", namespace])
}

pub fn generate_create_namespace(namespace: &str) -> CommandSpec {
    CommandSpec::new("kubectl").args(["create", "namespace", namespace])
}

pub fn generate_delete_secret(namespace: &str, name: &str) -> CommandSpec {
    CommandSpec::new("kubectl").args([
        "delete",
        "secret",
        name,
        "-n",
        namespace,
        "--ignore-not-found",
    ])
}

/// Create a generic secret from a file. The file is handed to kubectl as-is.
pub fn generate_create_secret_from_file(
    namespace: &str,
    name: &str,
    key: &str,
    file: &Path,
) -> CommandSpec {
    CommandSpec::new("kubectl").args([
        "create".to_string(),
        "secret".to_string(),
        "generic".to_string(),
        name.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        format!("--from-file={}={}", key, file.display()),
    ])
}

pub fn generate_apply(namespace: &str, manifest: &Path) -> CommandSpec {
    CommandSpec::new("kubectl").args([
        "apply".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "-f".to_string(),
        manifest.display().to_string(),
    ])
}

pub fn generate_delete(namespace: &str, manifest: &Path) -> CommandSpec {
    CommandSpec::new("kubectl").args([
        "delete".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "-f".to_string(),
        manifest.display().to_string(),
        "--ignore-not-found".to_string(),
    ])
}

/// Reason kubelet records on pods it evicted
const EVICTED_REASON: &str = "Evicted";

/// One `<phase> <reason>` line per unfinished pod matching a label selector
pub fn generate_pod_phases(namespace: &str, selector: &str) -> CommandSpec {
    CommandSpec::new("kubectl").args([
        "get",
        "pods",
        "-n",
        namespace,
        "-l",
        selector,
        "--field-selector=status.phase!=Succeeded",
        "-o",
        r#"jsonpath={range .items[*]}{.status.phase}{" "}{.status.reason}{"\n"}{end}"#,
    ])
}

/// Long-lived local-to-cluster tunnel for one service
pub fn generate_port_forward(
    namespace: &str,
    service: &str,
    local_port: u16,
    remote_port: u16,
) -> CommandSpec {
    CommandSpec::new("kubectl").args([
        "port-forward".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        format!("svc/{}", service),
        format!("{}:{}", local_port, remote_port),
    ])
}

/// Map `generate_pod_phases` output onto a readiness state.
///
/// No pods yet is Pending. Evicted pods are leftovers of earlier rollouts and
/// do not count. Any other Failed pod fails the rollout; every pod Running is
/// Ready.
pub fn phases_to_readiness(output: &str) -> ReadinessState {
    let phases: Vec<&str> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let phase = fields.next()?;
            if phase == "Succeeded" || fields.next() == Some(EVICTED_REASON) {
                return None;
            }
            Some(phase)
        })
        .collect();

    if phases.is_empty() {
        return ReadinessState::Pending;
    }
    if phases.iter().any(|p| *p == "Failed") {
        return ReadinessState::Failed;
    }
    if phases.iter().all(|p| *p == "Running") {
        return ReadinessState::Ready;
    }
    ReadinessState::Pending
}
