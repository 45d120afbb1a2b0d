//! Docker and Docker Compose command generation
//!
//! Pure builders for the `docker` invocations used by the cluster (image
//! build) and compose (stack lifecycle) targets.

use std::path::Path;

use super::process::CommandSpec;

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// `docker version`: fails when the daemon is unreachable
pub fn generate_version_check() -> CommandSpec {
    CommandSpec::new("docker").args(["version", "--format", "{{.Server.Version}}"])
}

/// Generate Docker build arguments
pub fn generate_build(dockerfile: &Path, context: &Path, image: &str) -> CommandSpec {
    CommandSpec::new("docker").args([
        "build".to_string(),
        "-f".to_string(),
        dockerfile.display().to_string(),
        "-t".to_string(),
        image.to_string(),
        context.display().to_string(),
    ])
}

/// `docker compose version`: the compose plugin must be installed
pub fn generate_compose_version_check() -> CommandSpec {
    CommandSpec::new("docker").args(["compose", "version"])
}

fn compose_base(file: &Path, project: Option<&str>) -> CommandSpec {
    let mut spec = CommandSpec::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(file.display().to_string());
    if let Some(project) = project {
        spec = spec.arg("-p").arg(project);
    }
    spec
}

/// Build every service image declared in the stack
pub fn generate_compose_build(file: &Path, project: Option<&str>) -> CommandSpec {
    compose_base(file, project).arg("build")
}

/// Bring the stack up detached. Re-running converges: unchanged containers are
/// reused, changed ones recreated.
pub fn generate_compose_up(file: &Path, project: Option<&str>) -> CommandSpec {
    compose_base(file, project).args(["up", "-d", "--remove-orphans"])
}

/// Tear the stack down. Succeeds when nothing is running.
pub fn generate_compose_down(file: &Path, project: Option<&str>) -> CommandSpec {
    compose_base(file, project).args(["down", "--remove-orphans"])
}

/// Apply opaque environment entries (credential path, project id) to a command
pub fn with_env<'a, I>(mut spec: CommandSpec, env: I) -> CommandSpec
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    for (key, value) in env {
        spec = spec.env(key.clone(), value.clone());
    }
    spec
}
