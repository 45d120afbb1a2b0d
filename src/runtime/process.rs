//! External process execution
//!
//! Every deployer talks to `docker`, `kubectl` and the local app process through
//! the [`CommandRunner`] trait so the orchestration logic can be exercised
//! without touching the host.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Errors that can occur while running external commands
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn '{program}': {detail}")]
    Spawn { program: String, detail: String },

    #[error("Failed to signal process {pid} ({program}): {detail}")]
    Signal {
        pid: u32,
        program: String,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// A fully described command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Does this invocation start with the given program and argument prefix?
    pub fn matches(&self, program: &str, prefix: &[&str]) -> bool {
        self.program == program
            && self.args.len() >= prefix.len()
            && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A background process started by a [`CommandRunner`].
///
/// The program name travels with the pid so a recycled pid is never mistaken
/// for the process that was started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub program: String,
}

impl ProcessHandle {
    pub fn new(pid: u32, program: impl Into<String>) -> Self {
        Self {
            pid,
            program: program.into(),
        }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.program, self.pid)
    }
}

/// Does a process table entry belong to `program`?
///
/// Kernel process names are truncated (15 bytes on Linux), so the first
/// command-line word is checked as well.
pub fn process_matches(program: &str, name: &str, cmd: &[String]) -> bool {
    let expected = file_name(program);
    if expected.is_empty() {
        return false;
    }
    if name == expected || (name.len() >= 15 && expected.starts_with(name)) {
        return true;
    }
    cmd.first().is_some_and(|first| file_name(first) == expected)
}

fn file_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Human-readable failure detail: stderr if present, else stdout, else exit code
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;

    /// Start a long-lived background process.
    /// The process is not tied to the caller's lifetime.
    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, RunnerError>;

    /// Ask a process to terminate. A process that is gone, or whose pid now
    /// belongs to another program, is left alone.
    async fn terminate(&self, process: &ProcessHandle) -> Result<(), RunnerError>;

    /// Whether the process is still running as the program it was started from
    async fn is_alive(&self, process: &ProcessHandle) -> bool;
}

// ============================================================================
// SBIO: I/O implementation (host processes)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        debug!("Running: {}", spec);

        let output = Self::command(spec)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RunnerError::Spawn {
                program: spec.program.clone(),
                detail: e.to_string(),
            })?;

        let result = CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!("'{}' finished: success={}", spec.program, result.success);
        Ok(result)
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, RunnerError> {
        debug!("Spawning: {}", spec);

        let child = Self::command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                program: spec.program.clone(),
                detail: e.to_string(),
            })?;

        // Dropping the handle leaves the process running (no kill_on_drop)
        let pid = child.id().ok_or_else(|| RunnerError::Spawn {
            program: spec.program.clone(),
            detail: "process exited before reporting a pid".to_string(),
        })?;
        Ok(ProcessHandle::new(pid, spec.program.clone()))
    }

    async fn terminate(&self, process: &ProcessHandle) -> Result<(), RunnerError> {
        let system = process_table(process.pid);
        let Some(entry) = owned_process(&system, process) else {
            debug!("{} not running, nothing to stop", process);
            return Ok(());
        };

        let delivered = entry
            .kill_with(Signal::Term)
            .unwrap_or_else(|| entry.kill());
        if !delivered {
            return Err(RunnerError::Signal {
                pid: process.pid,
                program: process.program.clone(),
                detail: "signal not delivered".to_string(),
            });
        }
        debug!("Sent SIGTERM to {}", process);
        Ok(())
    }

    async fn is_alive(&self, process: &ProcessHandle) -> bool {
        let system = process_table(process.pid);
        owned_process(&system, process)
            .is_some_and(|entry| !matches!(entry.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }
}

/// Snapshot of a single process table entry
fn process_table(pid: u32) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::everything(),
    );
    system
}

/// The entry for `process.pid`, if it still runs the recorded program
fn owned_process<'a>(system: &'a System, process: &ProcessHandle) -> Option<&'a Process> {
    let entry = system.process(Pid::from_u32(process.pid))?;
    let name = entry.name().to_string_lossy();
    let cmd: Vec<String> = entry
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    if process_matches(&process.program, &name, &cmd) {
        Some(entry)
    } else {
        warn!(
            "pid {} now belongs to '{}', not '{}'; leaving it alone",
            process.pid, name, process.program
        );
        None
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("kubectl").args(["get", "pods"]).arg("-A");
        assert_eq!(spec.to_string(), "kubectl get pods -A");
    }

    #[test]
    fn test_command_spec_matches_prefix() {
        let spec = CommandSpec::new("docker").args(["compose", "-f", "x.yml", "up"]);
        assert!(spec.matches("docker", &["compose"]));
        assert!(spec.matches("docker", &[]));
        assert!(!spec.matches("docker", &["build"]));
        assert!(!spec.matches("kubectl", &["compose"]));
    }

    #[test]
    fn test_failure_detail_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            code: Some(2),
            stdout: "some stdout".to_string(),
            stderr: "  boom \n".to_string(),
        };
        assert_eq!(out.failure_detail(), "boom");

        let out = CommandOutput {
            success: false,
            code: Some(2),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(out.failure_detail(), "exited with status 2");
    }

    #[tokio::test]
    async fn test_mock_runner_rules() {
        let runner = mock::MockRunner::new();
        runner.fail("kubectl", &["cluster-info"], "connection refused");

        let out = runner
            .run(&CommandSpec::new("kubectl").arg("cluster-info"))
            .await
            .unwrap();
        assert!(!out.success);

        let out = runner
            .run(&CommandSpec::new("kubectl").args(["get", "pods"]))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_runner_process_lifecycle() {
        let runner = mock::MockRunner::new();
        let process = runner.spawn(&CommandSpec::new("sleep").arg("100")).await.unwrap();
        assert_eq!(process.program, "sleep");
        assert!(runner.is_alive(&process).await);
        runner.terminate(&process).await.unwrap();
        assert!(!runner.is_alive(&process).await);
        assert_eq!(runner.terminated(), vec![process.pid]);
    }

    #[tokio::test]
    async fn test_mock_runner_refused_termination() {
        let runner = mock::MockRunner::new();
        let process = runner.spawn(&CommandSpec::new("kubectl")).await.unwrap();
        runner.refuse_termination(true);

        let err = runner.terminate(&process).await.unwrap_err();
        assert!(matches!(err, RunnerError::Signal { pid, .. } if pid == process.pid));
        assert!(runner.is_alive(&process).await);
        assert!(runner.terminated().is_empty());
    }

    #[test]
    fn test_process_matches_program() {
        let cmd = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        assert!(process_matches("kubectl", "kubectl", &cmd(&["kubectl", "port-forward"])));
        assert!(process_matches("/usr/bin/python3", "python3", &[]));
        // Kernel-truncated name, full program in the command line
        assert!(process_matches(
            "companion-backend-server",
            "companion-backe",
            &cmd(&["/opt/bin/companion-backend-server"])
        ));
        assert!(process_matches("python", "python3.11", &cmd(&["python", "app.py"])));

        // Recycled pid running something else
        assert!(!process_matches("kubectl", "bash", &cmd(&["-bash"])));
        assert!(!process_matches("sleep", "firefox", &cmd(&["/usr/lib/firefox/firefox"])));
    }

    #[tokio::test]
    async fn test_system_runner_ignores_foreign_pid() {
        let runner = SystemRunner::new();
        // Our own pid runs the test binary, never `kubectl`
        let foreign = ProcessHandle::new(std::process::id(), "kubectl");
        assert!(!runner.is_alive(&foreign).await);
        runner.terminate(&foreign).await.unwrap();
    }

    #[tokio::test]
    async fn test_system_runner_spawn_and_terminate() {
        let runner = SystemRunner::new();
        let process = runner
            .spawn(&CommandSpec::new("sleep").arg("30"))
            .await
            .unwrap();
        assert!(runner.is_alive(&process).await);

        runner.terminate(&process).await.unwrap();
        let mut stopped = false;
        for _ in 0..50 {
            if !runner.is_alive(&process).await {
                stopped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_system_runner_reports_missing_program() {
        let runner = SystemRunner::new();
        let result = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
