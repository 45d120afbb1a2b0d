//! Command implementations for the CLI
//!
//! Each handler returns the process exit code; errors carry anyhow context for
//! the user. Only this layer decides exit status.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::display::{
    format_bindings, format_cleanup_report, format_probe_results, format_run_report,
    format_session, format_verification,
};
use super::{ChatArgs, CleanupArgs, Cli, Commands, DeployArgs, DiscoverArgs, VerifyArgs};
use crate::client::{ChatClient, HttpBackend};
use crate::config::{self, DeployConfig, DiscoveryConfig};
use crate::deploy::{DeploymentTarget, TargetKind};
use crate::discovery::{CandidateEndpoint, DiscoveryEngine};
use crate::exposure::BindingRegistry;
use crate::orchestrator::{
    cleanup, verify_endpoint, CleanupOptions, Orchestrator, Verification,
};
use crate::probe::{HealthProbe, HttpProbe};
use crate::runtime::SystemRunner;

/// Exit code for Ready (verified or not) and for informational commands
pub const EXIT_OK: i32 = 0;
/// Exit code for a failed run
pub const EXIT_FAILED: i32 = 1;

// ============================================================================
// Pure helpers
// ============================================================================

/// Resolve the config file: explicit path, else the default location
pub fn load_config_for(path: Option<&Path>) -> Result<DeployConfig> {
    match path {
        Some(path) => config::load_config_from(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => config::load_config().context("Failed to load config"),
    }
}

/// Apply a readiness timeout override from the command line
pub fn apply_overrides(target: DeploymentTarget, args: &DeployArgs) -> DeploymentTarget {
    let Some(secs) = args.timeout else {
        return target;
    };
    match target {
        DeploymentTarget::Cluster(mut c) => {
            c.readiness_timeout_secs = secs;
            DeploymentTarget::Cluster(c)
        }
        DeploymentTarget::Compose(mut c) => {
            c.readiness_timeout_secs = secs;
            DeploymentTarget::Compose(c)
        }
        DeploymentTarget::Local(mut c) => {
            c.readiness_timeout_secs = secs;
            DeploymentTarget::Local(c)
        }
    }
}

/// Candidate list: command-line overrides win over the configured order
pub fn candidates_for(config: &DiscoveryConfig, overrides: &[String]) -> Vec<CandidateEndpoint> {
    if overrides.is_empty() {
        config.candidates.clone()
    } else {
        overrides
            .iter()
            .map(|url| CandidateEndpoint::new(url.clone(), "command-line"))
            .collect()
    }
}

pub fn discovery_engine(
    config: &DiscoveryConfig,
    probe: Arc<dyn HealthProbe>,
    candidates: Vec<CandidateEndpoint>,
) -> DiscoveryEngine {
    DiscoveryEngine::new(probe, candidates)
        .with_probe_timeout(config.probe_timeout())
        .with_backoff(config.backoff())
        .with_max_rediscovery_attempts(config.max_rediscovery_attempts)
}

fn http_backend(config: &DeployConfig) -> HttpBackend {
    HttpBackend::new().with_timeout(config.discovery.request_timeout())
}

fn open_registry(config: &DeployConfig) -> Result<BindingRegistry> {
    let path = config.bindings_path();
    BindingRegistry::load(&path)
        .with_context(|| format!("Failed to open binding registry {}", path.display()))
}

// ============================================================================
// Dispatch
// ============================================================================

pub async fn execute(cli: Cli) -> Result<i32> {
    let config = load_config_for(cli.config.as_deref())?;

    match cli.command {
        Commands::Cluster(args) => deploy(&config, TargetKind::Cluster, &args, true).await,
        Commands::Compose(args) => deploy(&config, TargetKind::Compose, &args, true).await,
        Commands::Local(args) => deploy(&config, TargetKind::Local, &args.deploy, args.detach).await,
        Commands::Status => status(&config).await,
        Commands::Verify(args) => verify(&config, &args).await,
        Commands::Cleanup(args) => cleanup_command(&config, &args).await,
        Commands::Discover(args) => discover(&config, &args).await,
        Commands::Chat(args) => chat(&config, &args).await,
    }
}

// ============================================================================
// Deployment commands
// ============================================================================

pub async fn deploy(
    config: &DeployConfig,
    kind: TargetKind,
    args: &DeployArgs,
    detach: bool,
) -> Result<i32> {
    let target = apply_overrides(config.target(kind), args);
    let bindings = open_registry(config)?;

    let mut orchestrator = Orchestrator::new(
        Arc::new(SystemRunner::new()),
        Arc::new(HttpProbe::new()),
        Arc::new(http_backend(config)),
        bindings,
    )
    .configured(config)
    .skip_build(args.skip_build);
    if let Some(secs) = args.run_timeout {
        orchestrator = orchestrator.with_run_timeout(Duration::from_secs(secs));
    }

    let report = match orchestrator.run(&target).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(EXIT_FAILED);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_run_report(&report));
    }

    if !detach {
        println!("Backend running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        let runner = orchestrator.runner().clone();
        let released = orchestrator
            .bindings_mut()
            .release_ports(&[config.local.port], runner.as_ref())
            .await;
        if released.failed.is_empty() {
            info!("Stopped backend");
        } else {
            eprintln!("Backend may still be running; `companion cleanup` retries");
            return Ok(EXIT_FAILED);
        }
    }

    Ok(EXIT_OK)
}

pub async fn status(config: &DeployConfig) -> Result<i32> {
    let bindings = open_registry(config)?;
    println!("Port bindings:");
    print!("{}", format_bindings(&bindings.list()));

    let probe = HttpProbe::new();
    let timeout = config.discovery.probe_timeout();
    let mut results = Vec::new();
    for candidate in &config.discovery.candidates {
        let result = probe.probe(&candidate.url, timeout).await;
        results.push((candidate.clone(), result));
    }
    println!("\nCandidate endpoints:");
    print!("{}", format_probe_results(&results));

    Ok(EXIT_OK)
}

pub async fn verify(config: &DeployConfig, args: &VerifyArgs) -> Result<i32> {
    let probe: Arc<dyn HealthProbe> = Arc::new(HttpProbe::new());

    let url = match &args.url {
        Some(url) => url.clone(),
        None => {
            let mut engine = discovery_engine(
                &config.discovery,
                probe.clone(),
                config.discovery.candidates.clone(),
            );
            let session = engine.discover().await;
            match session.base_url() {
                Some(url) => url.to_string(),
                None => {
                    print!("{}", format_session(session));
                    return Ok(EXIT_FAILED);
                }
            }
        }
    };

    let verification = verify_endpoint(
        probe.as_ref(),
        &http_backend(config),
        &url,
        config.discovery.probe_timeout(),
    )
    .await;
    print!("{}", format_verification(&verification));

    Ok(match verification {
        Verification::Verified => EXIT_OK,
        Verification::Unverified(_) => EXIT_FAILED,
    })
}

/// Never fails: every problem is reported as a warning
pub async fn cleanup_command(config: &DeployConfig, args: &CleanupArgs) -> Result<i32> {
    let mut bindings = match open_registry(config) {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!("{:#}; continuing without recorded bindings", e);
            BindingRegistry::in_memory()
        }
    };

    let runner = SystemRunner::new();
    let options = CleanupOptions {
        compose: !args.keep_compose,
        cluster: args.cluster,
    };
    let report = cleanup(&mut bindings, &runner, config, options).await;
    print!("{}", format_cleanup_report(&report));

    Ok(EXIT_OK)
}

// ============================================================================
// Client commands
// ============================================================================

pub async fn discover(config: &DeployConfig, args: &DiscoverArgs) -> Result<i32> {
    let candidates = candidates_for(&config.discovery, &args.candidates);
    let mut engine = discovery_engine(&config.discovery, Arc::new(HttpProbe::new()), candidates);
    let session = engine.discover().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(session)?);
    } else {
        print!("{}", format_session(session));
    }

    Ok(if session.is_connected() {
        EXIT_OK
    } else {
        EXIT_FAILED
    })
}

/// Line-oriented conversation. `exit` or end of input ends it.
pub async fn chat(config: &DeployConfig, args: &ChatArgs) -> Result<i32> {
    let engine = discovery_engine(
        &config.discovery,
        Arc::new(HttpProbe::new()),
        config.discovery.candidates.clone(),
    );
    let mut client = ChatClient::new(engine, Arc::new(http_backend(config)));

    println!("Session {}. Type 'exit' to end the conversation.", client.session_id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt.eq_ignore_ascii_case("exit") || prompt.eq_ignore_ascii_case("quit") {
            break;
        }

        match client.send(prompt).await {
            Ok(reply) => println!("{}\n", reply.response),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    if let Err(e) = client.end(args.satisfaction).await {
        warn!("Failed to end conversation: {}", e);
    }
    Ok(EXIT_OK)
}
