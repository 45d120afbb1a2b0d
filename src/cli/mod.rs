//! CLI module for companion
//!
//! Deployment subcommands:
//! - `companion cluster` - Build, apply and port-forward to the cluster
//! - `companion compose` - Bring up the compose stack
//! - `companion local` - Run the backend as a local process
//! - `companion status` - Show bindings and probe every candidate endpoint
//! - `companion verify` - Health plus functional check against a backend
//! - `companion cleanup` - Release bindings and tear down what was started
//!
//! Client subcommands:
//! - `companion discover` - Find the reachable backend
//! - `companion chat` - Talk to the discovered backend

use clap::{ArgAction, Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "COMPANION_CONFIG";

#[derive(Parser, Debug)]
#[command(name = "companion")]
#[command(about = "Deploy the companion backend and find it again")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.companion/config.yaml)
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy to the Kubernetes cluster of the current kubectl context
    Cluster(DeployArgs),

    /// Deploy the docker compose stack
    Compose(DeployArgs),

    /// Run the backend as a local process
    Local(LocalArgs),

    /// Show active port bindings and candidate endpoint health
    Status,

    /// Check a running backend end to end
    Verify(VerifyArgs),

    /// Release port bindings and stop what was started
    Cleanup(CleanupArgs),

    /// Find the reachable backend among the candidate endpoints
    Discover(DiscoverArgs),

    /// Interactive conversation with the discovered backend
    Chat(ChatArgs),
}

/// Arguments shared by every deployment target
#[derive(Args, Debug, Clone, Default)]
pub struct DeployArgs {
    /// Reuse existing images / installed dependencies
    #[arg(long)]
    pub skip_build: bool,

    /// Readiness timeout in seconds (overrides the target default)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Bound on the whole run in seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub run_timeout: Option<u64>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LocalArgs {
    #[command(flatten)]
    pub deploy: DeployArgs,

    /// Leave the backend running and return once it is ready
    #[arg(short, long)]
    pub detach: bool,
}

impl Cli {
    /// Pick up the config path from an environment value read after the
    /// env file is loaded. `--config` and values set before launch win.
    pub fn resolve_config_env(&mut self, value: Option<OsString>) {
        if self.config.is_none() {
            self.config = value.filter(|v| !v.is_empty()).map(PathBuf::from);
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct VerifyArgs {
    /// Backend base URL (default: discover it)
    #[arg(long)]
    pub url: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CleanupArgs {
    /// Also delete the applied cluster manifests
    #[arg(long)]
    pub cluster: bool,

    /// Leave the compose stack running
    #[arg(long)]
    pub keep_compose: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct DiscoverArgs {
    /// Candidate URL to probe instead of the configured list (repeatable)
    #[arg(long = "candidate", value_name = "URL")]
    pub candidates: Vec<String>,

    /// Print the session as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ChatArgs {
    /// Satisfaction score (1-5) reported when the conversation ends
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    pub satisfaction: Option<u8>,
}
