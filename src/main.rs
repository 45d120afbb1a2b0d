use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use companion_deploy::cli::{execute, Cli, CONFIG_ENV};

#[tokio::main]
async fn main() {
    let mut cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
        // The env file may name the config file itself
        cli.resolve_config_env(std::env::var_os(CONFIG_ENV));
    }

    match execute(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
