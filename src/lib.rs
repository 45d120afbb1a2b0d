pub mod cli;
pub mod client;
pub mod config;
pub mod deploy;
pub mod discovery;
pub mod exposure;
pub mod orchestrator;
pub mod probe;
pub mod readiness;
pub mod runtime;
