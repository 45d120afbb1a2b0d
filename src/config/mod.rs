//! Deployment configuration
//!
//! Loaded from `~/.companion/config.yaml` (or `--config`). Every field has a
//! default matching the stock repository layout, so a missing file is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::{DeploymentTarget, TargetKind};
use crate::discovery::{default_candidates, CandidateEndpoint};

/// Default config file location: ~/.companion/config.yaml
pub fn default_config_path() -> PathBuf {
    companion_home().join("config.yaml")
}

/// Default directory for the persisted binding registry
pub fn default_state_dir() -> PathBuf {
    companion_home().join("state")
}

fn companion_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".companion")
}

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

/// Errors for loading and validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub compose: ComposeConfig,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Upper bound for a whole deployment run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Where the binding registry lives (default: ~/.companion/state)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            cluster: ClusterConfig::default(),
            compose: ComposeConfig::default(),
            local: LocalConfig::default(),
            readiness: ReadinessConfig::default(),
            run_timeout_secs: default_run_timeout_secs(),
            discovery: DiscoveryConfig::default(),
            state_dir: None,
        }
    }
}

/// Settings shared by every target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Application name, used for image and container naming
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Image tag produced by the build stage
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,

    /// Build context directory
    #[serde(default = "default_context")]
    pub context: PathBuf,

    /// Service-account file handed to the target untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,

    /// Extra environment for the backend (project id, region...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            image: default_image(),
            dockerfile: default_dockerfile(),
            context: default_context(),
            credentials_file: None,
            env: BTreeMap::new(),
        }
    }
}

/// A cluster service exposed through a local tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceForward {
    pub name: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ServiceForward {
    pub fn new(name: &str, service: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            local_port,
            remote_port,
        }
    }
}

/// Optional monitoring stack deployed next to the app
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub manifests: Vec<PathBuf>,

    #[serde(default)]
    pub forwards: Vec<ServiceForward>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            manifests: vec![PathBuf::from("k8s/monitoring.yaml")],
            forwards: vec![
                ServiceForward::new("prometheus", "prometheus-service", 9090, 9090),
                ServiceForward::new("grafana", "grafana-service", 3000, 3000),
                ServiceForward::new("jaeger", "jaeger-service", 16686, 16686),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// App manifests applied in order
    #[serde(default = "default_cluster_manifests")]
    pub manifests: Vec<PathBuf>,

    /// Label selector for the app pods
    #[serde(default = "default_app_selector")]
    pub app_selector: String,

    /// Tunnel for the app service
    #[serde(default = "default_app_forward")]
    pub app_forward: ServiceForward,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,

    /// Secret holding the credentials file
    #[serde(default = "default_credentials_secret")]
    pub credentials_secret: String,

    /// Key of the credentials file inside the secret
    #[serde(default = "default_credentials_key")]
    pub credentials_key: String,

    #[serde(default = "default_cluster_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    /// How long a new port-forward may take to answer on its local port
    #[serde(default = "default_tunnel_timeout_secs")]
    pub tunnel_timeout_secs: u64,
}

impl ClusterConfig {
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            manifests: default_cluster_manifests(),
            app_selector: default_app_selector(),
            app_forward: default_app_forward(),
            observability: Some(ObservabilityConfig::default()),
            credentials_secret: default_credentials_secret(),
            credentials_key: default_credentials_key(),
            readiness_timeout_secs: default_cluster_readiness_timeout_secs(),
            tunnel_timeout_secs: default_tunnel_timeout_secs(),
        }
    }
}

/// A host port published by the compose stack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedPort {
    pub name: String,
    pub port: u16,
}

impl PublishedPort {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposeConfig {
    #[serde(default = "default_compose_file")]
    pub file: PathBuf,

    /// Compose project name (defaults to the directory name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Host port mapped to the app container
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Host ports of auxiliary services declared in the stack
    #[serde(default = "default_compose_auxiliary")]
    pub auxiliary: Vec<PublishedPort>,

    #[serde(default = "default_compose_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            file: default_compose_file(),
            project: None,
            app_port: default_app_port(),
            auxiliary: default_compose_auxiliary(),
            readiness_timeout_secs: default_compose_readiness_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalConfig {
    #[serde(default = "default_local_program")]
    pub program: String,

    #[serde(default = "default_local_args")]
    pub args: Vec<String>,

    /// Dependency installation run by the build stage; empty skips it
    #[serde(default = "default_local_install")]
    pub install: Vec<String>,

    #[serde(default = "default_app_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    #[serde(default = "default_local_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            program: default_local_program(),
            args: default_local_args(),
            install: default_local_install(),
            port: default_app_port(),
            workdir: None,
            readiness_timeout_secs: default_local_readiness_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Bound for one chat or end-conversation request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Unset: keep re-discovering for as long as the client runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rediscovery_attempts: Option<u32>,

    #[serde(default = "default_candidates")]
    pub candidates: Vec<CandidateEndpoint>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            backoff_ms: default_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_rediscovery_attempts: None,
            candidates: default_candidates(),
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_run_timeout_secs() -> u64 {
    900
}

fn default_app_name() -> String {
    "mental-health-app".to_string()
}

fn default_image() -> String {
    "mental-health-app:latest".to_string()
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_namespace() -> String {
    "mental-health".to_string()
}

fn default_cluster_manifests() -> Vec<PathBuf> {
    vec![
        PathBuf::from("k8s/deployment.yaml"),
        PathBuf::from("k8s/service.yaml"),
    ]
}

fn default_app_selector() -> String {
    "app=mental-health-app".to_string()
}

fn default_app_forward() -> ServiceForward {
    ServiceForward::new("app", "mental-health-app-service", 8080, 80)
}

fn default_credentials_secret() -> String {
    "gcp-credentials".to_string()
}

fn default_credentials_key() -> String {
    "key.json".to_string()
}

fn default_cluster_readiness_timeout_secs() -> u64 {
    180
}

fn default_tunnel_timeout_secs() -> u64 {
    10
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_app_port() -> u16 {
    8000
}

fn default_compose_auxiliary() -> Vec<PublishedPort> {
    vec![
        PublishedPort::new("prometheus", 9090),
        PublishedPort::new("grafana", 3000),
        PublishedPort::new("jaeger", 16686),
    ]
}

fn default_compose_readiness_timeout_secs() -> u64 {
    120
}

fn default_local_program() -> String {
    "python".to_string()
}

fn default_local_args() -> Vec<String> {
    vec!["app.py".to_string()]
}

fn default_local_install() -> Vec<String> {
    ["pip", "install", "-r", "requirements.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_local_readiness_timeout_secs() -> u64 {
    60
}

fn default_interval_secs() -> u64 {
    5
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<DeployConfig, ConfigError> {
    let config: DeployConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Serialize config to YAML string
pub fn serialize_config(config: &DeployConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::ParseError(e.to_string()))
}

impl DeployConfig {
    /// Reject values that would make a run unbounded or meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "readiness.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "run_timeout_secs must be greater than zero".to_string(),
            ));
        }
        for (name, secs) in [
            ("cluster.readiness_timeout_secs", self.cluster.readiness_timeout_secs),
            ("cluster.tunnel_timeout_secs", self.cluster.tunnel_timeout_secs),
            ("compose.readiness_timeout_secs", self.compose.readiness_timeout_secs),
            ("local.readiness_timeout_secs", self.local.readiness_timeout_secs),
            ("discovery.request_timeout_secs", self.discovery.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.discovery.candidates.is_empty() {
            return Err(ConfigError::Invalid(
                "discovery.candidates must list at least one endpoint".to_string(),
            ));
        }
        if self.discovery.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.local.program.trim().is_empty() {
            return Err(ConfigError::Invalid("local.program is empty".to_string()));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(default_state_dir)
    }

    pub fn bindings_path(&self) -> PathBuf {
        self.state_dir().join("bindings.json")
    }

    /// Freeze the parameters for one target into a run-immutable value
    pub fn target(&self, kind: TargetKind) -> DeploymentTarget {
        match kind {
            TargetKind::Cluster => DeploymentTarget::Cluster(self.cluster.clone()),
            TargetKind::Compose => DeploymentTarget::Compose(self.compose.clone()),
            TargetKind::Local => DeploymentTarget::Local(self.local.clone()),
        }
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<DeployConfig, ConfigError> {
    load_config_from(&default_config_path())
}

/// Load config from a specific path; a missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<DeployConfig, ConfigError> {
    let path = expand_path(path);
    if !path.exists() {
        return Ok(DeployConfig::default());
    }
    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

/// Save config to a specific path
pub fn save_config_to(config: &DeployConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
