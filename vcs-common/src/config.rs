//! Configuration loading
//!
//! Two sources, both bootstrap-only (restart to pick up changes):
//! 1. **TOML file**: server, remote layout, pipeline timing, registry, conversion mode, logging
//! 2. **Environment**: SSH credentials (`SSH_HOST`, `SSH_USER`, `SSH_PASSWORD`, `SSH_PORT`)
//!
//! # Config file path priority
//!
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`VCS_CONFIG`)
//! 3. `~/.config/vcstream/vcstream.toml`
//! 4. `./vcstream.toml`
//!
//! A missing config file is not fatal: a warning is logged and compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "VCS_CONFIG";

/// Default SSH port when `SSH_PORT` is unset
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local folder for multipart uploads (`source/` and `target/` beneath it)
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            upload_dir: default_upload_dir(),
        }
    }
}

/// Remote cluster layout and scheduler invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Root of the pipeline's remote working tree
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Directory holding the batch scripts; also the scheduler working directory
    #[serde(default = "default_run_dir")]
    pub run_dir: String,
    /// Shell file that makes `conda` available on the remote host
    #[serde(default = "default_conda_sh")]
    pub conda_sh: String,
    /// Conda environment activated before every submission
    #[serde(default = "default_conda_env")]
    pub conda_env: String,
    /// Directory holding trained voice model weights (`<name>.pth`)
    #[serde(default = "default_weights_dir")]
    pub weights_dir: String,
    /// Directory holding trained retrieval indexes (`<name>.index`)
    #[serde(default = "default_index_dir")]
    pub index_dir: String,
    /// Diagnostic lines the scheduler prints on success
    #[serde(default = "default_informational_stderr")]
    pub informational_stderr: Vec<String>,
    #[serde(default)]
    pub scripts: ScriptNames,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            run_dir: default_run_dir(),
            conda_sh: default_conda_sh(),
            conda_env: default_conda_env(),
            weights_dir: default_weights_dir(),
            index_dir: default_index_dir(),
            informational_stderr: default_informational_stderr(),
            scripts: ScriptNames::default(),
        }
    }
}

/// Batch script file names, relative to `RemoteConfig::run_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptNames {
    pub separate: String,
    pub infer: String,
    pub combine: String,
    pub cleanup: String,
    pub separate_train: String,
    pub train: String,
}

impl Default for ScriptNames {
    fn default() -> Self {
        Self {
            separate: "separate.sh".to_string(),
            infer: "batch_infer.sh".to_string(),
            combine: "combine.sh".to_string(),
            cleanup: "cleanup.sh".to_string(),
            separate_train: "separate_train.sh".to_string(),
            train: "train.sh".to_string(),
        }
    }
}

/// Pipeline timing and local output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds between completion-marker checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound on waiting for the combined artifact (0 = wait indefinitely)
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    /// Where combined results are downloaded to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            completion_timeout_secs: default_completion_timeout_secs(),
            output_dir: default_output_dir(),
        }
    }
}

/// Singer registry persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

/// Conversion-mode control loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Seconds between playback-context queries
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Collection ids (playlist ids) whose playback triggers a conversion
    #[serde(default)]
    pub watched_collections: Vec<String>,
    /// Base URL of the playback API
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            watched_collections: Vec::new(),
            api_base: default_api_base(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5730
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_base_dir() -> String {
    "/data/vcstream/rvc".to_string()
}

fn default_run_dir() -> String {
    "/data/vcstream/run".to_string()
}

fn default_conda_sh() -> String {
    "/opt/anaconda3/etc/profile.d/conda.sh".to_string()
}

fn default_conda_env() -> String {
    "rvc".to_string()
}

fn default_weights_dir() -> String {
    "/data/vcstream/rvc/weights".to_string()
}

fn default_index_dir() -> String {
    "/data/vcstream/rvc/indexes".to_string()
}

fn default_informational_stderr() -> Vec<String> {
    vec!["AURORA: Job submitted".to_string()]
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_completion_timeout_secs() -> u64 {
    7200
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("singers.json")
}

fn default_api_base() -> String {
    "https://api.spotify.com".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve which config file to read
///
/// Returns the first candidate per the module-level priority order. The
/// returned path may not exist; `load_toml_config` handles that case.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(user_config) = dirs::config_dir().map(|d| d.join("vcstream").join("vcstream.toml")) {
        if user_config.exists() {
            return user_config;
        }
    }

    PathBuf::from("vcstream.toml")
}

/// Load the TOML bootstrap config, falling back to defaults if the file is missing
///
/// A file that exists but fails to parse is an error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using compiled defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// SSH connection credentials
#[derive(Clone)]
pub struct SshCredentials {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

impl SshCredentials {
    /// Read credentials from `SSH_HOST`, `SSH_USER`, `SSH_PASSWORD`, `SSH_PORT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read credentials through an arbitrary lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{} is not set", key)))
        };

        let host = required("SSH_HOST")?;
        let user = required("SSH_USER")?;
        let password = lookup("SSH_PASSWORD").unwrap_or_default();
        let port = match lookup("SSH_PORT") {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("Invalid SSH_PORT '{}': {}", raw, e)))?,
            _ => DEFAULT_SSH_PORT,
        };

        Ok(Self {
            host,
            user,
            password,
            port,
        })
    }
}
