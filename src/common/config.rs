//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};
use crate::readiness::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// The CLI under test
    #[serde(default)]
    pub cli: CliConfig,

    /// Step timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Readiness polling policies
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Workspace settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// Configuration for the CLI under test
#[derive(Debug, Deserialize, Clone)]
pub struct CliConfig {
    /// Executable name or path
    #[serde(default = "default_program")]
    pub program: String,

    /// Extra environment variables for every spawned command
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            env: HashMap::new(),
        }
    }
}

fn default_program() -> String {
    "func".to_string()
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Budget for a command that is expected to exit on its own
    #[serde(default = "default_step")]
    pub step_secs: u64,

    /// Bounded wait for expected output of a process left running
    #[serde(default = "default_output")]
    pub output_secs: u64,

    /// How long to wait for a killed process group to be reaped
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            step_secs: default_step(),
            output_secs: default_output(),
            kill_grace_ms: default_kill_grace(),
        }
    }
}

fn default_step() -> u64 {
    120
}
fn default_output() -> u64 {
    60
}
fn default_kill_grace() -> u64 {
    5000
}

impl Timeouts {
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    pub fn output(&self) -> Duration {
        Duration::from_secs(self.output_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Readiness policies. HTTP and output readiness observe different
/// subsystems and are configured independently.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub http: HttpReadiness,

    #[serde(default)]
    pub output: OutputReadiness,
}

/// HTTP readiness policy
#[derive(Debug, Deserialize, Clone)]
pub struct HttpReadiness {
    #[serde(default = "default_http_attempts")]
    pub attempts: u32,

    #[serde(default = "default_http_interval")]
    pub interval_ms: u64,

    /// Timeout for a single probe request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path of the health endpoint
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for HttpReadiness {
    fn default() -> Self {
        Self {
            attempts: default_http_attempts(),
            interval_ms: default_http_interval(),
            request_timeout_secs: default_request_timeout(),
            health_path: default_health_path(),
        }
    }
}

fn default_http_attempts() -> u32 {
    10
}
fn default_http_interval() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    2
}
fn default_health_path() -> String {
    "/admin/host/ping".to_string()
}

impl HttpReadiness {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.interval_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Output readiness policy
#[derive(Debug, Deserialize, Clone)]
pub struct OutputReadiness {
    #[serde(default = "default_output_attempts")]
    pub attempts: u32,

    #[serde(default = "default_output_interval")]
    pub interval_ms: u64,
}

impl Default for OutputReadiness {
    fn default() -> Self {
        Self {
            attempts: default_output_attempts(),
            interval_ms: default_output_interval(),
        }
    }
}

fn default_output_attempts() -> u32 {
    60
}
fn default_output_interval() -> u64 {
    500
}

impl OutputReadiness {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.interval_ms))
    }
}

/// Workspace settings
#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Parent directory for scenario workspaces (default: OS temp dir)
    pub base_dir: Option<PathBuf>,

    /// Leave the workspace on disk when a scenario fails
    #[serde(default = "default_preserve")]
    pub preserve_on_failure: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            preserve_on_failure: default_preserve(),
        }
    }
}

fn default_preserve() -> bool {
    true
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_access(path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Resolve the CLI program to an executable path
    ///
    /// Paths are used as-is, bare names are searched on PATH.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        let program = Path::new(&self.cli.program);
        if program.components().count() > 1 {
            return Ok(program.to_path_buf());
        }
        which::which(program).map_err(|e| {
            Error::Config(format!(
                "CLI program '{}' not found on PATH: {}",
                self.cli.program, e
            ))
        })
    }
}
