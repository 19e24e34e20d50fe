//! Configuration type definitions
//!
//! Every section is optional in YAML. A missing file section falls back to
//! defaults that are safe for a single-host deployment: short timeouts,
//! bounded output, and workspaces under the system temp directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::pipeline::{CommandTemplate, Language};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcodeConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Per-language pipeline overrides keyed by language id or alias.
    #[serde(default)]
    pub languages: HashMap<String, LanguageOverride>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Option<Vec<String>>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            enable_cors: true,
            cors_origins: None,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Limits and locations for compile/run stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Directory under which per-request workspaces are created.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Compile stage timeout in seconds
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout: u64,
    /// Run stage timeout in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            workspace_root: None,
            compile_timeout: default_compile_timeout(),
            run_timeout: default_run_timeout(),
            max_output_bytes: default_max_output_bytes(),
            max_source_bytes: default_max_source_bytes(),
        }
    }
}

impl ExecutionSettings {
    pub fn resolved_workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gcode-workspaces"))
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }
}

/// Override of a built-in pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub compile: Option<CommandTemplate>,
    #[serde(default)]
    pub run: Option<CommandTemplate>,
}

impl Default for LanguageOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            compile: None,
            run: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log every HTTP request with its own id.
    #[serde(default = "default_true")]
    pub requests: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            requests: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_bind_addr() -> String { "127.0.0.1:3000".to_string() }
fn default_max_body_size() -> usize { 1024 * 1024 }
fn default_compile_timeout() -> u64 { 30 }
fn default_run_timeout() -> u64 { 10 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_max_source_bytes() -> usize { 256 * 1024 }
fn default_log_level() -> String { "info".to_string() }

impl GcodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.bind_addr '{}' is not a socket address",
                self.server.bind_addr
            )));
        }

        if self.execution.compile_timeout == 0 || self.execution.run_timeout == 0 {
            return Err(ConfigError::Invalid(
                "execution timeouts must be greater than 0".to_string(),
            ));
        }

        if self.execution.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_output_bytes must be greater than 0".to_string(),
            ));
        }

        if self.execution.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_source_bytes must be greater than 0".to_string(),
            ));
        }

        for (id, language_override) in &self.languages {
            if Language::from_id(id).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "languages.{} is not a supported language",
                    id
                )));
            }
            let templates = language_override
                .compile
                .iter()
                .chain(language_override.run.iter());
            for template in templates {
                if template.program.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "languages.{} has an empty program",
                        id
                    )));
                }
            }
        }

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "logging.level '{}' is not a log level",
                self.logging.level
            )));
        }

        Ok(())
    }
}
