//! Configuration loader for YAML files and environment overrides

use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::types::GcodeConfig;
use crate::errors::ConfigError;

pub const ENV_WORKSPACE_ROOT: &str = "GCODE_WORKSPACE_ROOT";
pub const ENV_RUN_TIMEOUT: &str = "GCODE_RUN_TIMEOUT";
pub const ENV_COMPILE_TIMEOUT: &str = "GCODE_COMPILE_TIMEOUT";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<GcodeConfig, ConfigError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<GcodeConfig, ConfigError> {
        let mut config: GcodeConfig = if content.trim().is_empty() {
            GcodeConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        Self::resolve_environment(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<GcodeConfig, ConfigError> {
        let mut config = GcodeConfig::default();
        Self::resolve_environment(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_environment(config: &mut GcodeConfig) -> Result<(), ConfigError> {
        if let Ok(root) = env::var(ENV_WORKSPACE_ROOT) {
            if !root.is_empty() {
                config.execution.workspace_root = Some(PathBuf::from(root));
            }
        }

        if let Some(secs) = Self::env_seconds(ENV_RUN_TIMEOUT)? {
            config.execution.run_timeout = secs;
        }
        if let Some(secs) = Self::env_seconds(ENV_COMPILE_TIMEOUT)? {
            config.execution.compile_timeout = secs;
        }

        Ok(())
    }

    fn env_seconds(key: &str) -> Result<Option<u64>, ConfigError> {
        match env::var(key) {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid(format!("{} must be a number of seconds: {}", key, e))),
            Err(_) => Ok(None),
        }
    }
}
