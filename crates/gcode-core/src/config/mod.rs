//! Configuration module
//!
//! YAML configuration with serde defaults, environment overrides, and
//! validation before anything is built from it.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;

use crate::errors::ConfigError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<GcodeConfig, ConfigError> {
    ConfigLoader::from_file(path).await
}
