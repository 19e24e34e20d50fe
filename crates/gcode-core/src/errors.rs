//! Error types for the execution pipeline
//!
//! Failures are grouped by the stage that produced them so the orchestrator
//! can turn each one into the right user-facing message and log line. None of
//! these errors escape the orchestrator boundary: callers always receive an
//! `ExecutionResult`, and cleanup problems are only ever logged.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::Stage;

/// Terminal failures of one execution.
///
/// A run stage that exits non-zero or writes to stderr is not an error here:
/// it is reported as a completed run with `failed` set.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Error: source exceeds {limit} bytes")]
    SourceTooLarge { limit: usize },
    #[error("Error: could not prepare workspace: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("Compilation Error:\n{diagnostic}")]
    CompileError {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    #[error("Error: failed to start '{program}': {source}")]
    SpawnFailure {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error: lost track of '{program}': {source}")]
    Process {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Execution timed out after {after:?}")]
    Timeout {
        stage: Stage,
        after: Duration,
        partial_output: String,
    },
    #[error("Execution cancelled")]
    Cancelled { stage: Stage },
}

/// Errors raised by a `ProcessRunner` implementation.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error while supervising '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("Failed to parse YAML config: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// A path the cleanup coordinator could not delete.
#[derive(Debug)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: std::io::Error,
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to remove {}: {}", self.path.display(), self.error)
    }
}
