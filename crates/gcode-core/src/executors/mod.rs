//! Process execution for compile and run stages.
//!
//! The orchestrator only talks to the `ProcessRunner` trait. The local runner
//! spawns host processes; tests substitute a scripted runner.
//!
//! Processes run with the privileges of the server. A hardened deployment
//! would add namespace, cgroup and seccomp confinement inside a runner
//! implementation without touching the orchestrator.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core_types::ProcessOutcome;
use crate::errors::RunnerError;
use crate::pipeline::Stage;

pub mod local;

pub use local::LocalProcessRunner;

/// One fully rendered process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// Per-stream cap on captured output.
    pub max_output_bytes: usize,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run one process to completion, timeout, or cancellation.
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError>;
}
