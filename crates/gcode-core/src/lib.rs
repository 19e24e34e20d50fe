//! Multi-language compile-and-run orchestration.
//!
//! This crate takes a snippet of source code, a language identifier and
//! optional stdin, and runs the snippet through that language's pipeline:
//! an optional compile stage followed by a run stage, each a supervised
//! child process inside a workspace that belongs to the request alone.
//!
//! # Architecture Overview
//!
//! - **Pipeline registry**: declarative per-language compile and run commands
//! - **Workspace allocation**: collision-free per-request directories
//! - **Process runner**: spawn, stream capture, timeout and cancellation
//! - **Orchestrator**: compile-then-run sequencing and result aggregation
//! - **Cleanup**: scoped release of every generated file
//! - **Dispatcher**: cancellable execution table keyed by session
//! - **Configuration system**: YAML settings with environment overrides

pub mod cleanup;
pub mod config;
pub mod core_types;
pub mod dispatcher;
pub mod errors;
pub mod executors;
pub mod orchestrator;
pub mod pipeline;
pub mod workspace;

pub use config::*;
pub use core_types::{
    ExecutionId, ExecutionNotice, ExecutionOutcome, ExecutionRequest, ExecutionResult, ProcessOutcome,
    SessionId,
};
pub use dispatcher::Dispatcher;
pub use errors::{ConfigError, ExecutionError, RunnerError};
pub use executors::{LocalProcessRunner, ProcessRunner};
pub use orchestrator::{ExecutionLimits, Orchestrator};
pub use pipeline::{Language, PipelineRegistry, PipelineSpec, Stage};

#[cfg(test)]
pub mod test_utils;
