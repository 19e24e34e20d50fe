use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::pipeline::Stage;

/// Opaque identifier of the client session that submitted a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub type ExecutionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub session_id: SessionId,
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        session_id: impl Into<SessionId>,
        language: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            language: language.into(),
            source_code: source_code.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Raw result of one process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Signal that ended the process on its own, not one we sent.
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Set when either stream exceeded the output limit.
    pub truncated: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Terminal state reached by one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The run stage finished; a non-zero code is a runtime error.
    Completed { exit_code: Option<i32> },
    CompileFailed { exit_code: Option<i32> },
    SpawnFailed,
    TimedOut,
    Cancelled,
    UnsupportedLanguage,
    SetupFailed,
}

/// What the caller gets back for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub combined_output: String,
    pub failed: bool,
    pub stage: Option<Stage>,
    pub outcome: ExecutionOutcome,
}

/// Single terminal message delivered on a notification channel.
#[derive(Debug, Clone)]
pub struct ExecutionNotice {
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
    pub result: ExecutionResult,
}
