use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core_types::ProcessOutcome;
use crate::errors::RunnerError;
use crate::executors::{Invocation, ProcessRunner};
use crate::pipeline::Stage;

#[derive(Debug, Clone)]
pub enum Scripted {
    Outcome(ProcessOutcome),
    SpawnFailure,
    /// Wait until cancelled, then report a cancelled outcome.
    Hang,
}

/// What the runner saw when it was invoked.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub invocation: Invocation,
    /// Contents of every argument that named an existing file at call time.
    pub files: Vec<(PathBuf, String)>,
}

/// `ProcessRunner` double that answers each stage from a script and records calls.
pub struct ScriptedRunner {
    script: HashMap<Stage, Scripted>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            script: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn on(mut self, stage: Stage, response: Scripted) -> Self {
        self.script.insert(stage, response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.invocation.stage == stage)
            .count()
    }
}

pub fn outcome(stdout: &str, stderr: &str, exit_code: i32) -> ProcessOutcome {
    ProcessOutcome {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code: Some(exit_code),
        ..Default::default()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError> {
        let files = invocation
            .args
            .iter()
            .map(PathBuf::from)
            .filter(|path| path.is_file())
            .filter_map(|path| std::fs::read_to_string(&path).ok().map(|content| (path, content)))
            .collect();
        self.calls.lock().unwrap().push(RecordedCall {
            invocation: invocation.clone(),
            files,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.script.get(&invocation.stage) {
            Some(Scripted::Outcome(outcome)) => Ok(outcome.clone()),
            Some(Scripted::SpawnFailure) => Err(RunnerError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
            Some(Scripted::Hang) => {
                cancel.cancelled().await;
                Ok(ProcessOutcome {
                    cancelled: true,
                    ..Default::default()
                })
            }
            None => Ok(outcome("", "", 0)),
        }
    }
}
