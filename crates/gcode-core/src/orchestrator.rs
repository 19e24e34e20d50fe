//! Compile-then-run orchestration for one execution request.
//!
//! ```text
//! Start -> SourceWritten -> (Compiling -> CompileFailed | Compiled) -> Running -> Completed
//! ```
//!
//! Terminal states other than `Completed` are `CompileFailed`, `SpawnFailed`,
//! `TimedOut`, `Cancelled`, `UnsupportedLanguage` and `SetupFailed`. Every
//! state that allocated a workspace releases it before `execute` returns.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cleanup::WorkspaceGuard;
use crate::config::types::{ExecutionSettings, GcodeConfig};
use crate::core_types::{ExecutionOutcome, ExecutionRequest, ExecutionResult, ProcessOutcome};
use crate::errors::{ConfigError, ExecutionError, RunnerError};
use crate::executors::{Invocation, LocalProcessRunner, ProcessRunner};
use crate::pipeline::{CommandTemplate, PipelineRegistry, PipelineSpec, Stage};
use crate::workspace::{Workspace, WorkspaceAllocator};

const TRUNCATION_MARKER: &str = "[output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionState {
    Start,
    SourceWritten,
    Compiling,
    Compiled,
    Running,
    Completed,
}

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits::from(&ExecutionSettings::default())
    }
}

impl From<&ExecutionSettings> for ExecutionLimits {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            compile_timeout: settings.compile_timeout(),
            run_timeout: settings.run_timeout(),
            max_output_bytes: settings.max_output_bytes,
            max_source_bytes: settings.max_source_bytes,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<PipelineRegistry>,
    allocator: WorkspaceAllocator,
    runner: Arc<dyn ProcessRunner>,
    limits: ExecutionLimits,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        allocator: WorkspaceAllocator,
        runner: Arc<dyn ProcessRunner>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            registry,
            allocator,
            runner,
            limits,
        }
    }

    /// Production wiring: configured pipelines, local processes, configured limits.
    pub fn from_config(config: &GcodeConfig) -> Result<Self, ConfigError> {
        let registry = PipelineRegistry::from_overrides(&config.languages)?;
        if registry.is_empty() {
            log::warn!("Every language is disabled; all executions will be rejected");
        }
        let allocator = WorkspaceAllocator::new(config.execution.resolved_workspace_root());
        log::info!(
            "Execution orchestrator ready: {} languages, workspaces under {}",
            registry.len(),
            allocator.root().display()
        );
        Ok(Self::new(
            Arc::new(registry),
            allocator,
            Arc::new(LocalProcessRunner::new()),
            ExecutionLimits::from(&config.execution),
        ))
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.execute_with_cancel(request, &CancellationToken::new()).await
    }

    /// Run one request to a terminal state. Never fails: every error becomes a result.
    pub async fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let result = match self.try_execute(request, cancel).await {
            Ok(result) => result,
            Err(err) => {
                Self::log_failure(request, &err);
                failure_result(err)
            }
        };
        log::info!(
            "Execution for session {} ({}) settled: {:?}",
            request.session_id,
            request.language,
            result.outcome
        );
        result
    }

    async fn try_execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let spec = self
            .registry
            .lookup(&request.language)
            .ok_or_else(|| ExecutionError::UnsupportedLanguage(request.language.clone()))?;

        if request.source_code.len() > self.limits.max_source_bytes {
            return Err(ExecutionError::SourceTooLarge {
                limit: self.limits.max_source_bytes,
            });
        }

        let workspace = self.allocator.allocate(&request.session_id, spec).await?;
        let guard = WorkspaceGuard::new(workspace);

        let result = self.run_pipeline(request, spec, guard.workspace(), cancel).await;

        let report = guard.release().await;
        if !report.is_clean() {
            log::warn!(
                "Session {} leaked {} workspace path(s)",
                request.session_id,
                report.failures.len()
            );
        }
        result
    }

    async fn run_pipeline(
        &self,
        request: &ExecutionRequest,
        spec: &PipelineSpec,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut state = ExecutionState::Start;

        workspace.write_source(&request.source_code).await?;
        transition(&mut state, ExecutionState::SourceWritten, request);

        if let Some(compile) = &spec.compile {
            transition(&mut state, ExecutionState::Compiling, request);
            let invocation = self.invocation(Stage::Compile, compile, workspace, None);
            let outcome = self.run_stage(&invocation, cancel).await?;
            if !outcome.success() {
                let stderr = outcome.stderr_lossy();
                let diagnostic = if stderr.is_empty() {
                    outcome.stdout_lossy()
                } else {
                    stderr
                };
                return Err(ExecutionError::CompileError {
                    exit_code: outcome.exit_code,
                    diagnostic,
                });
            }
            transition(&mut state, ExecutionState::Compiled, request);
        }

        transition(&mut state, ExecutionState::Running, request);
        let invocation = self.invocation(Stage::Run, &spec.run, workspace, request.stdin.clone());
        let outcome = self.run_stage(&invocation, cancel).await?;
        transition(&mut state, ExecutionState::Completed, request);

        Ok(ExecutionResult {
            combined_output: combine_output(&outcome),
            failed: outcome.exit_code != Some(0) || !outcome.stderr.is_empty(),
            stage: Some(Stage::Run),
            outcome: ExecutionOutcome::Completed {
                exit_code: outcome.exit_code,
            },
        })
    }

    fn invocation(
        &self,
        stage: Stage,
        template: &CommandTemplate,
        workspace: &Workspace,
        stdin: Option<String>,
    ) -> Invocation {
        let (program, args) = template.render(&workspace.template_paths());
        let timeout = match stage {
            Stage::Compile => self.limits.compile_timeout,
            Stage::Run => self.limits.run_timeout,
        };
        Invocation {
            stage,
            program,
            args,
            working_dir: Some(workspace.dir().to_path_buf()),
            stdin,
            timeout: Some(timeout),
            max_output_bytes: self.limits.max_output_bytes,
        }
    }

    async fn run_stage(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutionError> {
        let stage = invocation.stage;
        match self.runner.run(invocation, cancel).await {
            Ok(outcome) if outcome.timed_out => Err(ExecutionError::Timeout {
                stage,
                after: invocation.timeout.unwrap_or_default(),
                partial_output: combine_output(&outcome),
            }),
            Ok(outcome) if outcome.cancelled => Err(ExecutionError::Cancelled { stage }),
            Ok(outcome) => Ok(outcome),
            Err(RunnerError::Spawn { program, source }) => Err(ExecutionError::SpawnFailure {
                stage,
                program,
                source,
            }),
            Err(RunnerError::Io { program, source }) => Err(ExecutionError::Process {
                stage,
                program,
                source,
            }),
        }
    }

    fn log_failure(request: &ExecutionRequest, err: &ExecutionError) {
        match err {
            ExecutionError::SpawnFailure { stage, program, source } => log::error!(
                "Spawn failure in {} stage for session {}: could not start '{}': {}",
                stage,
                request.session_id,
                program,
                source
            ),
            ExecutionError::Process { .. } | ExecutionError::Workspace(_) => {
                log::error!("Execution for session {} failed: {}", request.session_id, err)
            }
            ExecutionError::Timeout { stage, after, .. } => log::warn!(
                "Session {} timed out in {} stage after {:?}",
                request.session_id,
                stage,
                after
            ),
            _ => log::debug!("Execution for session {} ended: {}", request.session_id, err),
        }
    }
}

fn transition(state: &mut ExecutionState, next: ExecutionState, request: &ExecutionRequest) {
    log::debug!("session {}: {:?} -> {:?}", request.session_id, state, next);
    *state = next;
}

/// Stdout, then an `Errors:` section whenever stderr is non-empty, then a
/// `Runtime Error:` note if the process died from a signal.
pub fn combine_output(outcome: &ProcessOutcome) -> String {
    let mut combined = outcome.stdout_lossy();
    let stderr = outcome.stderr_lossy();
    if !stderr.is_empty() {
        start_line(&mut combined);
        combined.push_str("Errors:\n");
        combined.push_str(&stderr);
    }
    if let Some(signal) = outcome.signal {
        start_line(&mut combined);
        combined.push_str(&format!("Runtime Error:\nProcess terminated by signal {}", signal));
    }
    if outcome.truncated {
        start_line(&mut combined);
        combined.push_str(TRUNCATION_MARKER);
    }
    combined
}

fn start_line(output: &mut String) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
}

fn failure_result(err: ExecutionError) -> ExecutionResult {
    let (stage, outcome) = match &err {
        ExecutionError::UnsupportedLanguage(_) => (None, ExecutionOutcome::UnsupportedLanguage),
        ExecutionError::SourceTooLarge { .. } | ExecutionError::Workspace(_) => {
            (None, ExecutionOutcome::SetupFailed)
        }
        ExecutionError::CompileError { exit_code, .. } => (
            Some(Stage::Compile),
            ExecutionOutcome::CompileFailed {
                exit_code: *exit_code,
            },
        ),
        ExecutionError::SpawnFailure { stage, .. } => (Some(*stage), ExecutionOutcome::SpawnFailed),
        ExecutionError::Process { stage, .. } => (Some(*stage), ExecutionOutcome::SetupFailed),
        ExecutionError::Timeout { stage, .. } => (Some(*stage), ExecutionOutcome::TimedOut),
        ExecutionError::Cancelled { stage } => (Some(*stage), ExecutionOutcome::Cancelled),
    };

    let combined_output = match &err {
        ExecutionError::Timeout { partial_output, .. } if !partial_output.is_empty() => {
            let mut output = partial_output.clone();
            if !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err.to_string());
            output
        }
        _ => err.to_string(),
    };

    ExecutionResult {
        combined_output,
        failed: true,
        stage,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::SessionId;
    use crate::test_utils::{outcome, Scripted, ScriptedRunner};
    use tempfile::{tempdir, TempDir};

    fn orchestrator(runner: ScriptedRunner) -> (Orchestrator, Arc<ScriptedRunner>, TempDir) {
        let root = tempdir().unwrap();
        let runner = Arc::new(runner);
        let orchestrator = Orchestrator::new(
            Arc::new(PipelineRegistry::builtin()),
            WorkspaceAllocator::new(root.path()),
            runner.clone(),
            ExecutionLimits::default(),
        );
        (orchestrator, runner, root)
    }

    fn assert_root_empty(root: &TempDir) {
        let leftovers: Vec<_> = std::fs::read_dir(root.path())
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "workspace leftovers: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_interpreted_success() {
        let (orchestrator, runner, root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(outcome("42\n", "", 0))));

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "python", "print(42)"))
            .await;

        assert_eq!(result.combined_output, "42\n");
        assert!(!result.failed);
        assert_eq!(result.stage, Some(Stage::Run));
        assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: Some(0) });
        assert_eq!(runner.count(Stage::Compile), 0);

        let calls = runner.calls();
        assert_eq!(calls[0].invocation.program, "python3");
        assert_eq!(calls[0].files[0].1, "print(42)");
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_compile_failure_never_runs() {
        let (orchestrator, runner, root) = orchestrator(
            ScriptedRunner::new()
                .on(Stage::Compile, Scripted::Outcome(outcome("", "main.c:1: error: expected ';'\n", 1)))
                .on(Stage::Run, Scripted::Outcome(outcome("unreachable", "", 0))),
        );

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "c", "int main( { }").with_stdin("ignored"))
            .await;

        assert_eq!(runner.count(Stage::Compile), 1);
        assert_eq!(runner.count(Stage::Run), 0);
        assert!(result.failed);
        assert_eq!(result.stage, Some(Stage::Compile));
        assert_eq!(result.outcome, ExecutionOutcome::CompileFailed { exit_code: Some(1) });
        assert_eq!(result.combined_output, "Compilation Error:\nmain.c:1: error: expected ';'\n");
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_compile_then_run_passes_stdin_only_to_run() {
        let (orchestrator, runner, root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(outcome("hello", "", 0))));

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "cpp", "int main() {}").with_stdin("hello"))
            .await;

        assert!(!result.failed);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].invocation.stage, Stage::Compile);
        assert_eq!(calls[0].invocation.stdin, None);
        assert_eq!(calls[0].invocation.program, "g++");
        assert_eq!(calls[1].invocation.stage, Stage::Run);
        assert_eq!(calls[1].invocation.stdin.as_deref(), Some("hello"));
        assert!(calls[1].invocation.program.ends_with("main"));
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_stderr_with_zero_exit_is_annotated() {
        let (orchestrator, _runner, _root) = orchestrator(
            ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(outcome("out\n", "DeprecationWarning\n", 0))),
        );

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "python", "import imp"))
            .await;

        assert_eq!(result.combined_output, "out\nErrors:\nDeprecationWarning\n");
        assert!(result.failed);
        assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: Some(0) });
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_stderr_is_failed_but_unannotated() {
        let (orchestrator, _runner, _root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(outcome("partial", "", 2))));

        let result = orchestrator.execute(&ExecutionRequest::new("s1", "bash", "exit 2")).await;

        assert_eq!(result.combined_output, "partial");
        assert!(result.failed);
        assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: Some(2) });
    }

    #[tokio::test]
    async fn test_unsupported_language_touches_nothing() {
        let (orchestrator, runner, root) = orchestrator(ScriptedRunner::new());

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "cobol", "DISPLAY 'HI'."))
            .await;

        assert_eq!(result.outcome, ExecutionOutcome::UnsupportedLanguage);
        assert_eq!(result.combined_output, "Unsupported language: cobol");
        assert_eq!(result.stage, None);
        assert!(result.failed);
        assert!(runner.calls().is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_distinct_and_cleaned_up() {
        let (orchestrator, _runner, root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::SpawnFailure));

        let result = orchestrator.execute(&ExecutionRequest::new("s1", "javascript", "1")).await;

        assert_eq!(result.outcome, ExecutionOutcome::SpawnFailed);
        assert!(result.combined_output.starts_with("Error: failed to start 'node'"));
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let timed_out = ProcessOutcome {
            stdout: b"tick\n".to_vec(),
            timed_out: true,
            ..Default::default()
        };
        let (orchestrator, _runner, root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(timed_out)));

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "python", "while True: print('tick')"))
            .await;

        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert_eq!(result.combined_output, "tick\nExecution timed out after 10s");
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_cancellation_releases_workspace() {
        let (orchestrator, _runner, root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::Hang));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = orchestrator
            .execute_with_cancel(&ExecutionRequest::new("s1", "python", "input()"), &cancel)
            .await;

        assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
        assert_eq!(result.stage, Some(Stage::Run));
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_oversized_source_is_rejected_before_allocation() {
        let root = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let orchestrator = Orchestrator::new(
            Arc::new(PipelineRegistry::builtin()),
            WorkspaceAllocator::new(root.path().join("ws")),
            runner.clone(),
            ExecutionLimits {
                max_source_bytes: 8,
                ..ExecutionLimits::default()
            },
        );

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "python", "print('too long')"))
            .await;

        assert_eq!(result.outcome, ExecutionOutcome::SetupFailed);
        assert_eq!(result.combined_output, "Error: source exceeds 8 bytes");
        assert!(!root.path().join("ws").exists());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_source_is_accepted() {
        let (orchestrator, runner, _root) = orchestrator(ScriptedRunner::new());

        let result = orchestrator.execute(&ExecutionRequest::new("s1", "python", "")).await;

        assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: Some(0) });
        assert_eq!(result.combined_output, "");
        assert_eq!(runner.count(Stage::Run), 1);
    }

    #[tokio::test]
    async fn test_same_session_requests_use_separate_workspaces() {
        let (orchestrator, runner, root) = orchestrator(
            ScriptedRunner::new().with_delay(Duration::from_millis(50)),
        );
        let session = SessionId::from("shared");
        let first = ExecutionRequest::new(session.clone(), "python", "print('a')");
        let second = ExecutionRequest::new(session, "python", "print('b')");

        let (a, b) = tokio::join!(orchestrator.execute(&first), orchestrator.execute(&second));
        assert!(!a.failed && !b.failed);

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].files[0].0, calls[1].files[0].0);
        let mut bodies: Vec<_> = calls.iter().map(|c| c.files[0].1.clone()).collect();
        bodies.sort();
        assert_eq!(bodies, vec!["print('a')", "print('b')"]);
        assert_root_empty(&root);
    }

    #[tokio::test]
    async fn test_signal_death_is_reported_as_runtime_error() {
        let crashed = ProcessOutcome {
            stdout: b"before crash".to_vec(),
            exit_code: None,
            signal: Some(11),
            ..Default::default()
        };
        let (orchestrator, _runner, root) =
            orchestrator(ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(crashed)));

        let result = orchestrator
            .execute(&ExecutionRequest::new("s1", "python", "import ctypes; ctypes.string_at(0)"))
            .await;

        assert!(result.failed);
        assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: None });
        assert_eq!(
            result.combined_output,
            "before crash\nRuntime Error:\nProcess terminated by signal 11"
        );
        assert_root_empty(&root);
    }

    #[test]
    fn test_combine_output_marks_truncation() {
        let truncated = ProcessOutcome {
            stdout: b"aaaa".to_vec(),
            exit_code: Some(0),
            truncated: true,
            ..Default::default()
        };
        assert_eq!(combine_output(&truncated), "aaaa\n[output truncated]");
        assert_eq!(combine_output(&outcome("", "boom", 1)), "Errors:\nboom");
    }
}
