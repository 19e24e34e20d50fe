// src/executors/local.rs
use async_trait::async_trait;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Invocation, ProcessRunner};
use crate::core_types::ProcessOutcome;
use crate::errors::RunnerError;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy)]
enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

type CaptureTask = JoinHandle<io::Result<(Vec<u8>, bool)>>;

/// Runs each invocation as a host process in its own process group.
pub struct LocalProcessRunner {
    /// How long to keep draining pipes after the child has gone.
    drain_grace: Duration,
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self {
            drain_grace: Duration::from_secs(2),
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    fn build_command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn collect(&self, task: Option<CaptureTask>, program: &str) -> (Vec<u8>, bool) {
        let Some(mut task) = task else {
            return (Vec::new(), false);
        };
        match tokio::time::timeout(self.drain_grace, &mut task).await {
            Ok(Ok(Ok(captured))) => captured,
            Ok(Ok(Err(e))) => {
                log::warn!("Reading output of '{}' failed: {}", program, e);
                (Vec::new(), false)
            }
            Ok(Err(e)) => {
                log::warn!("Output capture task for '{}' failed: {}", program, e);
                (Vec::new(), false)
            }
            Err(_) => {
                // Something outside the process group still holds the pipe open.
                log::warn!("Output of '{}' still open after {:?}, abandoning", program, self.drain_grace);
                task.abort();
                (Vec::new(), true)
            }
        }
    }
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError> {
        let program = invocation.program.as_str();
        log::debug!("[{}] spawning {} {:?}", invocation.stage, program, invocation.args);

        let mut child = Self::build_command(invocation)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.to_string(),
                source,
            })?;
        let mut group = ProcessGroup::new(child.id());

        // Written on its own task so a child that fills its stdout before reading
        // stdin cannot deadlock against us.
        let stdin_task = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut pipe), Some(data)) => {
                let program = program.to_string();
                Some(tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(data.as_bytes()).await {
                        if e.kind() != io::ErrorKind::BrokenPipe {
                            log::debug!("Writing stdin to '{}' failed: {}", program, e);
                        }
                    }
                    // Dropping the pipe closes the child's stdin.
                }))
            }
            _ => None,
        };

        let limit = invocation.max_output_bytes;
        let stdout_task: Option<CaptureTask> = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, limit)));
        let stderr_task: Option<CaptureTask> = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, limit)));

        let termination = tokio::select! {
            status = child.wait() => Termination::Exited(status.map_err(|source| RunnerError::Io {
                program: program.to_string(),
                source,
            })?),
            _ = deadline(invocation.timeout) => Termination::TimedOut,
            _ = cancel.cancelled() => Termination::Cancelled,
        };

        // Takes down anything the program left running in the background too.
        group.kill();

        let exit_status = match termination {
            Termination::Exited(status) => Some(status),
            Termination::TimedOut | Termination::Cancelled => {
                if matches!(termination, Termination::TimedOut) {
                    log::warn!(
                        "[{}] '{}' timed out after {:?}, killed",
                        invocation.stage,
                        program,
                        invocation.timeout.unwrap_or_default()
                    );
                } else {
                    log::info!("[{}] '{}' cancelled, killed", invocation.stage, program);
                }
                if let Err(e) = child.kill().await {
                    log::debug!("Killing '{}' after process group kill: {}", program, e);
                }
                None
            }
        };

        if let Some(task) = stdin_task {
            task.abort();
        }
        let (stdout, stdout_truncated) = self.collect(stdout_task, program).await;
        let (stderr, stderr_truncated) = self.collect(stderr_task, program).await;

        let exit_code = exit_status.and_then(|status| status.code());
        let signal = exit_status.and_then(terminating_signal);
        log::debug!(
            "[{}] '{}' finished with exit code {:?}, signal {:?}",
            invocation.stage,
            program,
            exit_code,
            signal
        );

        Ok(ProcessOutcome {
            stdout,
            stderr,
            exit_code,
            signal,
            timed_out: matches!(termination, Termination::TimedOut),
            cancelled: matches!(termination, Termination::Cancelled),
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

/// Drain a pipe to EOF, keeping at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.len());
        captured.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((captured, truncated))
}

#[cfg(unix)]
fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Kills the whole group if `run` is dropped before reaching its own kill.
/// `kill_on_drop` alone only reaches the direct child.
struct ProcessGroup {
    pid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn kill(&mut self) {
        kill_process_group(self.pid.take());
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.pid.is_some() {
            log::debug!("Run abandoned, killing process group {:?}", self.pid);
            self.kill();
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {}: {}", pid, err);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
