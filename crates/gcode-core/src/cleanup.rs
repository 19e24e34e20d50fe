//! Workspace release.
//!
//! Deletion is idempotent and best-effort, but never silent: every path that
//! could not be removed is logged as a leak and reported back to the caller.
//! `WorkspaceGuard` makes release part of the workspace's scope so panics and
//! dropped futures still clean up.

use std::io;
use std::path::{Path, PathBuf};

use crate::errors::CleanupFailure;
use crate::workspace::Workspace;

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Remove every path of `workspace` without blocking the async runtime.
pub async fn release(workspace: &Workspace) -> CleanupReport {
    let owned = workspace.clone();
    match tokio::task::spawn_blocking(move || release_blocking(&owned)).await {
        Ok(report) => report,
        Err(e) => {
            log::warn!("Cleanup task for {} failed ({}), releasing inline", workspace.dir().display(), e);
            release_blocking(workspace)
        }
    }
}

/// Synchronous release, also used from `Drop`.
pub fn release_blocking(workspace: &Workspace) -> CleanupReport {
    let mut report = CleanupReport::default();

    remove_file(workspace.source_path(), &mut report);
    if let Some(artifact) = workspace.artifact_path() {
        remove_file(artifact, &mut report);
    }
    // Catches anything else the toolchain wrote next to the source.
    remove_dir(workspace.dir(), &mut report);

    for failure in &report.failures {
        log::warn!("Workspace leak: {}", failure);
    }
    report
}

fn remove_file(path: &Path, report: &mut CleanupReport) {
    record(path, std::fs::remove_file(path), report);
}

fn remove_dir(path: &Path, report: &mut CleanupReport) {
    record(path, std::fs::remove_dir_all(path), report);
}

fn record(path: &Path, result: io::Result<()>, report: &mut CleanupReport) {
    match result {
        Ok(()) => report.removed.push(path.to_path_buf()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(error) => report.failures.push(CleanupFailure {
            path: path.to_path_buf(),
            error,
        }),
    }
}

/// Owns a workspace until it is explicitly released or dropped.
pub struct WorkspaceGuard {
    workspace: Workspace,
    released: bool,
}

impl WorkspaceGuard {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            released: false,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn release(mut self) -> CleanupReport {
        self.released = true;
        release(&self.workspace).await
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.released {
            log::debug!("Releasing workspace {} on drop", self.workspace.dir().display());
            release_blocking(&self.workspace);
        }
    }
}
