//! Per-request workspaces.
//!
//! Every allocation gets its own directory named after the session and a
//! process-wide sequence number, so two requests can never share a source or
//! artifact path, even when they come from the same session back to back.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::core_types::SessionId;
use crate::pipeline::{PipelineSpec, TemplatePaths};

const MAX_SESSION_SEGMENT: usize = 48;
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Transient paths owned by one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub(crate) dir: PathBuf,
    pub(crate) source_path: PathBuf,
    pub(crate) artifact_path: Option<PathBuf>,
    pub(crate) entry: String,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    pub fn template_paths(&self) -> TemplatePaths<'_> {
        TemplatePaths {
            source: &self.source_path,
            artifact: self.artifact_path.as_deref(),
            workdir: &self.dir,
            entry: &self.entry,
        }
    }

    /// Every path this workspace may have created, leaf files first.
    pub fn paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.source_path.as_path()];
        if let Some(artifact) = &self.artifact_path {
            paths.push(artifact.as_path());
        }
        paths.push(self.dir.as_path());
        paths
    }

    pub async fn write_source(&self, source_code: &str) -> io::Result<()> {
        let mut file = fs::File::create(&self.source_path).await?;
        file.write_all(source_code.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct WorkspaceAllocator {
    root: PathBuf,
    sequence: AtomicU64,
}

impl WorkspaceAllocator {
    /// A relative root is anchored at the current directory. Stages run with
    /// their workspace as working directory, so rendered paths must be absolute.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: absolute_root(root.into()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory for one request and derive its paths.
    pub async fn allocate(&self, session_id: &SessionId, spec: &PipelineSpec) -> io::Result<Workspace> {
        fs::create_dir_all(&self.root).await?;
        let session = sanitize_session_id(session_id.as_str());

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let dir = self.root.join(format!("{}-{}", session, seq));

            match fs::create_dir(&dir).await {
                Ok(()) => {
                    let workspace = Workspace {
                        source_path: dir.join(spec.source_file_name()),
                        artifact_path: spec.artifact.as_ref().map(|name| dir.join(name)),
                        entry: spec.entry_stem.clone(),
                        dir,
                    };
                    log::debug!("Allocated workspace {} for session {}", workspace.dir.display(), session_id);
                    return Ok(workspace);
                }
                // Left over from an earlier process; take the next number.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::warn!("Stale workspace directory {} found, skipping", dir.display());
                }
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "could not allocate a workspace under {} after {} attempts",
                self.root.display(),
                MAX_ALLOCATION_ATTEMPTS
            ),
        ))
    }
}

fn absolute_root(root: PathBuf) -> PathBuf {
    if root.is_absolute() {
        return root;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(root),
        Err(e) => {
            log::warn!(
                "Cannot resolve relative workspace root {}: {}",
                root.display(),
                e
            );
            root
        }
    }
}

/// Reduce a session id to a single safe path segment.
pub fn sanitize_session_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_SESSION_SEGMENT)
        .collect();
    if sanitized.is_empty() {
        "session".to_string()
    } else {
        sanitized
    }
}
