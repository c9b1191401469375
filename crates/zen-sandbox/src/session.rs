//! Execution sessions
//!
//! One `ExecutionSession` per run: a unique id, a scratch directory that is
//! the only storage visible to the snippet, the environment handle once one
//! exists, and a status machine that must reach exactly one terminal state.
//! Cleanup runs on every exit path; a `Drop` backstop covers panics in the
//! caller so an environment can never outlive its session.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{EnvHandle, IsolationBackend, PROGRAM_FILE};
use crate::error::SandboxError;

/// Lifecycle of a session. `pending -> running -> ` one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Mutable state of a single run, owned exclusively by the executor.
pub struct ExecutionSession {
    pub id: String,
    pub scratch: PathBuf,
    pub started_at: DateTime<Utc>,
    status: SessionStatus,
    handle: Option<EnvHandle>,
    /// Relative paths staged from the request; the harvester excludes them.
    inputs: Vec<PathBuf>,
    cleaned: bool,
}

impl ExecutionSession {
    /// Allocate a fresh scratch directory under the workspace root.
    pub fn create(workspace_root: &Path) -> Result<Self, SandboxError> {
        let id = Uuid::new_v4().simple().to_string();
        std::fs::create_dir_all(workspace_root)?;
        let scratch = workspace_root.join(format!("session-{id}"));
        std::fs::create_dir(&scratch)?;
        debug!(session = %id, scratch = %scratch.display(), "session created");
        Ok(Self {
            id,
            scratch,
            started_at: Utc::now(),
            status: SessionStatus::Pending,
            handle: None,
            inputs: Vec::new(),
            cleaned: false,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn handle(&self) -> Option<&EnvHandle> {
        self.handle.as_ref()
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn attach_env(&mut self, handle: EnvHandle) {
        self.handle = Some(handle);
    }

    /// Advance the status machine. A session that already reached a terminal
    /// state keeps it; double transitions indicate an executor bug and are
    /// logged rather than honored.
    pub fn transition(&mut self, next: SessionStatus) {
        if self.status.is_terminal() {
            warn!(
                session = %self.id,
                current = ?self.status,
                requested = ?next,
                "ignoring status transition after terminal state"
            );
            return;
        }
        self.status = next;
    }

    /// Stage the snippet as the program file inside the scratch directory.
    pub fn write_program(&mut self, source: &str) -> Result<(), SandboxError> {
        let path = self.scratch.join(PROGRAM_FILE);
        std::fs::write(path, source)?;
        self.inputs.push(PathBuf::from(PROGRAM_FILE));
        Ok(())
    }

    /// Stage one request input file. Names must stay inside the scratch
    /// directory; anything absolute or parent-escaping is refused.
    pub fn add_input(&mut self, name: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let rel = PathBuf::from(name);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SandboxError::InvalidInput(name.to_string()));
        }
        let path = self.scratch.join(&rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        self.inputs.push(rel);
        Ok(())
    }

    /// Destroy the environment now, ahead of `close`. Used when the run was
    /// stopped from outside: killing the supervising client does not stop
    /// what runs inside the environment, and nothing may keep executing or
    /// writing into the scratch directory while results are collected.
    pub async fn release_env(&mut self, backend: &dyn IsolationBackend) {
        if let Some(handle) = self.handle.take() {
            backend.destroy(&handle).await;
        }
    }

    /// Release everything the session owns: destroy the environment if one
    /// was created, then remove the scratch directory. Failures are logged
    /// and swallowed - by this point the caller already has a terminal
    /// result, and a cleanup hiccup must never mask it.
    pub async fn close(&mut self, backend: &dyn IsolationBackend) {
        if let Some(handle) = self.handle.take() {
            backend.destroy(&handle).await;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.scratch) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = %self.id, error = %e, "scratch directory removal failed");
            }
        }
        self.cleaned = true;
        debug!(session = %self.id, status = ?self.status, "session closed");
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        // Panic path: tear the environment down synchronously via the argv
        // the backend left on the handle, then drop the scratch directory.
        if let Some(handle) = self.handle.take() {
            if let Some(argv) = &handle.teardown {
                let _ = std::process::Command::new(&argv[0])
                    .args(&argv[1..])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
        }
        let _ = std::fs::remove_dir_all(&self.scratch);
    }
}
