//! Isolation backends
//!
//! The executor only knows the `IsolationBackend` capability interface:
//! create an environment, run the staged program in it, destroy it. The
//! default backend drives the `docker` CLI the same way the rest of the
//! ecosystem does (no daemon SDK dependency, just the binary on PATH); a
//! bare-process backend exists for hosts without a container runtime and is
//! explicitly not an isolation boundary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{supervise, RunLimits, RunOutcome};
use crate::error::SandboxError;
use crate::policy::ResourcePolicy;

/// Path the scratch directory is mounted at inside a container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Name of the staged entry file inside the scratch directory.
pub const PROGRAM_FILE: &str = "main.py";

/// Handle to one live isolated environment.
///
/// `teardown` is the argv of a synchronous force-remove command; it lets the
/// session's drop guard tear the environment down without knowing which
/// backend produced it, even when the async runtime is already gone.
#[derive(Debug, Clone)]
pub struct EnvHandle {
    pub id: String,
    pub scratch: PathBuf,
    pub teardown: Option<Vec<String>>,
}

/// Capability interface every isolation backend satisfies.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Backend name for logs and results.
    fn name(&self) -> &'static str;

    /// Provision an environment for one session. Failures here are
    /// infrastructure errors and short-circuit before any user code runs.
    async fn create(
        &self,
        session_id: &str,
        scratch: &Path,
        policy: &ResourcePolicy,
    ) -> Result<EnvHandle, SandboxError>;

    /// Run the staged program inside the environment under the given limits.
    async fn run(
        &self,
        handle: &EnvHandle,
        limits: RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError>;

    /// Stop and remove the environment. Best-effort and idempotent;
    /// failures are logged, never propagated.
    async fn destroy(&self, handle: &EnvHandle);
}

/// Container-runtime backend speaking to the `docker` CLI.
///
/// The environment is created detached with networking disabled, a
/// read-only root filesystem, the scratch directory as the only writable
/// mount, and the policy's memory/CPU limits applied at creation time.
pub struct DockerBackend {
    cli: String,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            cli: "docker".to_string(),
        }
    }

    fn container_name(session_id: &str) -> String {
        format!("zen-sbx-{session_id}")
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(
        &self,
        session_id: &str,
        scratch: &Path,
        policy: &ResourcePolicy,
    ) -> Result<EnvHandle, SandboxError> {
        let name = Self::container_name(session_id);
        let args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
            "--network=none".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp".to_string(),
            format!("--memory={}", policy.memory_bytes),
            format!("--cpus={}", policy.cpu_share),
            "-v".to_string(),
            format!("{}:{}:rw", scratch.display(), CONTAINER_WORKSPACE),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            policy.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ];

        debug!(container = %name, image = %policy.image, "creating container");
        let output = Command::new(&self.cli)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::RuntimeUnavailable(format!("{} not found on PATH", self.cli))
                } else {
                    SandboxError::EnvironmentCreate(e.to_string())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::EnvironmentCreate(format!(
                "{} run failed for {name}: {}",
                self.cli,
                stderr.trim()
            )));
        }

        info!(container = %name, "container running");
        Ok(EnvHandle {
            id: name.clone(),
            scratch: scratch.to_path_buf(),
            teardown: Some(vec![
                self.cli.clone(),
                "rm".to_string(),
                "-f".to_string(),
                name,
            ]),
        })
    }

    async fn run(
        &self,
        handle: &EnvHandle,
        limits: RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError> {
        let program = format!("{CONTAINER_WORKSPACE}/{PROGRAM_FILE}");
        let child = Command::new(&self.cli)
            .args(["exec", &handle.id, "python", &program])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::EnvironmentExec(e.to_string()))?;

        supervise(child, limits, cancel)
            .await
            .map_err(|e| SandboxError::EnvironmentExec(e.to_string()))
    }

    async fn destroy(&self, handle: &EnvHandle) {
        let output = Command::new(&self.cli)
            .args(["rm", "-f", &handle.id])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                debug!(container = %handle.id, "container removed");
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                warn!(container = %handle.id, stderr = %stderr.trim(), "container remove failed");
            }
            Err(e) => {
                warn!(container = %handle.id, error = %e, "container remove did not run");
            }
        }
    }
}

/// Bare subprocess backend. Runs the interpreter directly in the scratch
/// directory with a scrubbed environment. Timeout and capture semantics are
/// identical to the container backend; isolation is not.
pub struct ProcessBackend {
    interpreter: String,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(
        &self,
        session_id: &str,
        scratch: &Path,
        _policy: &ResourcePolicy,
    ) -> Result<EnvHandle, SandboxError> {
        // Nothing to provision; just confirm the interpreter exists so a
        // missing runtime reports as infrastructure, not snippet failure.
        let probe = Command::new(&self.interpreter)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match probe {
            Ok(status) if status.success() => Ok(EnvHandle {
                id: session_id.to_string(),
                scratch: scratch.to_path_buf(),
                teardown: None,
            }),
            Ok(status) => Err(SandboxError::RuntimeUnavailable(format!(
                "{} --version exited with {status}",
                self.interpreter
            ))),
            Err(e) => Err(SandboxError::RuntimeUnavailable(format!(
                "{}: {e}",
                self.interpreter
            ))),
        }
    }

    async fn run(
        &self,
        handle: &EnvHandle,
        limits: RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError> {
        let path = std::env::var("PATH").unwrap_or_default();
        let child = Command::new(&self.interpreter)
            .arg(PROGRAM_FILE)
            .current_dir(&handle.scratch)
            .env_clear()
            .env("PATH", path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::EnvironmentExec(e.to_string()))?;

        supervise(child, limits, cancel)
            .await
            .map_err(|e| SandboxError::EnvironmentExec(e.to_string()))
    }

    async fn destroy(&self, _handle: &EnvHandle) {
        // The supervised child is already dead; nothing else was created.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_scoped_to_session() {
        assert_eq!(DockerBackend::container_name("abc123"), "zen-sbx-abc123");
    }

    #[test]
    fn test_docker_handle_carries_teardown() {
        // The drop-guard contract: a docker handle must know how to remove
        // itself without the backend object.
        let handle = EnvHandle {
            id: "zen-sbx-x".to_string(),
            scratch: PathBuf::from("/tmp/x"),
            teardown: Some(vec![
                "docker".to_string(),
                "rm".to_string(),
                "-f".to_string(),
                "zen-sbx-x".to_string(),
            ]),
        };
        let argv = handle.teardown.as_ref().unwrap();
        assert_eq!(argv[0], "docker");
        assert_eq!(argv.last().unwrap(), &handle.id);
    }
}
