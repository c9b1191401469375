//! Isolated executor
//!
//! Orchestrates one request end to end: static validation, session and
//! scratch provisioning, environment creation, supervised execution,
//! artifact harvesting, and unconditional cleanup. Requests are independent
//! units of work; the only shared state is the immutable policy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::{DockerBackend, IsolationBackend, ProcessBackend};
use crate::capture::{CapturedStream, RunLimits, RunOutcome};
use crate::error::SandboxError;
use crate::harvest::harvest;
use crate::policy::{BackendKind, PolicyOverrides, ResourcePolicy};
use crate::session::{ExecutionSession, SessionStatus};
use crate::validate::{validate, Violation};

/// One submission of untrusted code. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub source: String,
    /// Input files staged into the scratch directory before launch.
    pub inputs: BTreeMap<String, Vec<u8>>,
    /// Per-call policy tweaks (shorter timeout, different image, ...).
    pub overrides: Option<PolicyOverrides>,
    /// Caller-held cancellation; triggering it is treated as a timeout.
    pub cancel: Option<CancellationToken>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.inputs.insert(name.into(), bytes);
        self
    }

    pub fn with_overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
}

impl From<ExecutionStatus> for SessionStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Succeeded => SessionStatus::Succeeded,
            ExecutionStatus::Failed => SessionStatus::Failed,
            ExecutionStatus::TimedOut => SessionStatus::TimedOut,
            ExecutionStatus::Rejected => SessionStatus::Rejected,
        }
    }
}

/// Structured result handed back to the caller. Always well-formed: the
/// snippet misbehaving never turns into an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub status: ExecutionStatus,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub artifacts: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    /// Harvest warnings; never escalate to a failed status.
    pub warnings: Vec<String>,
    /// Populated only for `rejected` results.
    pub violations: Vec<Violation>,
}

impl ExecutionResult {
    fn rejected(session_id: String, violations: Vec<Violation>) -> Self {
        Self {
            session_id,
            status: ExecutionStatus::Rejected,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            exit_code: None,
            duration_ms: 0,
            artifacts: Vec::new(),
            archive: None,
            warnings: Vec::new(),
            violations,
        }
    }
}

/// The sandbox entry point. Holds the shared policy and one isolation
/// backend; safe to share behind an `Arc` and call concurrently.
pub struct Executor {
    policy: Arc<ResourcePolicy>,
    backend: Box<dyn IsolationBackend>,
}

impl Executor {
    /// Build an executor with the backend the policy selects.
    pub fn new(policy: Arc<ResourcePolicy>) -> Self {
        let backend: Box<dyn IsolationBackend> = match policy.backend {
            BackendKind::Docker => Box::new(DockerBackend::new()),
            BackendKind::Process => Box::new(ProcessBackend::new()),
        };
        Self { policy, backend }
    }

    /// Build an executor around an explicit backend.
    pub fn with_backend(policy: Arc<ResourcePolicy>, backend: Box<dyn IsolationBackend>) -> Self {
        Self { policy, backend }
    }

    /// Run one request to a terminal result.
    ///
    /// `Err` is reserved for infrastructure failures (the sandbox itself is
    /// unusable); rejection, timeout and non-zero exit are statuses on the
    /// returned result. The scratch directory and environment are released
    /// on every path out of this function.
    #[instrument(skip_all, fields(backend = self.backend.name()))]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let policy = match &request.overrides {
            Some(overrides) => self.policy.with_overrides(overrides),
            None => (*self.policy).clone(),
        };

        if !policy.skip_validation {
            let verdict = validate(&request.source, &policy.deny);
            if !verdict.allowed {
                // Rejected before anything was provisioned: no scratch dir,
                // no environment, no archive.
                let id = uuid::Uuid::new_v4().simple().to_string();
                info!(session = %id, violations = verdict.violations.len(), "request rejected");
                return Ok(ExecutionResult::rejected(id, verdict.violations));
            }
        } else {
            warn!("static validation bypassed (unsafe mode)");
        }

        let mut session = ExecutionSession::create(&policy.workspace_root)?;
        let started = Instant::now();

        let driven = self.drive(&mut session, &policy, &request).await;

        let result = match driven {
            Ok(outcome) => {
                let status = if outcome.timed_out {
                    ExecutionStatus::TimedOut
                } else if outcome.exit_code == Some(0) {
                    ExecutionStatus::Succeeded
                } else {
                    ExecutionStatus::Failed
                };
                session.transition(status.into());

                if outcome.timed_out {
                    // Killing the supervising client does not stop whatever
                    // runs inside the environment. The environment must be
                    // dead before the harvester walks the scratch directory,
                    // or the snippet can keep writing underneath it.
                    session.release_env(self.backend.as_ref()).await;
                }

                let report = harvest(&session, &policy.output_dir, &policy.archive_dir).await;

                info!(
                    session = %session.id,
                    status = ?status,
                    exit_code = ?outcome.exit_code,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "execution finished"
                );
                Ok(ExecutionResult {
                    session_id: session.id.clone(),
                    status,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    exit_code: outcome.exit_code,
                    duration_ms: outcome.duration.as_millis() as u64,
                    artifacts: report.artifacts,
                    archive: report.archive,
                    warnings: report.warnings,
                    violations: Vec::new(),
                })
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "infrastructure failure");
                // A session that started running still has to land on a
                // terminal status; the snippet never finished, so it failed.
                session.transition(SessionStatus::Failed);
                Err(e)
            }
        };

        session.close(self.backend.as_ref()).await;
        result
    }

    /// Stage the request and run it inside a fresh environment.
    async fn drive(
        &self,
        session: &mut ExecutionSession,
        policy: &ResourcePolicy,
        request: &ExecutionRequest,
    ) -> Result<RunOutcome, SandboxError> {
        session.write_program(&request.source)?;
        for (name, bytes) in &request.inputs {
            session.add_input(name, bytes)?;
        }

        let cancel = request.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            // Cancelled before the environment existed; same shape as a
            // timeout, just without paying for provisioning.
            return Ok(RunOutcome::cancelled());
        }

        let handle = self
            .backend
            .create(&session.id, &session.scratch, policy)
            .await?;
        session.attach_env(handle);
        session.transition(SessionStatus::Running);

        let limits = RunLimits {
            timeout: policy.timeout,
            max_output_bytes: policy.max_output_bytes,
        };
        // The session keeps the handle; cleanup still owns teardown even if
        // run fails mid-flight.
        let handle = session.handle().cloned().ok_or_else(|| {
            SandboxError::EnvironmentExec("environment handle lost before run".to_string())
        })?;
        self.backend.run(&handle, limits, &cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EnvHandle;
    use crate::capture::CapturedStream;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted backend: no real isolation, just deterministic behavior for
    /// exercising the orchestration (status mapping, cleanup, harvesting).
    #[derive(Default)]
    struct ScriptedBackend {
        exit_code: i32,
        run_for: Duration,
        stdout: &'static str,
        write_file: Option<(&'static str, &'static [u8])>,
        fail_create: bool,
        fail_run: bool,
        /// File `destroy` drops into the scratch directory, marking when the
        /// environment died relative to harvesting.
        destroy_writes: Option<(&'static str, &'static [u8])>,
        destroys: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IsolationBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn create(
            &self,
            session_id: &str,
            scratch: &Path,
            _policy: &ResourcePolicy,
        ) -> Result<EnvHandle, SandboxError> {
            if self.fail_create {
                return Err(SandboxError::EnvironmentCreate("scripted failure".into()));
            }
            Ok(EnvHandle {
                id: session_id.to_string(),
                scratch: scratch.to_path_buf(),
                teardown: None,
            })
        }

        async fn run(
            &self,
            handle: &EnvHandle,
            limits: RunLimits,
            cancel: &CancellationToken,
        ) -> Result<RunOutcome, SandboxError> {
            if self.fail_run {
                return Err(SandboxError::EnvironmentExec("scripted failure".into()));
            }
            let started = Instant::now();
            if let Some((name, bytes)) = self.write_file {
                std::fs::write(handle.scratch.join(name), bytes).unwrap();
            }
            let timed_out = tokio::select! {
                _ = tokio::time::sleep(self.run_for) => false,
                _ = tokio::time::sleep(limits.timeout) => true,
                _ = cancel.cancelled() => true,
            };
            Ok(RunOutcome {
                exit_code: if timed_out { None } else { Some(self.exit_code) },
                stdout: CapturedStream {
                    text: if timed_out { String::new() } else { self.stdout.to_string() },
                    truncated: false,
                },
                stderr: CapturedStream::default(),
                timed_out,
                duration: started.elapsed(),
            })
        }

        async fn destroy(&self, handle: &EnvHandle) {
            if let Some((name, bytes)) = self.destroy_writes {
                let _ = std::fs::write(handle.scratch.join(name), bytes);
            }
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        executor: Executor,
        _dirs: Vec<tempfile::TempDir>,
        workspace_root: PathBuf,
    }

    fn harness(backend: ScriptedBackend, tweak: impl FnOnce(&mut ResourcePolicy)) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let archives = tempfile::tempdir().unwrap();
        let mut policy = ResourcePolicy {
            workspace_root: root.path().to_path_buf(),
            output_dir: out.path().to_path_buf(),
            archive_dir: archives.path().to_path_buf(),
            ..ResourcePolicy::default()
        };
        tweak(&mut policy);
        let workspace_root = policy.workspace_root.clone();
        Harness {
            executor: Executor::with_backend(Arc::new(policy), Box::new(backend)),
            _dirs: vec![root, out, archives],
            workspace_root,
        }
    }

    fn scratch_dirs(root: &Path) -> usize {
        std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_zero_exit_succeeds_and_cleans_up() {
        let h = harness(
            ScriptedBackend {
                stdout: "hello\n",
                ..Default::default()
            },
            |_| {},
        );
        let result = h
            .executor
            .execute(ExecutionRequest::new("print(\"hello\")"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.stdout.text, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.artifacts.is_empty());
        assert!(result.archive.is_some());
        // Cleanup invariant: no scratch directory survives the call.
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_not_err() {
        let h = harness(
            ScriptedBackend {
                exit_code: 2,
                ..Default::default()
            },
            |_| {},
        );
        let result = h
            .executor
            .execute(ExecutionRequest::new("raise SystemExit(2)"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_denied_import_rejected_without_provisioning() {
        let h = harness(ScriptedBackend::default(), |_| {});
        let result = h
            .executor
            .execute(ExecutionRequest::new("import socket\n"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(!result.violations.is_empty());
        assert!(result.archive.is_none());
        // No session dir was ever created.
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_unsafe_mode_skips_validation() {
        let h = harness(ScriptedBackend::default(), |p| p.skip_validation = true);
        let result = h
            .executor
            .execute(ExecutionRequest::new("import socket\n"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_timeout_bounded_near_configured_limit() {
        let h = harness(
            ScriptedBackend {
                run_for: Duration::from_secs(60),
                ..Default::default()
            },
            |p| p.timeout = Duration::from_millis(200),
        );
        let started = Instant::now();
        let result = h
            .executor
            .execute(ExecutionRequest::new("while True: pass"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.exit_code, None);
        // Far below the snippet's own 60s; bounded by timeout + overhead.
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.archive.is_some());
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_timeout_destroys_environment_before_harvest() {
        let destroys = Arc::new(AtomicUsize::new(0));
        let h = harness(
            ScriptedBackend {
                run_for: Duration::from_secs(60),
                destroy_writes: Some(("stopped.txt", b"dead\n")),
                destroys: destroys.clone(),
                ..Default::default()
            },
            |p| p.timeout = Duration::from_millis(100),
        );
        let result = h
            .executor
            .execute(ExecutionRequest::new("while True: pass"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        // The marker is written by destroy; it only shows up as an artifact
        // if the environment was torn down before the scratch directory was
        // harvested.
        assert!(result.artifacts.iter().any(|p| p.ends_with("stopped.txt")));
        // Torn down exactly once; close must not destroy a second time.
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_cancellation_reports_timed_out() {
        let h = harness(
            ScriptedBackend {
                run_for: Duration::from_secs(60),
                ..Default::default()
            },
            |_| {},
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = h
            .executor
            .execute(ExecutionRequest::new("x = 1").with_cancel(cancel))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_artifacts_harvested_and_contents_match() {
        let h = harness(
            ScriptedBackend {
                write_file: Some(("result.txt", b"42\n")),
                ..Default::default()
            },
            |_| {},
        );
        let result = h
            .executor
            .execute(
                ExecutionRequest::new("data = 42")
                    .with_input("input.csv", b"a,b\n".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.artifacts.len(), 1);
        assert!(result.artifacts[0].ends_with("result.txt"));
        assert_eq!(std::fs::read(&result.artifacts[0]).unwrap(), b"42\n");
        assert!(result.archive.is_some());
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_hard_error_and_cleans_up() {
        let h = harness(
            ScriptedBackend {
                fail_create: true,
                ..Default::default()
            },
            |_| {},
        );
        let err = h
            .executor
            .execute(ExecutionRequest::new("x = 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::EnvironmentCreate(_)));
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_run_failure_is_hard_error_and_cleans_up() {
        let destroys = Arc::new(AtomicUsize::new(0));
        let h = harness(
            ScriptedBackend {
                fail_run: true,
                destroys: destroys.clone(),
                ..Default::default()
            },
            |_| {},
        );
        let err = h
            .executor
            .execute(ExecutionRequest::new("x = 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::EnvironmentExec(_)));
        // The environment existed by the time run failed; close still
        // destroys it and removes the scratch directory.
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
        assert_eq!(scratch_dirs(&h.workspace_root), 0);
    }

    #[tokio::test]
    async fn test_same_source_twice_gives_identical_output() {
        let h = harness(
            ScriptedBackend {
                stdout: "42\n",
                ..Default::default()
            },
            |_| {},
        );
        let request = ExecutionRequest::new("print(6 * 7)");
        let first = h.executor.execute(request.clone()).await.unwrap();
        let second = h.executor.execute(request).await.unwrap();
        // Same validated source under the same policy: identical observable
        // output, but a fresh session each time.
        assert_eq!(first.stdout.text, second.stdout.text);
        assert_eq!(first.stderr.text, second.stderr.text);
        assert_eq!(first.exit_code, second.exit_code);
        assert_eq!(first.status, second.status);
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_per_call_override_shortens_timeout() {
        let h = harness(
            ScriptedBackend {
                run_for: Duration::from_secs(60),
                ..Default::default()
            },
            |_| {},
        );
        let result = h
            .executor
            .execute(
                ExecutionRequest::new("while True: pass").with_overrides(PolicyOverrides {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_result_serializes_as_structured_data() {
        let h = harness(
            ScriptedBackend {
                stdout: "hello\n",
                ..Default::default()
            },
            |_| {},
        );
        let result = h
            .executor
            .execute(ExecutionRequest::new("print(\"hello\")"))
            .await
            .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["stdout"]["text"], "hello\n");
        assert_eq!(json["stdout"]["truncated"], false);
        assert_eq!(json["exit_code"], 0);
    }
}
