//! Resource policy and configuration
//!
//! One immutable `ResourcePolicy` is built from the environment at startup
//! and shared read-only (behind an `Arc`) across all concurrent executions.
//! Per-request tweaks go through `PolicyOverrides`, which produce a private
//! copy instead of mutating shared state.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::validate::DenyList;

/// Which isolation backend runs the snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Container runtime driven through the `docker` CLI. The default.
    Docker,
    /// Bare subprocess on the host. No isolation at all - explicit opt-in
    /// for development machines without a container runtime.
    Process,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "none" | "process" => Ok(Self::Process),
            other => Err(format!("unknown sandbox backend: {other}")),
        }
    }
}

/// Immutable description of the limits one execution runs under.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    /// Base image for the isolated environment.
    pub image: String,
    /// Hard wall-clock limit for one snippet.
    pub timeout: Duration,
    /// Memory ceiling in bytes, applied at environment creation.
    pub memory_bytes: u64,
    /// CPU share as a fractional core count (0.5 = half a core).
    pub cpu_share: f64,
    /// Per-stream captured output budget in bytes.
    pub max_output_bytes: usize,
    /// Root under which per-session scratch directories are created.
    pub workspace_root: PathBuf,
    /// Fixed directory harvested artifacts are copied into.
    pub output_dir: PathBuf,
    /// Fixed directory the per-session workspace archives land in.
    pub archive_dir: PathBuf,
    /// Backend selector.
    pub backend: BackendKind,
    /// Skip static validation. Explicitly unsafe; off by default.
    pub skip_validation: bool,
    /// Deny-list driving the static validator.
    pub deny: DenyList,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        let root = std::env::temp_dir().join("zen-sandbox");
        Self {
            image: "python:3.12-slim".to_string(),
            timeout: Duration::from_secs(30),
            memory_bytes: 512 * 1024 * 1024,
            cpu_share: 1.0,
            max_output_bytes: 64 * 1024,
            output_dir: root.join("outputs"),
            archive_dir: root.join("archives"),
            workspace_root: root,
            backend: BackendKind::Docker,
            skip_validation: false,
            deny: DenyList::default(),
        }
    }
}

impl ResourcePolicy {
    /// Build the policy from the recognized environment options, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut policy = Self::default();

        if let Ok(image) = std::env::var("SANDBOX_IMAGE") {
            if !image.trim().is_empty() {
                policy.image = image.trim().to_string();
            }
        }
        if let Some(secs) = env_parse::<u64>("SANDBOX_TIMEOUT_SECS") {
            policy.timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<u64>("SANDBOX_MEMORY_BYTES") {
            policy.memory_bytes = bytes;
        }
        if let Some(cpus) = env_parse::<f64>("SANDBOX_CPUS") {
            policy.cpu_share = cpus;
        }
        if let Some(bytes) = env_parse::<usize>("SANDBOX_MAX_OUTPUT_BYTES") {
            policy.max_output_bytes = bytes;
        }
        if let Ok(root) = std::env::var("SANDBOX_WORKSPACE_ROOT") {
            if !root.trim().is_empty() {
                let root = PathBuf::from(root.trim());
                policy.output_dir = root.join("outputs");
                policy.archive_dir = root.join("archives");
                policy.workspace_root = root;
            }
        }
        if let Ok(dir) = std::env::var("SANDBOX_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                policy.output_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(dir) = std::env::var("SANDBOX_ARCHIVE_DIR") {
            if !dir.trim().is_empty() {
                policy.archive_dir = PathBuf::from(dir.trim());
            }
        }
        if let Some(backend) = env_parse::<BackendKind>("SANDBOX_BACKEND") {
            policy.backend = backend;
        }
        if let Ok(raw) = std::env::var("CODE_INTERPRETER_UNSAFE") {
            policy.skip_validation = env_truthy(&raw);
        }
        if let Ok(raw) = std::env::var("SANDBOX_ALLOWED_IMPORTS") {
            policy.deny = policy.deny.with_allowed_imports(&raw);
        }

        policy
    }

    /// Produce a copy with the per-call overrides applied.
    pub fn with_overrides(&self, overrides: &PolicyOverrides) -> Self {
        let mut policy = self.clone();
        if let Some(timeout) = overrides.timeout {
            policy.timeout = timeout;
        }
        if let Some(ref image) = overrides.image {
            policy.image = image.clone();
        }
        if let Some(bytes) = overrides.memory_bytes {
            policy.memory_bytes = bytes;
        }
        if let Some(cpus) = overrides.cpu_share {
            policy.cpu_share = cpus;
        }
        if let Some(bytes) = overrides.max_output_bytes {
            policy.max_output_bytes = bytes;
        }
        if let Some(skip) = overrides.skip_validation {
            policy.skip_validation = skip;
        }
        policy
    }
}

/// Per-call overrides of selected `ResourcePolicy` fields (e.g. a shorter
/// timeout for one request). Anything `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct PolicyOverrides {
    pub timeout: Option<Duration>,
    pub image: Option<String>,
    pub memory_bytes: Option<u64>,
    pub cpu_share: Option<f64>,
    pub max_output_bytes: Option<usize>,
    pub skip_validation: Option<bool>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = ResourcePolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.backend, BackendKind::Docker);
        assert!(!policy.skip_validation);
        assert!(policy.output_dir.starts_with(&policy.workspace_root));
    }

    #[test]
    fn test_overrides_leave_base_untouched() {
        let base = ResourcePolicy::default();
        let merged = base.with_overrides(&PolicyOverrides {
            timeout: Some(Duration::from_secs(2)),
            max_output_bytes: Some(128),
            ..Default::default()
        });
        assert_eq!(merged.timeout, Duration::from_secs(2));
        assert_eq!(merged.max_output_bytes, 128);
        assert_eq!(base.timeout, Duration::from_secs(30));
        assert_eq!(merged.image, base.image);
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("none".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert_eq!("Process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert!("firecracker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_env_truthy() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(env_truthy(raw));
        }
        for raw in ["0", "false", "off", ""] {
            assert!(!env_truthy(raw));
        }
    }
}
