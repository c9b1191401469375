//! Zen Sandbox - Isolated execution of untrusted Python snippets
//!
//! This crate contains the full execution pipeline shared by all frontends
//! (CLI, future agent runtime integration): static validation, resource
//! policy, container-backed isolation, streamed output capture, artifact
//! harvesting and guaranteed per-session cleanup.

pub mod backend;
pub mod capture;
pub mod error;
pub mod exec;
pub mod harvest;
pub mod policy;
pub mod session;
pub mod validate;

pub use backend::{DockerBackend, EnvHandle, IsolationBackend, ProcessBackend};
pub use capture::{CapturedStream, RunLimits, RunOutcome};
pub use error::SandboxError;
pub use exec::{ExecutionRequest, ExecutionResult, ExecutionStatus, Executor};
pub use harvest::HarvestReport;
pub use policy::{BackendKind, PolicyOverrides, ResourcePolicy};
pub use session::{ExecutionSession, SessionStatus};
pub use validate::{validate, DenyList, ValidationVerdict, Violation};
