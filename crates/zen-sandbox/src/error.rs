//! Sandbox error taxonomy
//!
//! Only infrastructure problems surface as `Err` to the caller: the sandbox
//! itself is unusable and retrying untrusted code is never the right move.
//! Everything the snippet does wrong (rejected constructs, non-zero exit,
//! timeout) is a terminal status inside `ExecutionResult`, and harvesting
//! problems are warnings attached to it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to create isolated environment: {0}")]
    EnvironmentCreate(String),

    #[error("failed to communicate with isolated environment: {0}")]
    EnvironmentExec(String),

    #[error("isolation runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("invalid input file name: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
