//! The error taxonomy returned across the `BatchService` boundary.
//!
//! Internal plumbing uses `anyhow::Result`; anything that crosses into or out
//! of a method on [`crate::service::BatchService`] is one of these variants
//! so a façade on top of the core (HTTP, RPC, whatever) can map it to a
//! transport-specific status without inspecting a string.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0} does not own this resource")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("preparation failed: {0}")]
    PreparationFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BatchError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn path_escape(root: &PathBuf, attempted: &str) -> Self {
        Self::InvalidInput(format!(
            "path `{attempted}` escapes root `{}`",
            root.display()
        ))
    }
}

pub type BatchResult<T> = Result<T, BatchError>;
