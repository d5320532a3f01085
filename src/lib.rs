//! jobforge — multi-tenant batch execution core for an assistant CLI and a
//! companion semantic-indexer CLI.
//!
//! Provisions an isolated, copy-on-write workspace per job, prepares it (git
//! pull, indexer warm-up), launches the assistant CLI against a user prompt,
//! tracks progress through to a terminal state, and reconciles in-flight
//! jobs after a restart. [`service::BatchService`] is the seam an external
//! façade (HTTP, RPC, ...) is built against.

pub mod auth;
pub mod config;
pub mod cow;
pub mod error;
pub mod fsprobe;
pub mod git;
pub mod job;
pub mod process;
pub mod repo;
pub mod service;
pub mod staging;
pub mod validation;
pub mod workspace;

pub use config::Config;
pub use error::{BatchError, BatchResult};
pub use service::BatchService;
