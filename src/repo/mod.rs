//! The repository registry and its data model.

mod registry;
mod settings;

pub use registry::RepositoryRegistry;
pub use settings::SettingsRecord;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::git::GitSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    Cloning,
    CidxIndexing,
    Completed,
    CidxFailed,
    Failed,
}

impl std::fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloneStatus::Cloning => "cloning",
            CloneStatus::CidxIndexing => "cidx_indexing",
            CloneStatus::Completed => "completed",
            CloneStatus::CidxFailed => "cidx_failed",
            CloneStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A registered source tree. Mutated only by the registration pipeline and
/// `unregister`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub git_url: String,
    pub description: String,
    pub clone_path: PathBuf,
    pub indexer_aware: bool,
    pub clone_status: CloneStatus,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub git_snapshot: Option<GitSnapshot>,
}
