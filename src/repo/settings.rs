//! The per-repository settings record persisted inside its clone directory:
//! `<repositoriesRoot>/<repoName>/.claude-batch-settings.json`.
//!
//! This file is the single source of truth for a repository's registered
//! state; no external sidecar is maintained.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CloneStatus;

pub const SETTINGS_FILENAME: &str = ".claude-batch-settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "GitUrl")]
    pub git_url: String,
    #[serde(rename = "RegisteredAt")]
    pub registered_at: DateTime<Utc>,
    #[serde(rename = "CloneStatus")]
    pub clone_status: CloneStatus,
    #[serde(rename = "CidxAware")]
    pub cidx_aware: bool,
}

impl SettingsRecord {
    pub fn path_in(clone_dir: &Path) -> PathBuf {
        clone_dir.join(SETTINGS_FILENAME)
    }

    pub fn load(clone_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(clone_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let record: SettingsRecord = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn save(&self, clone_dir: &Path) -> Result<()> {
        let path = Self::path_in(clone_dir);
        // UTF-8, no BOM — serde_json never emits one.
        let content = serde_json::to_string_pretty(self).context("failed to serialize settings record")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
