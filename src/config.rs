//! Configuration loading and management.
//!
//! Mirrors the host project's config layer: TOML on disk, defaults merged in
//! rather than required, atomic saves guarded by a sidecar lock file.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Execution mode for [`crate::job::executor::PromptExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Synchronous, piped stdio. Tests and compatibility only.
    Direct,
    /// Detached launcher script with a PID file and output sentinel.
    FireAndForget,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::FireAndForget
    }
}

/// The three `--append-system-prompt` bodies the executor appends depending
/// on indexer awareness and readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPromptTemplates {
    pub available: String,
    pub unavailable: String,
    pub disabled: String,
}

impl Default for SystemPromptTemplates {
    fn default() -> Self {
        Self {
            available: "A semantic code index is available and ready. Use it to \
                         find relevant code before making changes."
                .to_string(),
            unavailable: "A semantic code index was requested for this workspace but \
                          is not currently ready. Proceed without it; rely on direct \
                          file search instead."
                .to_string(),
            disabled: "No semantic code index is configured for this workspace. Do \
                       not mention or attempt to use one."
                .to_string(),
        }
    }
}

/// Substrings that mark the indexer's `status` output as ready. Kept
/// configurable since it's a soft contract with an external tool whose
/// output format isn't guaranteed stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerReadyPattern {
    pub running: String,
    pub ready_any_of: Vec<String>,
}

impl Default for IndexerReadyPattern {
    fn default() -> Self {
        Self {
            running: "Running".to_string(),
            ready_any_of: vec!["Ready".to_string(), "Not needed".to_string()],
        }
    }
}

impl IndexerReadyPattern {
    pub fn matches(&self, status_output: &str) -> bool {
        status_output.contains(&self.running)
            && self
                .ready_any_of
                .iter()
                .any(|needle| status_output.contains(needle))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory under which every registered repository's working
    /// tree lives. Created on first use.
    pub repositories_root: PathBuf,

    /// Root directory under which every job's workspace and durable record
    /// live. Created on first use.
    pub jobs_root: PathBuf,

    /// Bounded concurrency for the scheduler's semaphore.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Default per-job timeout when a job doesn't specify one.
    #[serde(default = "default_job_timeout_seconds")]
    pub default_job_timeout_seconds: u64,

    /// Administrative age timeout: a job older than this (from creation),
    /// regardless of status, is eligible for forced cleanup.
    #[serde(default = "default_job_age_timeout_hours")]
    pub job_age_timeout_hours: u64,

    /// Retention horizon for `JobStore::cleanup_retention`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Executable name (resolved via `$PATH`) for the assistant CLI.
    #[serde(default = "default_assistant_cmd")]
    pub assistant_cmd: String,

    /// Extra arguments inserted before `--append-system-prompt` on every
    /// invocation of `assistant_cmd`, both Mode A and Mode B. Empty by
    /// default; lets a deployment pin flags like `--model` or `--permission-mode`
    /// without forking the executor.
    #[serde(default)]
    pub assistant_args_prefix: Vec<String>,

    /// Executable name (resolved via `$PATH`) for the indexer CLI.
    #[serde(default = "default_indexer_cmd")]
    pub indexer_cmd: String,

    /// Embedding provider passed to `indexer init --embedding-provider`.
    #[serde(default = "default_embedding_provider")]
    pub indexer_embedding_provider: String,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default)]
    pub system_prompt_templates: SystemPromptTemplates,

    #[serde(default)]
    pub indexer_ready_pattern: IndexerReadyPattern,

    /// Environment variable names always forwarded into the assistant CLI's
    /// environment, on top of the two domain variables and per-job
    /// overrides.
    #[serde(default = "default_environment_passthrough")]
    pub environment_passthrough: Vec<String>,

    /// Per-subcommand timeouts used by `GitMetadataReader` (seconds).
    #[serde(default = "default_git_metadata_timeout_secs")]
    pub git_metadata_timeout_secs: u64,

    /// Timeout for `git clone` during repository registration (seconds).
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,

    /// Timeout for `git pull` on a registered repository at the start of a
    /// git-aware job (seconds). Distinct from `git_metadata_timeout_secs`,
    /// which bounds the much cheaper per-subcommand metadata reads, not a
    /// network fetch.
    #[serde(default = "default_git_pull_timeout_secs")]
    pub git_pull_timeout_secs: u64,

    /// Maximum number of bytes accepted for a single staged upload. Enforced
    /// while streaming, not after buffering, so no request holds memory
    /// proportional to the file size.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Arbitrary extra key/value overrides merged into every job's env
    /// unless the job specifies its own.
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_job_timeout_seconds() -> u64 {
    3600
}
fn default_job_age_timeout_hours() -> u64 {
    24
}
fn default_retention_days() -> u64 {
    30
}
fn default_assistant_cmd() -> String {
    "assistant".to_string()
}
fn default_indexer_cmd() -> String {
    "cidx".to_string()
}
fn default_embedding_provider() -> String {
    "voyage-ai".to_string()
}
fn default_git_metadata_timeout_secs() -> u64 {
    5
}
fn default_clone_timeout_secs() -> u64 {
    2 * 60 * 60
}
fn default_git_pull_timeout_secs() -> u64 {
    10 * 60
}
fn default_max_upload_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_environment_passthrough() -> Vec<String> {
    ["HOME", "USER", "USERNAME", "LOGNAME", "SHELL", "PATH", "PWD"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = Self::global_state_dir();
        Self {
            repositories_root: state_dir.join("repositories"),
            jobs_root: state_dir.join("jobs"),
            max_concurrent: default_max_concurrent(),
            default_job_timeout_seconds: default_job_timeout_seconds(),
            job_age_timeout_hours: default_job_age_timeout_hours(),
            retention_days: default_retention_days(),
            assistant_cmd: default_assistant_cmd(),
            assistant_args_prefix: Vec::new(),
            indexer_cmd: default_indexer_cmd(),
            indexer_embedding_provider: default_embedding_provider(),
            execution_mode: ExecutionMode::default(),
            system_prompt_templates: SystemPromptTemplates::default(),
            indexer_ready_pattern: IndexerReadyPattern::default(),
            environment_passthrough: default_environment_passthrough(),
            git_metadata_timeout_secs: default_git_metadata_timeout_secs(),
            clone_timeout_secs: default_clone_timeout_secs(),
            git_pull_timeout_secs: default_git_pull_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            extra_env: HashMap::new(),
        }
    }
}

impl Config {
    /// `~/.jobforge/` — the default home for state when no config file says
    /// otherwise.
    pub fn global_state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".jobforge")
    }

    pub fn global_config_path() -> PathBuf {
        Self::global_state_dir().join("config.toml")
    }

    /// Load configuration from a file, merging in defaults for any field the
    /// file omits (handled structurally by `#[serde(default)]`). Falls back
    /// to `Config::default()` if the file doesn't exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from the default path or create new in-memory defaults.
    pub fn load_or_default() -> Self {
        Self::from_file(&Self::global_config_path()).unwrap_or_default()
    }

    /// Save configuration atomically with a sidecar lock file, the same
    /// pattern used elsewhere in this codebase for config persistence: lock,
    /// write to a temp file, rename over the target.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        let lock_path = path.with_extension("toml.lock");
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)
            .with_context(|| format!("failed to create lock file: {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .context("failed to acquire config lock")?;

        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write temp config: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to install config: {}", path.display()))?;

        FileExt::unlock(&lock_file).ok();
        Ok(())
    }

    /// Ensure the two global roots exist; called once at service startup.
    pub fn ensure_roots(&self) -> Result<()> {
        std::fs::create_dir_all(&self.repositories_root).with_context(|| {
            format!(
                "failed to create repositories root: {}",
                self.repositories_root.display()
            )
        })?;
        std::fs::create_dir_all(&self.jobs_root)
            .with_context(|| format!("failed to create jobs root: {}", self.jobs_root.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_roots() {
        let config = Config::default();
        assert!(config.repositories_root.ends_with("repositories"));
        assert!(config.jobs_root.ends_with("jobs"));
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent, default_max_concurrent());
    }

    #[test]
    fn round_trip_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.max_concurrent = 9;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.max_concurrent, 9);
    }

    #[test]
    fn indexer_ready_pattern_matches() {
        let pattern = IndexerReadyPattern::default();
        assert!(pattern.matches("Service: Running\nIndex: Ready"));
        assert!(pattern.matches("Service: Running\nIndex: Not needed"));
        assert!(!pattern.matches("Service: Stopped"));
    }
}
