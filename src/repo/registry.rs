//! Registers, lists, and unregisters repositories.
//!
//! The settings record inside each clone directory is the single source of
//! truth; this registry holds no authoritative in-memory state of its own —
//! it's a thin, repeatable read/mutate layer over
//! `<repositoriesRoot>/<name>/.claude-batch-settings.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::Config;
use crate::cow::CoWCloner;
use crate::error::{BatchError, BatchResult};
use crate::fsprobe::FilesystemProbe;
use crate::git::{self, GitMetadataReader};
use crate::process::ProcessRunner;
use crate::validation::{valid_git_url, valid_repository_name};

use super::settings::SettingsRecord;
use super::{CloneStatus, Repository};

pub struct RepositoryRegistry {
    root: PathBuf,
    config: Arc<Config>,
}

impl RepositoryRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            root: config.repositories_root.clone(),
            config,
        }
    }

    /// Enumerate direct children of the repositories root, each mapped to a
    /// `Repository` from its settings record (if any). Entries with a
    /// `.git` directory but no settings record are reported as `Cloning`:
    /// there's no way to distinguish an in-progress clone from one some
    /// other process dropped there, so the optimistic read wins.
    pub fn list(&self) -> Result<Vec<Repository>> {
        self.list_with_metadata(false)
    }

    /// Like [`Self::list`], but also attaches a git metadata snapshot and
    /// on-disk size for each repository whose working tree exists.
    pub fn list_with_metadata(&self, with_metadata: bool) -> Result<Vec<Repository>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut repositories = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let clone_path = entry.path();

            let repository = match SettingsRecord::load(&clone_path) {
                Ok(Some(record)) => self.repository_from_record(record, clone_path.clone()),
                Ok(None) => Repository {
                    name: name.clone(),
                    git_url: String::new(),
                    description: String::new(),
                    clone_path: clone_path.clone(),
                    indexer_aware: false,
                    clone_status: CloneStatus::Cloning,
                    registered_at: Utc::now(),
                    size_bytes: None,
                    git_snapshot: None,
                },
                Err(e) => {
                    tracing::warn!("skipping corrupted settings record for `{name}`: {e}");
                    continue;
                }
            };

            let repository = if with_metadata {
                self.attach_metadata(repository)
            } else {
                repository
            };

            repositories.push(repository);
        }

        repositories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repositories)
    }

    fn repository_from_record(&self, record: SettingsRecord, clone_path: PathBuf) -> Repository {
        Repository {
            name: record.name,
            git_url: record.git_url,
            description: record.description,
            clone_path,
            indexer_aware: record.cidx_aware,
            clone_status: record.clone_status,
            registered_at: record.registered_at,
            size_bytes: None,
            git_snapshot: None,
        }
    }

    fn attach_metadata(&self, mut repository: Repository) -> Repository {
        repository.size_bytes = directory_size(&repository.clone_path).ok();
        let reader = GitMetadataReader::new(Duration::from_secs(self.config.git_metadata_timeout_secs));
        repository.git_snapshot = reader.read(&repository.clone_path);
        repository
    }

    pub fn get(&self, name: &str) -> Result<Option<Repository>> {
        Ok(self.list()?.into_iter().find(|r| r.name == name))
    }

    /// Validates, rejects duplicates, then schedules the background clone
    /// (+ optional indexing) pipeline and returns immediately with
    /// `CloneStatus::Cloning`.
    pub async fn register(
        &self,
        name: &str,
        git_url: &str,
        description: &str,
        indexer_aware: bool,
    ) -> BatchResult<Repository> {
        valid_repository_name(name)?;
        valid_git_url(git_url)?;

        let clone_path = self.root.join(name);
        if clone_path.exists() {
            return Err(BatchError::Conflict(format!(
                "repository `{name}` is already registered"
            )));
        }

        std::fs::create_dir_all(&self.root).map_err(|e| BatchError::Internal(e.into()))?;

        let repository = Repository {
            name: name.to_string(),
            git_url: git_url.to_string(),
            description: description.to_string(),
            clone_path: clone_path.clone(),
            indexer_aware,
            clone_status: CloneStatus::Cloning,
            registered_at: Utc::now(),
            size_bytes: None,
            git_snapshot: None,
        };

        let config = Arc::clone(&self.config);
        let name = name.to_string();
        let git_url = git_url.to_string();
        let description = description.to_string();

        tokio::spawn(async move {
            if let Err(e) =
                run_registration_pipeline(config, name.clone(), git_url, description, indexer_aware)
                    .await
            {
                tracing::error!("registration pipeline for `{name}` failed: {e}");
            }
        });

        Ok(repository)
    }

    /// Releases any indexer-owned state (best-effort) then recursively
    /// deletes the clone directory, taking the settings record with it.
    pub async fn unregister(&self, name: &str) -> BatchResult<()> {
        valid_repository_name(name)?;

        let clone_path = self.root.join(name);
        if !clone_path.exists() {
            return Err(BatchError::not_found(format!("repository `{name}`")));
        }

        let record = SettingsRecord::load(&clone_path).map_err(BatchError::Internal)?;
        if record.as_ref().map(|r| r.cidx_aware).unwrap_or(false) {
            let output = ProcessRunner::run(
                &self.config.indexer_cmd,
                &["uninstall"],
                Some(&clone_path),
                &[],
                None,
                Duration::from_secs(60),
            )
            .await;
            if let Err(e) = output {
                tracing::warn!("indexer uninstall for `{name}` failed (continuing): {e}");
            }
        }

        CoWCloner::remove(&clone_path).map_err(BatchError::Internal)?;
        Ok(())
    }

    /// Pull updates on the registered clone (not a job workspace). Called by
    /// the scheduler at the start of a git-aware job; on success the
    /// scheduler re-clones that job's workspace from this now-fresher
    /// source before running it.
    pub fn pull_updates(&self, name: &str) -> git::PullOutcome {
        let clone_path = self.root.join(name);
        git::pull_updates(&clone_path, Duration::from_secs(self.config.git_pull_timeout_secs))
    }
}

async fn run_registration_pipeline(
    config: Arc<Config>,
    name: String,
    git_url: String,
    description: String,
    indexer_aware: bool,
) -> Result<()> {
    let clone_path = config.repositories_root.join(&name);

    let clone_result = {
        let clone_path = clone_path.clone();
        let git_url = git_url.clone();
        let timeout = Duration::from_secs(config.clone_timeout_secs);
        tokio::task::spawn_blocking(move || git::clone_repository(&git_url, &clone_path, timeout))
            .await
            .context("clone task panicked")?
    };

    if let Err(e) = clone_result {
        tracing::error!("git clone of `{name}` failed: {e}");
        CoWCloner::remove(&clone_path).ok();
        return Ok(());
    }

    let mut record = SettingsRecord {
        name: name.clone(),
        description,
        git_url,
        registered_at: Utc::now(),
        clone_status: CloneStatus::Cloning,
        cidx_aware: indexer_aware,
    };
    record.save(&clone_path)?;

    if indexer_aware {
        record.clone_status = CloneStatus::CidxIndexing;
        record.save(&clone_path)?;

        let indexing_ok = run_indexer_pipeline(&config, &clone_path).await;
        if !indexing_ok {
            record.clone_status = CloneStatus::CidxFailed;
            record.save(&clone_path).ok();
            CoWCloner::remove(&clone_path).ok();
            return Ok(());
        }
    }

    record.clone_status = CloneStatus::Completed;
    record.save(&clone_path)?;
    tracing::info!("repository `{name}` registered and ready");
    Ok(())
}

async fn run_indexer_pipeline(config: &Config, clone_path: &Path) -> bool {
    let steps: &[&[&str]] = &[
        &["init", "--embedding-provider", &config.indexer_embedding_provider],
        &["start"],
        &["index", "--reconcile"],
        &["stop"],
    ];

    for args in steps {
        let result = ProcessRunner::run(
            &config.indexer_cmd,
            args,
            Some(clone_path),
            &[],
            None,
            Duration::from_secs(30 * 60),
        )
        .await;

        match result {
            Ok(output) if output.exit_code == 0 => continue,
            Ok(output) => {
                tracing::error!(
                    "indexer step {:?} exited {} for {}: {}",
                    args,
                    output.exit_code,
                    clone_path.display(),
                    output.stderr
                );
                return false;
            }
            Err(e) => {
                tracing::error!("indexer step {:?} failed for {}: {e}", args, clone_path.display());
                return false;
            }
        }
    }

    true
}

fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in walkdir(dir)? {
        if entry.is_file() {
            total += std::fs::metadata(&entry).map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

fn walkdir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> Arc<Config> {
        let mut config = Config::default();
        config.repositories_root = root.join("repositories");
        config.jobs_root = root.join("jobs");
        Arc::new(config)
    }

    #[test]
    fn list_is_empty_for_fresh_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = RepositoryRegistry::new(config);
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn list_reports_settings_backed_repository() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clone_path = config.repositories_root.join("demo");
        std::fs::create_dir_all(&clone_path).unwrap();

        let record = SettingsRecord {
            name: "demo".to_string(),
            description: "desc".to_string(),
            git_url: "https://example.test/demo.git".to_string(),
            registered_at: Utc::now(),
            clone_status: CloneStatus::Completed,
            cidx_aware: false,
        };
        record.save(&clone_path).unwrap();

        let registry = RepositoryRegistry::new(config);
        let repositories = registry.list().unwrap();
        assert_eq!(repositories.len(), 1);
        assert_eq!(repositories[0].name, "demo");
        assert_eq!(repositories[0].clone_status, CloneStatus::Completed);
    }

    #[test]
    fn list_marks_settings_less_git_dir_as_cloning() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clone_path = config.repositories_root.join("in-flight");
        std::fs::create_dir_all(&clone_path).unwrap();

        let registry = RepositoryRegistry::new(config);
        let repositories = registry.list().unwrap();
        assert_eq!(repositories[0].clone_status, CloneStatus::Cloning);
    }

    #[tokio::test]
    async fn register_rejects_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = RepositoryRegistry::new(config);
        let result = registry
            .register("bad name!", "https://example.test/x.git", "", false)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn register_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.repositories_root.join("demo")).unwrap();
        let registry = RepositoryRegistry::new(config);
        let result = registry
            .register("demo", "https://example.test/demo.git", "", false)
            .await;
        assert!(matches!(result, Err(BatchError::Conflict(_))));
    }

    #[tokio::test]
    async fn unregister_missing_repository_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = RepositoryRegistry::new(config);
        let result = registry.unregister("nope").await;
        assert!(matches!(result, Err(BatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn unregister_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clone_path = config.repositories_root.join("demo");
        std::fs::create_dir_all(&clone_path).unwrap();
        let record = SettingsRecord {
            name: "demo".to_string(),
            description: String::new(),
            git_url: "https://example.test/demo.git".to_string(),
            registered_at: Utc::now(),
            clone_status: CloneStatus::Completed,
            cidx_aware: false,
        };
        record.save(&clone_path).unwrap();

        let registry = RepositoryRegistry::new(config);
        registry.unregister("demo").await.unwrap();
        assert!(!clone_path.exists());
    }
}
