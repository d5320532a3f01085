//! In-memory job index backed by durable per-job JSON records on disk.
//!
//! Durable records are a projection, not an authority: the in-memory map is
//! rebuilt from `<jobsRoot>/<uuid>.job.json` files (plus whatever the
//! recovery coordinator decides about in-flight artifacts) on every boot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use super::Job;

pub struct JobStore {
    jobs_root: PathBuf,
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    pub fn new(jobs_root: PathBuf) -> Self {
        Self {
            jobs_root,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.jobs_root.join(format!("{id}.job.json"))
    }

    /// Persist `job` to disk and update the in-memory index.
    pub fn save(&self, job: Job) -> Result<()> {
        std::fs::create_dir_all(&self.jobs_root)
            .with_context(|| format!("failed to create {}", self.jobs_root.display()))?;

        let path = self.record_path(job.id);
        let content = serde_json::to_string_pretty(&job).context("failed to serialize job record")?;
        std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;

        self.jobs.write().unwrap().insert(job.id, job);
        Ok(())
    }

    /// Look up a job, preferring the in-memory copy.
    pub fn load(&self, id: Uuid) -> Result<Option<Job>> {
        if let Some(job) = self.jobs.read().unwrap().get(&id) {
            return Ok(Some(job.clone()));
        }
        self.load_from_disk(id)
    }

    fn load_from_disk(&self, id: Uuid) -> Result<Option<Job>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let job: Job = serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(job))
    }

    /// Populate the in-memory index from every `*.job.json` record on disk,
    /// skipping (and warning about) any that fail to parse. Returns the
    /// loaded jobs, newest-first.
    pub fn load_all_from_disk(&self) -> Result<Vec<Job>> {
        if !self.jobs_root.exists() {
            return Ok(Vec::new());
        }

        let mut loaded = Vec::new();
        for entry in std::fs::read_dir(&self.jobs_root)
            .with_context(|| format!("failed to read {}", self.jobs_root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if !path.to_string_lossy().ends_with(".job.json") {
                continue;
            }

            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<Job>(&content) {
                    Ok(job) => loaded.push(job),
                    Err(e) => tracing::warn!("skipping corrupted job record {}: {e}", path.display()),
                },
                Err(e) => tracing::warn!("failed to read job record {}: {e}", path.display()),
            }
        }

        let mut index = self.jobs.write().unwrap();
        for job in &loaded {
            index.insert(job.id, job.clone());
        }
        drop(index);

        loaded.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(loaded)
    }

    /// All jobs currently in the in-memory index, newest-first.
    pub fn load_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Jobs owned by `user`, newest-first.
    pub fn load_for_user(&self, user: &str) -> Vec<Job> {
        self.load_all().into_iter().filter(|j| j.user == user).collect()
    }

    /// Remove a job's durable record and drop it from the in-memory index.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.jobs.write().unwrap().remove(&id);
        let path = self.record_path(id);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Delete durable records (and drop from the index) for every job in a
    /// terminal state whose `completed_at` is older than `retention_days`.
    /// Returns the number of jobs removed.
    pub fn cleanup_retention(&self, retention_days: u64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let stale: Vec<Uuid> = self
            .load_all()
            .into_iter()
            .filter(|j| j.status.is_terminal())
            .filter(|j| j.completed_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|j| j.id)
            .collect();

        for id in &stale {
            self.delete(*id)?;
        }
        Ok(stale.len())
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }
}
