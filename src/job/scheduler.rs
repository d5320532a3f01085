//! The job state machine: bounded-concurrency dispatch, preparation-phase
//! ordering, cancellation, and timeouts.
//!
//! A single dispatch loop owns dequeuing and semaphore acquisition, so FIFO
//! order is preserved regardless of how many `start_job` calls race each
//! other. Once a permit is acquired, a per-job worker task owns every
//! further transition for that job — no job's status field is ever written
//! by two tasks at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use uuid::Uuid;

use crate::config::Config;
use crate::cow::CoWCloner;
use crate::error::{BatchError, BatchResult};
use crate::fsprobe::{CloneStrategy, FilesystemProbe};
use crate::git::PullOutcome;
use crate::process::ProcessRunner;
use crate::repo::{CloneStatus, RepositoryRegistry};
use crate::staging::UploadStaging;
use crate::validation::valid_upload_filename;

use super::executor::{CompletionProbe, ExecutionOutcome, PromptExecutor};
use super::store::JobStore;
use super::{Job, JobOptions, JobStatus};

pub struct JobScheduler {
    config: Arc<Config>,
    store: Arc<JobStore>,
    repositories: Arc<RepositoryRegistry>,
    staging: Arc<UploadStaging>,
    executor: PromptExecutor,
    semaphore: Arc<Semaphore>,
    queue: Arc<AsyncMutex<VecDeque<Uuid>>>,
    notify: Arc<Notify>,
    /// Probed once at construction time and reused for every `create_job`
    /// call — filesystem capability doesn't change mid-process, so
    /// re-probing per job would just be repeated, pointless `cp` spawns.
    clone_strategy: CloneStrategy,
}

impl JobScheduler {
    /// Builds the scheduler and spawns its dispatch loop. Returned wrapped
    /// in `Arc` since the loop holds a clone of `self` for its lifetime.
    pub fn spawn(
        config: Arc<Config>,
        store: Arc<JobStore>,
        repositories: Arc<RepositoryRegistry>,
        staging: Arc<UploadStaging>,
    ) -> Arc<Self> {
        let clone_strategy = FilesystemProbe::probe_reflink_support(&config.repositories_root);

        let scheduler = Arc::new(Self {
            executor: PromptExecutor::new(Arc::clone(&config)),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            queue: Arc::new(AsyncMutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            clone_strategy,
            config,
            store,
            repositories,
            staging,
        });

        let dispatcher = Arc::clone(&scheduler);
        tokio::spawn(async move { dispatcher.dispatch_loop().await });

        scheduler
    }

    /// Resumes monitoring a job the recovery coordinator adopted as
    /// `Running`: spawns the same completion-polling loop a freshly
    /// dispatched job gets, without taking a concurrency permit — the
    /// assistant CLI is already running, and the slot it would have
    /// occupied was consumed by the process that crashed.
    pub fn resume_monitoring(self: &Arc<Self>, job: Job, timeout_duration: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.poll_until_complete(job, timeout_duration).await;
        });
    }

    pub async fn create_job(
        &self,
        user: &str,
        repository: &str,
        prompt: &str,
        options: JobOptions,
    ) -> BatchResult<Job> {
        let repo = self
            .repositories
            .get(repository)
            .map_err(BatchError::Internal)?
            .ok_or_else(|| BatchError::not_found(format!("repository `{repository}`")))?;

        if repo.clone_status != CloneStatus::Completed {
            return Err(BatchError::invalid_input(format!(
                "repository `{repository}` is not ready (status: {})",
                repo.clone_status
            )));
        }

        let job = Job::new(user, repository, prompt, options, &self.config.jobs_root);

        CoWCloner::new(self.clone_strategy)
            .clone(&repo.clone_path, &job.workspace_path)
            .map_err(BatchError::Internal)?;

        self.store.save(job.clone()).map_err(BatchError::Internal)?;
        Ok(job)
    }

    pub fn upload_file<R: std::io::Read>(
        &self,
        user: &str,
        job_id: Uuid,
        filename: &str,
        reader: &mut R,
        overwrite: bool,
    ) -> BatchResult<()> {
        valid_upload_filename(filename)?;
        let mut job = self.authorized_job(user, job_id)?;

        self.staging.stage(job_id, filename, reader, self.config.max_upload_bytes, overwrite)?;

        if !job.uploaded_filenames.iter().any(|f| f == filename) {
            job.uploaded_filenames.push(filename.to_string());
        }
        self.store.save(job).map_err(BatchError::Internal)?;
        Ok(())
    }

    pub async fn start_job(&self, user: &str, job_id: Uuid) -> BatchResult<()> {
        let mut job = self.authorized_job(user, job_id)?;
        if job.status != JobStatus::Created {
            return Err(BatchError::Conflict(format!(
                "job {job_id} cannot be started from status `{}`",
                job.status
            )));
        }

        job.status = JobStatus::Queued;
        self.store.save(job).map_err(BatchError::Internal)?;

        {
            let mut queue = self.queue.lock().await;
            queue.push_back(job_id);
        }
        self.recompute_queue_positions().await;
        self.notify.notify_one();
        Ok(())
    }

    pub async fn cancel_job(&self, user: &str, job_id: Uuid, reason: Option<String>) -> BatchResult<()> {
        let mut job = self.authorized_job(user, job_id)?;
        if job.status.is_terminal() {
            return Err(BatchError::Conflict(format!("job {job_id} is already terminal")));
        }

        job.cancelled_at = Some(Utc::now());
        job.cancel_reason = Some(reason.unwrap_or_else(|| "cancelled by user".to_string()));

        if matches!(job.status, JobStatus::Created | JobStatus::Queued) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.pid = None;

            let mut queue = self.queue.lock().await;
            queue.retain(|id| *id != job_id);
            drop(queue);
            self.recompute_queue_positions().await;
        } else {
            job.status = JobStatus::Cancelling;
            if let Some(pid) = job.pid {
                ProcessRunner::terminate_process_group(pid);
            }
        }

        self.store.save(job).map_err(BatchError::Internal)?;
        Ok(())
    }

    pub async fn delete_job(&self, user: &str, job_id: Uuid) -> BatchResult<()> {
        let job = self.authorized_job(user, job_id)?;

        if !job.status.is_terminal() {
            if let Some(pid) = job.pid {
                ProcessRunner::terminate_process_group(pid);
            }
        }

        if job.options.indexer_aware && job.workspace_path.exists() {
            let result = ProcessRunner::run(
                &self.config.indexer_cmd,
                &["stop"],
                Some(&job.workspace_path),
                &[],
                None,
                Duration::from_secs(30),
            )
            .await;
            if let Err(e) = result {
                tracing::warn!("indexer stop for job {job_id} failed (continuing): {e}");
            }
        }

        CoWCloner::remove(&job.workspace_path).map_err(BatchError::Internal)?;
        self.staging.cleanup(job_id).ok();
        self.store.delete(job_id).map_err(BatchError::Internal)?;
        Ok(())
    }

    /// Administrative sweep: force-terminates and reclaims the workspace of
    /// any non-terminal job older than `job_age_timeout_hours`, regardless
    /// of its current phase. Unlike `delete_job`, the durable record is kept
    /// (as `Terminated`) rather than removed — this is resource cleanup, not
    /// a user-requested deletion. Returns the number of jobs swept.
    pub async fn enforce_age_limits(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.job_age_timeout_hours as i64);
        let stale: Vec<Job> = self
            .store
            .load_all()
            .into_iter()
            .filter(|j| !j.status.is_terminal() && j.created_at < cutoff)
            .collect();

        for job in &stale {
            tracing::warn!(
                "job {} exceeded the administrative age limit ({}h); forcing cleanup",
                job.id,
                self.config.job_age_timeout_hours
            );

            {
                let mut queue = self.queue.lock().await;
                queue.retain(|id| *id != job.id);
            }

            if let Some(pid) = job.pid {
                ProcessRunner::terminate_process_group(pid);
            }
            if job.options.indexer_aware && job.workspace_path.exists() {
                let result = ProcessRunner::run(
                    &self.config.indexer_cmd,
                    &["stop"],
                    Some(&job.workspace_path),
                    &[],
                    None,
                    Duration::from_secs(30),
                )
                .await;
                if let Err(e) = result {
                    tracing::warn!("indexer stop for job {} failed (continuing): {e}", job.id);
                }
            }

            CoWCloner::remove(&job.workspace_path).ok();
            self.staging.cleanup(job.id).ok();

            let mut job = job.clone();
            job.status = JobStatus::Terminated;
            job.completed_at = Some(Utc::now());
            job.pid = None;
            self.store.save(job).ok();
        }

        self.recompute_queue_positions().await;
        stale.len()
    }

    pub fn get_status(&self, user: &str, job_id: Uuid) -> BatchResult<Job> {
        self.authorized_job(user, job_id)
    }

    pub fn list_user_jobs(&self, user: &str) -> Vec<Job> {
        self.store.load_for_user(user)
    }

    fn authorized_job(&self, user: &str, job_id: Uuid) -> BatchResult<Job> {
        let job = self
            .store
            .load(job_id)
            .map_err(BatchError::Internal)?
            .ok_or_else(|| BatchError::not_found(format!("job {job_id}")))?;
        if job.user != user {
            return Err(BatchError::Unauthorized(user.to_string()));
        }
        Ok(job)
    }

    async fn recompute_queue_positions(&self) {
        let queue = self.queue.lock().await;
        for (idx, id) in queue.iter().enumerate() {
            if let Ok(Some(mut job)) = self.store.load(*id) {
                job.queue_position = (idx + 1) as u32;
                let _ = self.store.save(job);
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };

            let job_id = match next {
                Some(id) => id,
                None => {
                    self.notify.notified().await;
                    continue;
                }
            };

            let job = match self.store.load(job_id) {
                Ok(Some(job)) if job.status == JobStatus::Queued => job,
                _ => continue,
            };

            self.recompute_queue_positions().await;

            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => continue,
            };

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.run_job(job).await;
                drop(permit);
            });
        }
    }

    /// Drives one job through preparation and execution to a terminal state.
    /// Owns every write to this job's status for its entire lifetime.
    async fn run_job(&self, mut job: Job) {
        if job.options.git_aware {
            job.status = JobStatus::GitPulling;
            self.store.save(job.clone()).ok();

            match self.repositories.pull_updates(&job.repository) {
                PullOutcome::Failed => {
                    job.status = JobStatus::GitFailed;
                    self.store.save(job.clone()).ok();
                    self.finish(job, JobStatus::Failed, None, "git pull failed".to_string()).await;
                    return;
                }
                PullOutcome::Pulled => {
                    // The workspace was cloned at `create_job` time, before
                    // this pull landed. Re-clone it now from the freshly
                    // pulled registered repo so the job runs against the
                    // content the pull brought in, not what was there when
                    // the job was created.
                    let repo = match self.repositories.get(&job.repository) {
                        Ok(Some(repo)) => repo,
                        Ok(None) => {
                            self.finish(
                                job,
                                JobStatus::Failed,
                                None,
                                "repository was unregistered during git pull".to_string(),
                            )
                            .await;
                            return;
                        }
                        Err(e) => {
                            self.finish(
                                job,
                                JobStatus::Failed,
                                None,
                                format!("failed to reload repository after git pull: {e}"),
                            )
                            .await;
                            return;
                        }
                    };

                    if let Err(e) = CoWCloner::new(self.clone_strategy).clone(&repo.clone_path, &job.workspace_path) {
                        self.finish(
                            job,
                            JobStatus::Failed,
                            None,
                            format!("failed to refresh workspace after git pull: {e}"),
                        )
                        .await;
                        return;
                    }
                }
                PullOutcome::NotGitRepo => {}
            }
        }

        if self.cancellation_requested(job.id) {
            self.finalize_cancelled(job).await;
            return;
        }

        // Uploads drain after any git-triggered re-clone above, since a
        // re-clone wipes and recreates `files/` wholesale.
        if let Err(e) = self.staging.drain(job.id, &job.workspace_path) {
            tracing::warn!("upload drain failed for job {}: {e}", job.id);
        }
        self.staging.cleanup(job.id).ok();

        let mut indexer_ready = None;
        if job.options.indexer_aware {
            job.status = JobStatus::CidxIndexing;
            self.store.save(job.clone()).ok();

            let prep_ok = self.prepare_indexer(&job).await;
            let ready = prep_ok && self.executor.probe_indexer_ready(&job.workspace_path).await;
            indexer_ready = Some(ready);
            job.cidx_status = Some(if ready { "ready".to_string() } else { "failed".to_string() });
            if ready {
                job.status = JobStatus::CidxReady;
                self.store.save(job.clone()).ok();
            }
        }

        if self.cancellation_requested(job.id) {
            self.finalize_cancelled(job).await;
            return;
        }

        job.status = JobStatus::Running;
        self.store.save(job.clone()).ok();

        let timeout_duration = Duration::from_secs(
            job.options
                .timeout_seconds
                .unwrap_or(self.config.default_job_timeout_seconds),
        );

        match self.executor.execute(&job, indexer_ready).await {
            Ok(ExecutionOutcome::Completed { exit_code, output }) => {
                let status = if exit_code == 0 { JobStatus::Completed } else { JobStatus::Failed };
                self.finish(job, status, Some(exit_code), output).await;
            }
            Ok(ExecutionOutcome::Launched(pid)) => {
                job.pid = Some(pid);
                self.store.save(job.clone()).ok();
                self.poll_until_complete(job, timeout_duration).await;
            }
            Err(e) => {
                self.finish(job, JobStatus::Failed, None, format!("failed to launch assistant CLI: {e}"))
                    .await;
            }
        }
    }

    async fn prepare_indexer(&self, job: &Job) -> bool {
        let steps: &[&[&str]] = &[&["fix-config", "--force"], &["start"], &["index", "--reconcile"]];

        for args in steps {
            let result = ProcessRunner::run(
                &self.config.indexer_cmd,
                args,
                Some(&job.workspace_path),
                &[],
                None,
                Duration::from_secs(30 * 60),
            )
            .await;

            match result {
                Ok(output) if output.exit_code == 0 => continue,
                _ => return false,
            }
        }
        true
    }

    async fn poll_until_complete(&self, mut job: Job, timeout_duration: Duration) {
        let deadline = Instant::now() + timeout_duration;

        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;

            if self.cancellation_requested(job.id) {
                if let Some(pid) = job.pid {
                    ProcessRunner::terminate_process_group(pid);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.finish(job, JobStatus::Cancelled, None, String::new()).await;
                return;
            }

            match self.executor.check_completion(&job) {
                CompletionProbe::StillRunning => {
                    if Instant::now() >= deadline {
                        if let Some(pid) = job.pid {
                            ProcessRunner::terminate_process_group(pid);
                        }
                        self.finish(job, JobStatus::Timeout, None, String::new()).await;
                        return;
                    }
                }
                CompletionProbe::Completed { exit_code, output } => {
                    let status = if exit_code == 0 { JobStatus::Completed } else { JobStatus::Failed };
                    self.finish(job, status, Some(exit_code), output).await;
                    return;
                }
                CompletionProbe::DiedWithoutSentinel { output } => {
                    let message = if output.trim().is_empty() {
                        "Process died unexpectedly during execution".to_string()
                    } else {
                        output
                    };
                    self.finish(job, JobStatus::Failed, None, message).await;
                    return;
                }
            }
        }
    }

    fn cancellation_requested(&self, job_id: Uuid) -> bool {
        matches!(self.store.load(job_id), Ok(Some(j)) if j.status == JobStatus::Cancelling)
    }

    async fn finalize_cancelled(&self, job: Job) {
        self.finish(job, JobStatus::Cancelled, None, String::new()).await;
    }

    async fn finish(&self, mut job: Job, status: JobStatus, exit_code: Option<i32>, output: String) {
        job.status = status;
        job.completed_at = Some(Utc::now());
        job.pid = None;
        if exit_code.is_some() {
            job.exit_code = exit_code;
        }
        if !output.is_empty() {
            job.output = output;
        }
        self.store.save(job).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::SettingsRecord;
    use std::path::Path;

    fn test_config(root: &Path) -> Arc<Config> {
        let mut config = Config::default();
        config.repositories_root = root.join("repositories");
        config.jobs_root = root.join("jobs");
        config.max_concurrent = 2;
        Arc::new(config)
    }

    fn completed_repo(config: &Config, name: &str) {
        let clone_path = config.repositories_root.join(name);
        std::fs::create_dir_all(&clone_path).unwrap();
        std::fs::write(clone_path.join("README.md"), "hello").unwrap();
        let record = SettingsRecord {
            name: name.to_string(),
            description: String::new(),
            git_url: "https://example.test/repo.git".to_string(),
            registered_at: Utc::now(),
            clone_status: CloneStatus::Completed,
            cidx_aware: false,
        };
        record.save(&clone_path).unwrap();
    }

    fn build_scheduler(dir: &Path) -> (Arc<JobScheduler>, Arc<Config>) {
        let config = test_config(dir);
        let store = Arc::new(JobStore::new(config.jobs_root.clone()));
        let repositories = Arc::new(RepositoryRegistry::new(Arc::clone(&config)));
        let staging = Arc::new(UploadStaging::new(config.jobs_root.clone()));
        (JobScheduler::spawn(Arc::clone(&config), store, repositories, staging), config)
    }

    #[tokio::test]
    async fn create_job_materializes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, config) = build_scheduler(dir.path());
        completed_repo(&config, "repo-a");

        let job = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();

        assert!(job.workspace_path.join("README.md").exists());
        assert!(job.workspace_path.join("files").is_dir());
        assert_eq!(job.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn create_job_rejects_unknown_repository() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _config) = build_scheduler(dir.path());
        let result = scheduler.create_job("alice", "nope", "1+1", JobOptions::default()).await;
        assert!(matches!(result, Err(BatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn start_job_rejects_non_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, config) = build_scheduler(dir.path());
        completed_repo(&config, "repo-a");

        let job = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();

        let result = scheduler.start_job("mallory", job.id).await;
        assert!(matches!(result, Err(BatchError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn cancel_before_start_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, config) = build_scheduler(dir.path());
        completed_repo(&config, "repo-a");

        let job = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();

        scheduler.cancel_job("alice", job.id, None).await.unwrap();
        let status = scheduler.get_status("alice", job.id).unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);
        assert!(status.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_on_terminal_job_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, config) = build_scheduler(dir.path());
        completed_repo(&config, "repo-a");

        let job = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();
        scheduler.cancel_job("alice", job.id, None).await.unwrap();

        let result = scheduler.cancel_job("alice", job.id, None).await;
        assert!(matches!(result, Err(BatchError::Conflict(_))));
    }

    #[tokio::test]
    async fn enforce_age_limits_terminates_stale_non_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, config) = build_scheduler(dir.path());
        completed_repo(&config, "repo-a");

        let fresh = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();

        let mut stale = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();
        stale.created_at = Utc::now() - chrono::Duration::hours(config.job_age_timeout_hours as i64 + 1);
        scheduler.store.save(stale.clone()).unwrap();

        let swept = scheduler.enforce_age_limits().await;
        assert_eq!(swept, 1);

        let stale_status = scheduler.get_status("alice", stale.id).unwrap();
        assert_eq!(stale_status.status, JobStatus::Terminated);
        assert!(!stale_status.workspace_path.exists());

        let fresh_status = scheduler.get_status("alice", fresh.id).unwrap();
        assert_eq!(fresh_status.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn delete_job_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, config) = build_scheduler(dir.path());
        completed_repo(&config, "repo-a");

        let job = scheduler
            .create_job("alice", "repo-a", "1+1", JobOptions::default())
            .await
            .unwrap();
        let workspace = job.workspace_path.clone();

        scheduler.delete_job("alice", job.id).await.unwrap();
        assert!(!workspace.exists());
        assert!(scheduler.get_status("alice", job.id).is_err());
    }
}
