//! `BatchService` — the single façade a transport layer (HTTP, RPC, ...)
//! would sit in front of. It owns the repository registry, job store,
//! scheduler, and upload staging, and exposes one async method per operation
//! named in the external interface: repositories, jobs, and workspace
//! access. No socket or request parsing lives here; that belongs to the
//! (external) façade this struct is built for.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::auth::UserAuthenticator;
use crate::config::Config;
use crate::error::{BatchError, BatchResult};
use crate::job::{Job, JobOptions, JobScheduler, JobStore, RecoveryCoordinator};
use crate::repo::{Repository, RepositoryRegistry};
use crate::staging::UploadStaging;
use crate::workspace::{self, TypeFilter, WorkspaceEntry};

pub struct BatchService {
    config: Arc<Config>,
    repositories: Arc<RepositoryRegistry>,
    store: Arc<JobStore>,
    scheduler: Arc<JobScheduler>,
    authenticator: Arc<dyn UserAuthenticator>,
}

impl BatchService {
    /// Ensures the two global roots exist, reconciles any non-terminal jobs
    /// left over from a previous run, resumes monitoring of jobs recovery
    /// adopted as `Running`, and spawns the scheduler's dispatch loop.
    /// `authenticator` is the caller's contract with the host account
    /// database (PAM or equivalent); this crate only defines the trait.
    pub async fn start(config: Config, authenticator: Arc<dyn UserAuthenticator>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        config.ensure_roots()?;

        let store = Arc::new(JobStore::new(config.jobs_root.clone()));
        let repositories = Arc::new(RepositoryRegistry::new(Arc::clone(&config)));
        let staging = Arc::new(UploadStaging::new(config.jobs_root.clone()));

        let recovery = RecoveryCoordinator::new(Arc::clone(&store));
        let recovered = recovery.recover()?;
        for job in &recovered {
            tracing::info!("recovered job {} as `{}`", job.id, job.status);
        }

        let scheduler = JobScheduler::spawn(Arc::clone(&config), Arc::clone(&store), Arc::clone(&repositories), staging);

        for job in recovered.into_iter().filter(|j| j.status == crate::job::JobStatus::Running) {
            let timeout_duration = Duration::from_secs(
                job.options.timeout_seconds.unwrap_or(config.default_job_timeout_seconds),
            );
            scheduler.resume_monitoring(job, timeout_duration);
        }

        Ok(Self {
            config,
            repositories,
            store,
            scheduler,
            authenticator,
        })
    }

    /// Verifies `credential` for `user` against the configured authenticator.
    pub async fn authenticate(&self, user: &str, credential: &str) -> BatchResult<bool> {
        self.authenticator.authenticate(user, credential).await.map_err(BatchError::Internal)
    }

    // -- Repositories ----------------------------------------------------

    pub async fn register_repository(
        &self,
        name: &str,
        url: &str,
        description: &str,
        indexer_aware: bool,
    ) -> BatchResult<Repository> {
        self.repositories.register(name, url, description, indexer_aware).await
    }

    pub async fn unregister_repository(&self, name: &str) -> BatchResult<()> {
        self.repositories.unregister(name).await
    }

    pub fn list_repositories(&self) -> BatchResult<Vec<Repository>> {
        self.repositories.list_with_metadata(true).map_err(BatchError::Internal)
    }

    pub fn get_repository(&self, name: &str) -> BatchResult<Repository> {
        self.repositories
            .get(name)
            .map_err(BatchError::Internal)?
            .ok_or_else(|| BatchError::not_found(format!("repository `{name}`")))
    }

    // -- Jobs --------------------------------------------------------------

    pub async fn create_job(
        &self,
        user: &str,
        repository: &str,
        prompt: &str,
        options: JobOptions,
    ) -> BatchResult<Job> {
        self.scheduler.create_job(user, repository, prompt, options).await
    }

    pub async fn start_job(&self, user: &str, job_id: Uuid) -> BatchResult<()> {
        self.scheduler.start_job(user, job_id).await
    }

    pub async fn cancel_job(&self, user: &str, job_id: Uuid, reason: Option<String>) -> BatchResult<()> {
        self.scheduler.cancel_job(user, job_id, reason).await
    }

    pub async fn delete_job(&self, user: &str, job_id: Uuid) -> BatchResult<()> {
        self.scheduler.delete_job(user, job_id).await
    }

    pub fn get_job_status(&self, user: &str, job_id: Uuid) -> BatchResult<Job> {
        self.scheduler.get_status(user, job_id)
    }

    pub fn list_user_jobs(&self, user: &str) -> Vec<Job> {
        self.scheduler.list_user_jobs(user)
    }

    // -- Workspace access ----------------------------------------------------

    pub fn upload_file<R: std::io::Read>(
        &self,
        user: &str,
        job_id: Uuid,
        filename: &str,
        reader: &mut R,
        overwrite: bool,
    ) -> BatchResult<()> {
        self.scheduler.upload_file(user, job_id, filename, reader, overwrite)
    }

    pub fn list_workspace(
        &self,
        user: &str,
        job_id: Uuid,
        path: &str,
        mask: Option<&str>,
        depth: u32,
        type_filter: TypeFilter,
    ) -> BatchResult<Vec<WorkspaceEntry>> {
        let job = self.owned_job(user, job_id)?;
        workspace::list_workspace(&job.workspace_path, path, mask, depth, type_filter)
    }

    pub fn download_workspace_file(&self, user: &str, job_id: Uuid, path: &str) -> BatchResult<PathBuf> {
        let job = self.owned_job(user, job_id)?;
        workspace::resolve_download(&job.workspace_path, path)
    }

    pub fn read_workspace_file_text(&self, user: &str, job_id: Uuid, path: &str) -> BatchResult<String> {
        let job = self.owned_job(user, job_id)?;
        workspace::read_text(&job.workspace_path, path)
    }

    fn owned_job(&self, user: &str, job_id: Uuid) -> BatchResult<Job> {
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

    /// Deletes durable records for terminal jobs past the configured
    /// retention horizon. Intended to be called periodically by the binary's
    /// maintenance loop.
    pub fn cleanup_retention(&self) -> anyhow::Result<usize> {
        self.store.cleanup_retention(self.config.retention_days)
    }

    /// Force-terminates and reclaims the workspace of any job older than
    /// `job_age_timeout_hours`, regardless of phase. Intended to be called
    /// periodically alongside [`Self::cleanup_retention`].
    pub async fn enforce_age_limits(&self) -> usize {
        self.scheduler.enforce_age_limits().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllAuthenticator;
    use crate::repo::{CloneStatus, SettingsRecord};
    use chrono::Utc;

    async fn started_service(root: &std::path::Path) -> BatchService {
        let mut config = Config::default();
        config.repositories_root = root.join("repositories");
        config.jobs_root = root.join("jobs");
        BatchService::start(config, Arc::new(AllowAllAuthenticator)).await.unwrap()
    }

    fn completed_repo(service: &BatchService, name: &str) {
        let clone_path = service.config().repositories_root.join(name);
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

    #[tokio::test]
    async fn create_and_inspect_job_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let service = started_service(dir.path()).await;
        completed_repo(&service, "repo-a");

        let job = service
            .create_job("alice", "repo-a", "summarize the README", JobOptions::default())
            .await
            .unwrap();

        let entries = service
            .list_workspace("alice", job.id, "", None, 5, TypeFilter::All)
            .unwrap();
        assert!(entries.iter().any(|e| e.path == "README.md"));

        let text = service.read_workspace_file_text("alice", job.id, "README.md").unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn workspace_access_rejects_non_owner() {
        let dir = tempfile::tempdir().unwrap();
        let service = started_service(dir.path()).await;
        completed_repo(&service, "repo-a");

        let job = service
            .create_job("alice", "repo-a", "hello", JobOptions::default())
            .await
            .unwrap();

        let result = service.list_workspace("mallory", job.id, "", None, 5, TypeFilter::All);
        assert!(matches!(result, Err(BatchError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn authenticate_delegates_to_configured_authenticator() {
        let dir = tempfile::tempdir().unwrap();
        let service = started_service(dir.path()).await;
        assert!(service.authenticate("alice", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn get_repository_surfaces_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = started_service(dir.path()).await;
        let result = service.get_repository("nope");
        assert!(matches!(result, Err(BatchError::NotFound(_))));
    }
}
