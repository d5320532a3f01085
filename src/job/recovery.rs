//! Startup reconciliation of non-terminal jobs against on-disk artifacts.
//!
//! Recovery never resumes a phase from the middle — it only ever observes
//! what's already on disk (a completion sentinel, a live PID, or neither)
//! and assigns the corresponding status. Running it twice in a row yields
//! the same result, since the second pass only ever sees terminal jobs.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::process::ProcessRunner;

use super::executor::extract_sentinel;
use super::store::JobStore;
use super::{Job, JobStatus};

pub struct RecoveryCoordinator {
    store: Arc<JobStore>,
}

impl RecoveryCoordinator {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Loads every persisted job, reconciles each non-terminal one against
    /// its output file and PID file, and returns the jobs it touched in
    /// their new states. Terminal jobs are left untouched and excluded from
    /// the result.
    pub fn recover(&self) -> Result<Vec<Job>> {
        let jobs = self.store.load_all_from_disk()?;
        let mut recovered = Vec::new();

        for mut job in jobs {
            if job.status.is_terminal() {
                continue;
            }

            let raw_output = std::fs::read_to_string(job.output_path()).unwrap_or_default();
            if let Some((exit_code, stripped)) = extract_sentinel(&raw_output) {
                job.status = if exit_code == 0 { JobStatus::Completed } else { JobStatus::Failed };
                job.exit_code = Some(exit_code);
                job.output = stripped;
                job.completed_at = Some(Utc::now());
                job.pid = None;
                self.store.save(job.clone())?;
                recovered.push(job);
                continue;
            }

            let pid_from_file = std::fs::read_to_string(job.pid_path())
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());

            match pid_from_file {
                Some(pid) if ProcessRunner::is_alive(pid) => {
                    job.status = JobStatus::Running;
                    job.pid = Some(pid);
                    self.store.save(job.clone())?;
                    recovered.push(job);
                }
                Some(_) => {
                    job.status = JobStatus::Failed;
                    job.output = "Process died unexpectedly during execution".to_string();
                    job.completed_at = Some(Utc::now());
                    job.pid = None;
                    self.store.save(job.clone())?;
                    recovered.push(job);
                }
                None => {
                    job.status = JobStatus::Failed;
                    job.output = "Job failed to start properly".to_string();
                    job.completed_at = Some(Utc::now());
                    job.pid = None;
                    self.store.save(job.clone())?;
                    recovered.push(job);
                }
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use std::path::Path;

    fn job_with_workspace(jobs_root: &Path, status: JobStatus) -> Job {
        let mut job = Job::new("alice", "repo-a", "hello", JobOptions::default(), jobs_root);
        job.status = status;
        std::fs::create_dir_all(&job.workspace_path).unwrap();
        job
    }

    #[test]
    fn completed_sentinel_marks_job_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().to_path_buf()));
        let job = job_with_workspace(dir.path(), JobStatus::Running);
        std::fs::write(job.output_path(), "hi there\nExit code: 0\n").unwrap();
        store.save(job.clone()).unwrap();

        let coordinator = RecoveryCoordinator::new(Arc::clone(&store));
        let recovered = coordinator.recover().unwrap();

        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Completed);
        assert_eq!(recovered[0].output, "hi there\n");
        assert!(recovered[0].pid.is_none());
    }

    #[test]
    fn failing_sentinel_marks_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().to_path_buf()));
        let job = job_with_workspace(dir.path(), JobStatus::Running);
        std::fs::write(job.output_path(), "boom\nExit code: 1\n").unwrap();
        store.save(job.clone()).unwrap();

        let coordinator = RecoveryCoordinator::new(Arc::clone(&store));
        let recovered = coordinator.recover().unwrap();
        assert_eq!(recovered[0].status, JobStatus::Failed);
        assert_eq!(recovered[0].exit_code, Some(1));
    }

    #[test]
    fn live_pid_without_sentinel_is_adopted_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().to_path_buf()));
        let job = job_with_workspace(dir.path(), JobStatus::Running);

        let pid = ProcessRunner::spawn_detached("sleep", &["2"], None, &[]).unwrap();
        std::fs::write(job.pid_path(), pid.to_string()).unwrap();
        store.save(job.clone()).unwrap();

        let coordinator = RecoveryCoordinator::new(Arc::clone(&store));
        let recovered = coordinator.recover().unwrap();
        assert_eq!(recovered[0].status, JobStatus::Running);
        assert_eq!(recovered[0].pid, Some(pid));
    }

    #[test]
    fn dead_pid_without_sentinel_fails_with_synthetic_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().to_path_buf()));
        let job = job_with_workspace(dir.path(), JobStatus::Running);
        std::fs::write(job.pid_path(), "999999").unwrap();
        store.save(job.clone()).unwrap();

        let coordinator = RecoveryCoordinator::new(Arc::clone(&store));
        let recovered = coordinator.recover().unwrap();
        assert_eq!(recovered[0].status, JobStatus::Failed);
        assert_eq!(recovered[0].output, "Process died unexpectedly during execution");
    }

    #[test]
    fn no_artifacts_at_all_fails_with_startup_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().to_path_buf()));
        let job = job_with_workspace(dir.path(), JobStatus::Queued);
        store.save(job.clone()).unwrap();

        let coordinator = RecoveryCoordinator::new(Arc::clone(&store));
        let recovered = coordinator.recover().unwrap();
        assert_eq!(recovered[0].status, JobStatus::Failed);
        assert_eq!(recovered[0].output, "Job failed to start properly");
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().to_path_buf()));
        let job = job_with_workspace(dir.path(), JobStatus::Running);
        std::fs::write(job.output_path(), "done\nExit code: 0\n").unwrap();
        store.save(job).unwrap();

        let coordinator = RecoveryCoordinator::new(Arc::clone(&store));
        let first = coordinator.recover().unwrap();
        let second = coordinator.recover().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }
}
