//! The job data model and its four collaborators: the durable store, the
//! prompt executor, the scheduler, and startup recovery.

pub mod executor;
pub mod recovery;
pub mod scheduler;
pub mod store;

pub use executor::PromptExecutor;
pub use recovery::RecoveryCoordinator;
pub use scheduler::JobScheduler;
pub use store::JobStore;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The observable lifecycle state of a job. Once a job reaches a terminal
/// variant it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    GitPulling,
    GitFailed,
    CidxIndexing,
    CidxReady,
    Running,
    Cancelling,
    Completed,
    Failed,
    Timeout,
    Terminated,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Timeout
                | JobStatus::Terminated
                | JobStatus::Cancelled
        )
    }

    /// Workspace-bearing, non-terminal states: a job in one of these
    /// necessarily has a materialized workspace on disk.
    pub fn has_workspace(self) -> bool {
        matches!(
            self,
            JobStatus::Created
                | JobStatus::Queued
                | JobStatus::GitPulling
                | JobStatus::CidxIndexing
                | JobStatus::CidxReady
                | JobStatus::Running
                | JobStatus::Cancelling
        ) || self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::GitPulling => "git_pulling",
            JobStatus::GitFailed => "git_failed",
            JobStatus::CidxIndexing => "cidx_indexing",
            JobStatus::CidxReady => "cidx_ready",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Terminated => "terminated",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-job options supplied at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub git_aware: bool,
    #[serde(default)]
    pub indexer_aware: bool,
    #[serde(default)]
    pub environment_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user: String,
    pub repository: String,
    pub prompt: String,
    pub title: String,
    pub uploaded_filenames: Vec<String>,
    pub options: JobOptions,
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub queue_position: u32,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub pid: Option<u32>,
    pub cidx_status: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Job {
    pub fn new(
        user: impl Into<String>,
        repository: impl Into<String>,
        prompt: impl Into<String>,
        options: JobOptions,
        jobs_root: &std::path::Path,
    ) -> Self {
        let id = Uuid::new_v4();
        let prompt = prompt.into();
        Self {
            id,
            user: user.into(),
            repository: repository.into(),
            title: generate_title(&prompt),
            prompt,
            uploaded_filenames: Vec::new(),
            options,
            workspace_path: jobs_root.join(id.to_string()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            queue_position: 0,
            status: JobStatus::Created,
            exit_code: None,
            output: String::new(),
            pid: None,
            cidx_status: None,
            cancelled_at: None,
            cancel_reason: None,
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.workspace_path.join(format!(".claude-job-{}.sh", self.id))
    }

    pub fn output_path(&self) -> PathBuf {
        self.workspace_path.join(format!(".claude-job-{}.output", self.id))
    }

    pub fn pid_path(&self) -> PathBuf {
        self.workspace_path.join(format!(".claude-job-{}.pid", self.id))
    }
}

/// A short, human-readable title derived from the first line of a prompt.
fn generate_title(prompt: &str) -> String {
    const MAX_LEN: usize = 60;
    let first_line = prompt.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Untitled job".to_string();
    }
    if first_line.chars().count() <= MAX_LEN {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(MAX_LEN).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_from_short_prompt() {
        assert_eq!(generate_title("fix the bug"), "fix the bug");
    }

    #[test]
    fn title_from_empty_prompt() {
        assert_eq!(generate_title(""), "Untitled job");
    }

    #[test]
    fn title_truncates_long_first_line() {
        let prompt = "x".repeat(100);
        let title = generate_title(&prompt);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= 61);
    }

    #[test]
    fn title_uses_first_line_only() {
        assert_eq!(generate_title("first line\nsecond line"), "first line");
    }

    #[test]
    fn new_job_starts_created_with_no_workspace_artifacts_yet() {
        let jobs_root = PathBuf::from("/tmp/jobs-test-root");
        let job = Job::new("alice", "repo-a", "do the thing", JobOptions::default(), &jobs_root);
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.workspace_path.starts_with(&jobs_root));
        assert_eq!(job.queue_position, 0);
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
