//! Reads a snapshot of a local git working tree's metadata.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::run_git_with_timeout;

/// A best-effort snapshot of a working tree's git state. Every field
/// degrades to `None` independently on subcommand failure or timeout —
/// metadata reading never fails the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitSnapshot {
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_date: Option<String>,
    pub uncommitted: bool,
    pub ahead: Option<u32>,
    pub behind: Option<u32>,
}

pub struct GitMetadataReader {
    timeout: Duration,
}

impl GitMetadataReader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns `None` if `dir` has no `.git` entry; otherwise aggregates a
    /// fixed set of `git` subcommands, each bounded by `timeout`.
    pub fn read(&self, dir: &Path) -> Option<GitSnapshot> {
        if !dir.join(".git").exists() {
            return None;
        }

        let remote_url = self
            .run(dir, &["config", "--get", "remote.origin.url"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let branch = self
            .run(dir, &["branch", "--show-current"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let commit_hash = self
            .run(dir, &["rev-parse", "HEAD"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let (commit_message, commit_author, commit_date) = self
            .run(dir, &["log", "-1", "--pretty=format:%s|%an|%ai"])
            .and_then(|line| {
                let mut parts = line.splitn(3, '|');
                Some((
                    parts.next()?.to_string(),
                    parts.next()?.to_string(),
                    parts.next()?.trim().to_string(),
                ))
            })
            .map(|(m, a, d)| (Some(m), Some(a), Some(d)))
            .unwrap_or((None, None, None));

        let uncommitted = self
            .run(dir, &["status", "--porcelain"])
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);

        let (ahead, behind) = branch
            .as_deref()
            .and_then(|b| self.ahead_behind(dir, b))
            .unwrap_or((None, None));

        Some(GitSnapshot {
            remote_url,
            branch,
            commit_hash,
            commit_message,
            commit_author,
            commit_date,
            uncommitted,
            ahead,
            behind,
        })
    }

    fn ahead_behind(&self, dir: &Path, branch: &str) -> Option<(Option<u32>, Option<u32>)> {
        // Dry-run fetch first so the comparison reflects the remote's
        // current state without mutating the working tree.
        self.run(dir, &["fetch", "--dry-run", "origin"]);

        let spec = format!("origin/{branch}...HEAD");
        let output = self.run(dir, &["rev-list", "--left-right", "--count", &spec])?;
        let mut parts = output.split_whitespace();
        let behind = parts.next()?.parse().ok();
        let ahead = parts.next()?.parse().ok();
        Some((ahead, behind))
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Option<String> {
        let output = run_git_with_timeout(dir, args, self.timeout).ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir).output().unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.test"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("a.txt"), "hello").unwrap();
        run(&["add", "a.txt"]);
        run(&["commit", "-q", "-m", "initial commit"]);
    }

    #[test]
    fn returns_none_outside_git_tree() {
        let dir = tempfile::tempdir().unwrap();
        let reader = GitMetadataReader::new(Duration::from_secs(5));
        assert!(reader.read(dir.path()).is_none());
    }

    #[test]
    fn reads_snapshot_of_a_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let reader = GitMetadataReader::new(Duration::from_secs(5));
        let snapshot = reader.read(dir.path()).expect("should read a git tree");

        assert!(snapshot.commit_hash.is_some());
        assert_eq!(snapshot.commit_message.as_deref(), Some("initial commit"));
        assert!(!snapshot.uncommitted);
    }

    #[test]
    fn detects_uncommitted_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "modified").unwrap();

        let reader = GitMetadataReader::new(Duration::from_secs(5));
        let snapshot = reader.read(dir.path()).unwrap();
        assert!(snapshot.uncommitted);
    }
}
