//! Git plumbing shared by the repository registry and the scheduler's
//! pre-clone pull phase.

mod metadata;

pub use metadata::{GitMetadataReader, GitSnapshot};

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Find the git repository root for a given path, or `None` if it isn't
/// inside one.
pub fn find_git_root(path: &Path) -> Option<PathBuf> {
    let start_dir = if path.is_file() { path.parent()? } else { path };

    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(start_dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        None
    } else {
        Some(PathBuf::from(root))
    }
}

/// The outcome of [`pull_updates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Pulled,
    NotGitRepo,
    Failed,
}

/// Run `git pull` in `repo_dir` with a short timeout. Returns `NotGitRepo`
/// without attempting anything if `repo_dir/.git` is absent.
pub fn pull_updates(repo_dir: &Path, timeout: Duration) -> PullOutcome {
    if !repo_dir.join(".git").exists() {
        return PullOutcome::NotGitRepo;
    }

    match run_git_with_timeout(repo_dir, &["pull"], timeout) {
        Ok(output) if output.status.success() => PullOutcome::Pulled,
        _ => PullOutcome::Failed,
    }
}

/// Clone `git_url` into `dest` with a generous timeout (registration uses
/// minutes-to-hours; this just shells out and waits).
pub fn clone_repository(git_url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create `{}`", parent.display()))?;
    }

    let dest_str = dest
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("clone destination path is not valid UTF-8"))?;

    let output = run_git_with_timeout(
        dest.parent().unwrap_or(Path::new(".")),
        &["clone", git_url, dest_str],
        timeout,
    )
    .context("failed to run git clone")?;

    if !output.status.success() {
        bail!(
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(())
}

fn run_git_with_timeout(
    cwd: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<std::process::Output> {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let cwd = cwd.to_path_buf();
    let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();

    std::thread::spawn(move || {
        let args_ref: Vec<&str> = args_owned.iter().map(String::as_str).collect();
        let result = Command::new("git").args(&args_ref).current_dir(&cwd).output();
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result.context("failed to execute git"),
        Err(_) => bail!("git {:?} timed out after {:?}", args, timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_git_root_returns_none_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_git_root(dir.path()).is_none());
    }

    #[test]
    fn pull_updates_reports_not_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(pull_updates(dir.path(), Duration::from_secs(5)), PullOutcome::NotGitRepo);
    }
}
