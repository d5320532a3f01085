//! Filesystem detection and CoW-capability probing.
//!
//! Identifies the underlying filesystem via the OS's mount-query utility and
//! probes whether a reflink copy actually succeeds, caching the result for
//! the life of the process. The probe result feeds [`crate::cow::CoWCloner`],
//! which picks a strategy from it.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneStrategy {
    /// `cp --reflink=always` succeeds on this filesystem: O(size) metadata
    /// cost, zero data duplication until first write.
    Reflink,
    /// Fallback: a full recursive copy.
    FullCopy,
}

pub struct FilesystemProbe;

impl FilesystemProbe {
    /// Identify the filesystem type backing `path` by shelling out to the
    /// OS's mount-query utility (`df -T`).
    pub fn filesystem_type(path: &Path) -> Result<String> {
        let output = Command::new("df")
            .arg("-T")
            .arg(path)
            .output()
            .context("failed to run `df -T`")?;

        if !output.status.success() {
            anyhow::bail!(
                "`df -T` failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // Second line, second column: Filesystem Type Size Used Avail Use% Mounted
        let fs_type = stdout
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("unknown")
            .to_string();

        Ok(fs_type)
    }

    /// Probe whether `cp --reflink=always` succeeds on a scratch file inside
    /// `root`. The scratch file is created and removed as part of the
    /// probe; callers should do this once at startup and cache the result
    /// (the cost is cheap but repeated probing would be pointless —
    /// filesystem capability doesn't change mid-process).
    pub fn probe_reflink_support(root: &Path) -> CloneStrategy {
        let probe_dir = root.join(format!(".fsprobe-{}", uuid::Uuid::new_v4()));
        if std::fs::create_dir_all(&probe_dir).is_err() {
            return CloneStrategy::FullCopy;
        }

        let src = probe_dir.join("src");
        let dst = probe_dir.join("dst");
        let strategy = if std::fs::write(&src, b"reflink probe").is_err() {
            CloneStrategy::FullCopy
        } else {
            let succeeded = Command::new("cp")
                .arg("--reflink=always")
                .arg(&src)
                .arg(&dst)
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);

            if succeeded {
                CloneStrategy::Reflink
            } else {
                CloneStrategy::FullCopy
            }
        };

        let _ = std::fs::remove_dir_all(&probe_dir);
        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_type_returns_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let fs_type = FilesystemProbe::filesystem_type(dir.path()).unwrap();
        assert!(!fs_type.is_empty());
    }

    #[test]
    fn probe_reflink_support_picks_some_strategy() {
        let dir = tempfile::tempdir().unwrap();
        // Either answer is a legitimate outcome depending on the test
        // host's filesystem; we only assert the probe doesn't panic and
        // returns a concrete strategy.
        let strategy = FilesystemProbe::probe_reflink_support(dir.path());
        assert!(matches!(
            strategy,
            CloneStrategy::Reflink | CloneStrategy::FullCopy
        ));
    }
}
