//! Copy-on-write workspace provisioning.
//!
//! The workspace is a real, independent directory tree — not a view or
//! overlay — so the indexer and the assistant can write to it freely.
//! Reflink gives near-zero-cost cloning when the filesystem supports it; a
//! full recursive copy is the portable fallback.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::fsprobe::CloneStrategy;

pub struct CoWCloner {
    strategy: CloneStrategy,
}

impl CoWCloner {
    pub fn new(strategy: CloneStrategy) -> Self {
        Self { strategy }
    }

    /// Clone the *contents* of `src_dir` into `dst_dir` (not `src_dir`
    /// itself, so the repository name is never nested twice inside the
    /// workspace). If `dst_dir` already exists it is removed first. On
    /// return, `dst_dir/files/` exists for uploads, and `dst_dir` is fully
    /// independent from `src_dir` — writes in either tree never affect the
    /// other.
    pub fn clone(&self, src_dir: &Path, dst_dir: &Path) -> Result<()> {
        if !src_dir.is_dir() {
            bail!("clone source `{}` is not a directory", src_dir.display());
        }

        if dst_dir.exists() {
            Self::remove(dst_dir)?;
        }

        std::fs::create_dir_all(dst_dir)
            .with_context(|| format!("failed to create workspace dir `{}`", dst_dir.display()))?;

        match self.strategy {
            CloneStrategy::Reflink => self.clone_reflink(src_dir, dst_dir).or_else(|_| {
                // Reflink can fail per-file on cross-device scratch dirs
                // even when the probe succeeded; fall back rather than
                // leaving a half-populated workspace.
                self.clone_full_copy(src_dir, dst_dir)
            })?,
            CloneStrategy::FullCopy => self.clone_full_copy(src_dir, dst_dir)?,
        }

        std::fs::create_dir_all(dst_dir.join("files"))
            .context("failed to create workspace files/ directory")?;

        Ok(())
    }

    fn clone_reflink(&self, src_dir: &Path, dst_dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(src_dir)
            .with_context(|| format!("failed to read `{}`", src_dir.display()))?
        {
            let entry = entry?;
            let src_path = entry.path();
            let dst_path = dst_dir.join(entry.file_name());

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let output = Command::new("cp")
                    .args(["--reflink=always", "-r"])
                    .arg(&src_path)
                    .arg(&dst_path)
                    .output()
                    .context("failed to run `cp --reflink=always -r`")?;
                if !output.status.success() {
                    bail!(
                        "reflink copy of `{}` failed: {}",
                        src_path.display(),
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
            } else {
                let output = Command::new("cp")
                    .arg("--reflink=always")
                    .arg(&src_path)
                    .arg(&dst_path)
                    .output()
                    .context("failed to run `cp --reflink=always`")?;
                if !output.status.success() {
                    bail!(
                        "reflink copy of `{}` failed: {}",
                        src_path.display(),
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
            }
        }
        Ok(())
    }

    fn clone_full_copy(&self, src_dir: &Path, dst_dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(src_dir)
            .with_context(|| format!("failed to read `{}`", src_dir.display()))?
        {
            let entry = entry?;
            let src_path = entry.path();
            let dst_path = dst_dir.join(entry.file_name());
            copy_recursive(&src_path, &dst_path)?;
        }
        Ok(())
    }

    /// Idempotent, tolerant-of-missing removal. Clears read-only bits first
    /// since some clone strategies (and git) leave files read-only.
    pub fn remove(dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        clear_readonly_recursive(dir).ok();
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove `{}`", dir.display()))?;
        Ok(())
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat `{}`", src.display()))?;

    if metadata.is_dir() {
        std::fs::create_dir_all(dst)
            .with_context(|| format!("failed to create `{}`", dst.display()))?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("failed to symlink `{}`", dst.display()))?;
        #[cfg(not(unix))]
        std::fs::copy(src, dst).with_context(|| format!("failed to copy `{}`", dst.display()))?;
    } else {
        std::fs::copy(src, dst)
            .with_context(|| format!("failed to copy `{}` to `{}`", src.display(), dst.display()))?;
    }

    Ok(())
}

fn clear_readonly_recursive(dir: &Path) -> Result<()> {
    if dir.is_file() {
        let mut perms = std::fs::metadata(dir)?.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            std::fs::set_permissions(dir, perms)?;
        }
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            clear_readonly_recursive(&path)?;
        } else {
            let mut perms = std::fs::metadata(&path)?.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                std::fs::set_permissions(&path, perms)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn full_copy_clones_contents_not_root() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "hello");
        write(&src.path().join("nested/b.txt"), "world");

        let dst_root = tempfile::tempdir().unwrap();
        let dst = dst_root.path().join("workspace");

        let cloner = CoWCloner::new(CloneStrategy::FullCopy);
        cloner.clone(src.path(), &dst).unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "hello");
        assert_eq!(
            std::fs::read_to_string(dst.join("nested/b.txt")).unwrap(),
            "world"
        );
        assert!(dst.join("files").is_dir());
    }

    #[test]
    fn clone_is_independent_of_source() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "original");

        let dst_root = tempfile::tempdir().unwrap();
        let dst = dst_root.path().join("workspace");

        let cloner = CoWCloner::new(CloneStrategy::FullCopy);
        cloner.clone(src.path(), &dst).unwrap();

        std::fs::write(dst.join("a.txt"), "mutated").unwrap();
        assert_eq!(
            std::fs::read_to_string(src.path().join("a.txt")).unwrap(),
            "original"
        );
    }

    #[test]
    fn clone_replaces_existing_destination() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "new");

        let dst_root = tempfile::tempdir().unwrap();
        let dst = dst_root.path().join("workspace");
        write(&dst.join("stale.txt"), "old");

        let cloner = CoWCloner::new(CloneStrategy::FullCopy);
        cloner.clone(src.path(), &dst).unwrap();

        assert!(!dst.join("stale.txt").exists());
        assert!(dst.join("a.txt").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        CoWCloner::remove(&target).unwrap();
        CoWCloner::remove(&target).unwrap();
    }
}
