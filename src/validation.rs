//! Pure input validation: repository names, git URLs, relative
//! paths, and upload filenames. Every operation that builds a path from
//! caller-supplied input routes through here first and fails with
//! `BatchError::InvalidInput` on rejection rather than touching the
//! filesystem with unchecked input.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::BatchError;

const DANGEROUS_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\'', '"', '\n', '\r',
];

static REPO_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());
static GIT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?://|git@)[A-Za-z0-9._/:-]+(\.git)?$").unwrap());

fn contains_dangerous_chars(s: &str) -> bool {
    s.chars().any(|c| DANGEROUS_CHARS.contains(&c))
}

/// `^[A-Za-z0-9._-]{1,100}$`, no dangerous shell metacharacters.
pub fn valid_repository_name(name: &str) -> Result<(), BatchError> {
    if name.is_empty() || name.len() > 100 {
        return Err(BatchError::invalid_input(format!(
            "repository name must be 1-100 characters, got {}",
            name.len()
        )));
    }
    if !REPO_NAME_RE.is_match(name) {
        return Err(BatchError::invalid_input(format!(
            "repository name `{name}` must match [A-Za-z0-9._-]+"
        )));
    }
    if contains_dangerous_chars(name) {
        return Err(BatchError::invalid_input(
            "repository name contains disallowed characters",
        ));
    }
    Ok(())
}

/// `^(https?://|git@)[A-Za-z0-9._/:-]+(\.git)?$`, length <= 500.
pub fn valid_git_url(url: &str) -> Result<(), BatchError> {
    if url.is_empty() || url.len() > 500 {
        return Err(BatchError::invalid_input(format!(
            "git URL must be 1-500 characters, got {}",
            url.len()
        )));
    }
    if !GIT_URL_RE.is_match(url) {
        return Err(BatchError::invalid_input(format!(
            "`{url}` is not a recognized git URL (expected https://, http://, or git@ form)"
        )));
    }
    Ok(())
}

/// No `..` segments, no NUL, no leading `/`, no dangerous characters.
/// Does not by itself guarantee the path stays under a root — call
/// [`PathGuard::resolve`] for that.
pub fn valid_relative_path(path: &str) -> Result<(), BatchError> {
    if path.is_empty() {
        return Err(BatchError::invalid_input("path must not be empty"));
    }
    if path.contains('\0') {
        return Err(BatchError::invalid_input("path must not contain NUL"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(BatchError::invalid_input(
            "path must not be absolute (no leading slash)",
        ));
    }
    if contains_dangerous_chars(path) {
        return Err(BatchError::invalid_input(
            "path contains disallowed characters",
        ));
    }
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                return Err(BatchError::invalid_input(format!(
                    "path `{path}` must not contain `..` segments"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(BatchError::invalid_input(format!(
                    "path `{path}` must be relative"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

/// Validates an upload filename: same rules as a relative path, but a single
/// path segment (no directory nesting implied by the client).
pub fn valid_upload_filename(filename: &str) -> Result<(), BatchError> {
    valid_relative_path(filename)?;
    if Path::new(filename).components().count() != 1 {
        return Err(BatchError::invalid_input(format!(
            "filename `{filename}` must not contain directory separators"
        )));
    }
    Ok(())
}

/// Resolves a caller-supplied relative path against `root`, guaranteeing the
/// result is lexically contained within it. Rejects with `InvalidInput`
/// rather than ever returning a path outside `root`, including via
/// component-wise normalization (not `fs::canonicalize`, which would require
/// the path to already exist).
pub struct PathGuard;

impl PathGuard {
    pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, BatchError> {
        valid_relative_path(relative)?;

        let mut resolved = root.to_path_buf();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => unreachable!("valid_relative_path already rejected this"),
            }
        }

        if !resolved.starts_with(root) {
            return Err(BatchError::path_escape(&root.to_path_buf(), relative));
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_name_accepts_valid() {
        assert!(valid_repository_name("my-repo_1.0").is_ok());
    }

    #[test]
    fn repository_name_rejects_empty_and_long() {
        assert!(valid_repository_name("").is_err());
        assert!(valid_repository_name(&"a".repeat(101)).is_err());
    }

    #[test]
    fn repository_name_rejects_shell_metacharacters() {
        for bad in ["repo;rm -rf", "repo`x`", "repo$(x)", "repo|x", "a b"] {
            assert!(valid_repository_name(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn git_url_accepts_https_and_ssh() {
        assert!(valid_git_url("https://example.test/org/repo.git").is_ok());
        assert!(valid_git_url("git@example.test:org/repo.git").is_ok());
    }

    #[test]
    fn git_url_rejects_garbage() {
        assert!(valid_git_url("not a url").is_err());
        assert!(valid_git_url("javascript:alert(1)").is_err());
    }

    #[test]
    fn relative_path_rejects_traversal() {
        assert!(valid_relative_path("../../etc/passwd").is_err());
        assert!(valid_relative_path("a/../../b").is_err());
        assert!(valid_relative_path("/etc/passwd").is_err());
    }

    #[test]
    fn relative_path_accepts_nested() {
        assert!(valid_relative_path("src/main.rs").is_ok());
    }

    #[test]
    fn upload_filename_rejects_nested() {
        assert!(valid_upload_filename("dir/file.txt").is_err());
        assert!(valid_upload_filename("file.txt").is_ok());
    }

    #[test]
    fn path_guard_contains_result_within_root() {
        let root = Path::new("/jobs/abc");
        let resolved = PathGuard::resolve(root, "files/report.txt").unwrap();
        assert_eq!(resolved, Path::new("/jobs/abc/files/report.txt"));
    }

    #[test]
    fn path_guard_rejects_traversal_before_touching_fs() {
        let root = Path::new("/jobs/abc");
        assert!(PathGuard::resolve(root, "../../../etc/passwd").is_err());
    }
}
