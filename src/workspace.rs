//! Recursive directory listing and file access rooted at a job's workspace.
//!
//! Every public entry point routes its caller-supplied path through
//! [`crate::validation::PathGuard`] before touching the filesystem, so a
//! crafted `path` or `mask` can surface `InvalidInput` but never escape the
//! workspace root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, BatchResult};
use crate::validation::PathGuard;

/// Which entries a listing call should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeFilter {
    Files,
    Directories,
    All,
}

impl Default for TypeFilter {
    fn default() -> Self {
        TypeFilter::All
    }
}

/// One entry in a workspace listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Path relative to the workspace root, using `/` separators.
    pub path: String,
    pub is_directory: bool,
    pub size_bytes: u64,
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

/// Lists entries under `relative_dir` (relative to `workspace_root`),
/// recursing up to `max_depth` levels, filtering by `type_filter`, and
/// keeping only names matching `mask` (a glob pattern, `*` when absent).
pub fn list_workspace(
    workspace_root: &Path,
    relative_dir: &str,
    mask: Option<&str>,
    max_depth: u32,
    type_filter: TypeFilter,
) -> BatchResult<Vec<WorkspaceEntry>> {
    let start = if relative_dir.is_empty() {
        workspace_root.to_path_buf()
    } else {
        PathGuard::resolve(workspace_root, relative_dir)?
    };

    if !start.exists() {
        return Err(BatchError::not_found(format!(
            "workspace path `{relative_dir}`"
        )));
    }

    let pattern = glob::Pattern::new(mask.unwrap_or("*"))
        .map_err(|e| BatchError::invalid_input(format!("invalid mask `{}`: {e}", mask.unwrap_or("*"))))?;

    let mut entries = Vec::new();
    walk(workspace_root, &start, 0, max_depth, &pattern, type_filter, &mut entries)
        .map_err(BatchError::Internal)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn walk(
    root: &Path,
    dir: &Path,
    depth: u32,
    max_depth: u32,
    pattern: &glob::Pattern,
    type_filter: TypeFilter,
    out: &mut Vec<WorkspaceEntry>,
) -> anyhow::Result<()> {
    if depth > max_depth {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let metadata = entry.metadata()?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();

        let matches_mask = pattern.matches(&name_str);
        let include = match type_filter {
            TypeFilter::Files => !file_type.is_dir(),
            TypeFilter::Directories => file_type.is_dir(),
            TypeFilter::All => true,
        };

        if matches_mask && include {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push(WorkspaceEntry {
                path: relative,
                is_directory: file_type.is_dir(),
                size_bytes: if file_type.is_dir() { 0 } else { metadata.len() },
                modified_at: metadata.modified().map(chrono::DateTime::from).unwrap_or_else(|_| chrono::Utc::now()),
            });
        }

        if file_type.is_dir() {
            walk(root, &path, depth + 1, max_depth, pattern, type_filter, out)?;
        }
    }

    Ok(())
}

/// Resolves `relative_path` within `workspace_root` and returns its absolute
/// path for streaming, after confirming it names an existing regular file.
pub fn resolve_download(workspace_root: &Path, relative_path: &str) -> BatchResult<PathBuf> {
    let resolved = PathGuard::resolve(workspace_root, relative_path)?;
    if !resolved.is_file() {
        return Err(BatchError::not_found(format!(
            "workspace file `{relative_path}`"
        )));
    }
    Ok(resolved)
}

/// Reads `relative_path` within `workspace_root` as UTF-8 text.
pub fn read_text(workspace_root: &Path, relative_path: &str) -> BatchResult<String> {
    let resolved = resolve_download(workspace_root, relative_path)?;
    std::fs::read_to_string(&resolved).map_err(|e| match e.kind() {
        std::io::ErrorKind::InvalidData => {
            BatchError::invalid_input(format!("`{relative_path}` is not valid UTF-8 text"))
        }
        _ => BatchError::Internal(e.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        std::fs::write(dir.path().join("files/report.txt"), "data").unwrap();
        dir
    }

    #[test]
    fn lists_root_and_nested_entries() {
        let dir = sample_workspace();
        let entries = list_workspace(dir.path(), "", None, 10, TypeFilter::All).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"README.md"));
        assert!(paths.contains(&"files/report.txt"));
    }

    #[test]
    fn depth_limit_excludes_nested_entries() {
        let dir = sample_workspace();
        let entries = list_workspace(dir.path(), "", None, 0, TypeFilter::All).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"README.md"));
        assert!(!paths.contains(&"files/report.txt"));
    }

    #[test]
    fn type_filter_restricts_to_files() {
        let dir = sample_workspace();
        let entries = list_workspace(dir.path(), "", None, 10, TypeFilter::Files).unwrap();
        assert!(entries.iter().all(|e| !e.is_directory));
    }

    #[test]
    fn mask_filters_by_glob() {
        let dir = sample_workspace();
        let entries = list_workspace(dir.path(), "", Some("*.md"), 10, TypeFilter::All).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "README.md");
    }

    #[test]
    fn list_rejects_traversal_outside_root() {
        let dir = sample_workspace();
        let result = list_workspace(dir.path(), "../../etc", None, 10, TypeFilter::All);
        assert!(matches!(result, Err(BatchError::InvalidInput(_))));
    }

    #[test]
    fn resolve_download_rejects_missing_file() {
        let dir = sample_workspace();
        let result = resolve_download(dir.path(), "nope.txt");
        assert!(matches!(result, Err(BatchError::NotFound(_))));
    }

    #[test]
    fn read_text_returns_contents() {
        let dir = sample_workspace();
        let text = read_text(dir.path(), "README.md").unwrap();
        assert_eq!(text, "hello");
    }
}
