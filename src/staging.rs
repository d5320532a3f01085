//! Per-job upload staging area, used before a job's CoW clone exists. Lives
//! outside the workspace root deliberately — the workspace root is about to
//! be replaced wholesale by the clone.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::error::{BatchError, BatchResult};
use crate::validation::valid_upload_filename;

/// Chunk size for streaming an upload from its reader into the staging file.
const STAGE_CHUNK_BYTES: usize = 64 * 1024;

pub struct UploadStaging {
    jobs_root: PathBuf,
}

impl UploadStaging {
    pub fn new(jobs_root: PathBuf) -> Self {
        Self { jobs_root }
    }

    /// `<workspaceRoot>/../staging/<jobId>` — a sibling of the jobs root,
    /// not a child of any single job's workspace.
    pub fn staging_path(&self, job_id: Uuid) -> PathBuf {
        self.jobs_root.join("..").join("staging").join(job_id.to_string())
    }

    /// Streams `reader` into the staging area for `job_id`, never buffering
    /// more than a chunk at a time so a request doesn't hold memory
    /// proportional to the upload's size. When `overwrite` is false and
    /// `filename` already exists there, an 8-hex-digit disambiguator is
    /// appended before the extension so two same-named uploads in the same
    /// job don't collide; `drain` later restores the original name by
    /// stripping it back off. Aborts with `BatchError::ResourceExhausted`
    /// (and removes the partial file) once more than `max_bytes` has been
    /// read, without ever buffering the whole stream to find out.
    pub fn stage<R: Read>(
        &self,
        job_id: Uuid,
        filename: &str,
        reader: &mut R,
        max_bytes: u64,
        overwrite: bool,
    ) -> BatchResult<PathBuf> {
        valid_upload_filename(filename)?;

        let dir = self.staging_path(job_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create staging dir {}", dir.display()))
            .map_err(BatchError::Internal)?;

        let target_name = if overwrite {
            filename.to_string()
        } else {
            disambiguate(&dir, filename)
        };

        let target = dir.join(&target_name);
        let mut out = std::fs::File::create(&target)
            .with_context(|| format!("failed to stage {}", target.display()))
            .map_err(BatchError::Internal)?;

        let mut buf = [0u8; STAGE_CHUNK_BYTES];
        let mut written: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .context("failed to read upload stream")
                .map_err(BatchError::Internal)?;
            if n == 0 {
                break;
            }

            written += n as u64;
            if written > max_bytes {
                drop(out);
                std::fs::remove_file(&target).ok();
                return Err(BatchError::resource_exhausted(format!(
                    "upload `{filename}` exceeds the {max_bytes}-byte limit"
                )));
            }

            out.write_all(&buf[..n])
                .with_context(|| format!("failed to write {}", target.display()))
                .map_err(BatchError::Internal)?;
        }

        Ok(target)
    }

    /// Copy every staged file into `workspace_path/files/`, restoring each
    /// file's original name, and verify the byte length matches before
    /// counting it as copied.
    pub fn drain(&self, job_id: Uuid, workspace_path: &Path) -> Result<usize> {
        let dir = self.staging_path(job_id);
        if !dir.exists() {
            return Ok(0);
        }

        let files_dir = workspace_path.join("files");
        std::fs::create_dir_all(&files_dir)
            .with_context(|| format!("failed to create {}", files_dir.display()))?;

        let mut copied = 0usize;
        for entry in std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let staged_name = entry.file_name().to_string_lossy().to_string();
            let original_name = restore_original_filename(&staged_name);
            let dst = files_dir.join(&original_name);

            let src_len = entry.metadata()?.len();
            std::fs::copy(entry.path(), &dst)
                .with_context(|| format!("failed to copy {} to {}", entry.path().display(), dst.display()))?;
            let dst_len = std::fs::metadata(&dst)?.len();

            if dst_len == src_len {
                copied += 1;
            } else {
                bail!(
                    "byte-length mismatch copying {}: {} != {}",
                    original_name,
                    src_len,
                    dst_len
                );
            }
        }

        Ok(copied)
    }

    pub fn cleanup(&self, job_id: Uuid) -> Result<()> {
        let dir = self.staging_path(job_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove staging dir {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Appends an 8-hex-digit disambiguator before the extension if `filename`
/// already exists in `dir`.
fn disambiguate(dir: &Path, filename: &str) -> String {
    if !dir.join(filename).exists() {
        return filename.to_string();
    }

    let suffix: u32 = rand_u32();
    let path = Path::new(filename);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    match ext {
        Some(ext) => format!("{stem}_{suffix:08x}.{ext}"),
        None => format!("{stem}_{suffix:08x}"),
    }
}

fn rand_u32() -> u32 {
    // Low-stakes disambiguation only (collision just means a retry would
    // pick another suffix); a UUID fragment is more than enough entropy and
    // avoids pulling in a dedicated RNG dependency.
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Strip a trailing `_XXXXXXXX` disambiguator (8 lowercase hex digits) from
/// before the extension. Filenames without that suffix are returned
/// unchanged.
fn restore_original_filename(staged_name: &str) -> String {
    let path = Path::new(staged_name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    let restored_stem = match stem.rfind('_') {
        Some(pos) => {
            let suffix = &stem[pos + 1..];
            if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
                stem[..pos].to_string()
            } else {
                stem
            }
        }
        None => stem,
    };

    match ext {
        Some(ext) => format!("{restored_stem}.{ext}"),
        None => restored_stem,
    }
}
