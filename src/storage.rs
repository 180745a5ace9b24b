// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Partial-file assembly: pre-allocation, positioned writes at
//! arbitrary offsets, and finalization of the completed file.
//!
//! Every write carries its absolute offset and runs on a handle private
//! to the call, so concurrent workers writing disjoint ranges never
//! share a file cursor.

use crate::errors::StorageError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, try_exists, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{event, Level};

/// Largest single write issued to the OS.
const MAX_WRITE: usize = 1024 * 1024;

/// How filename collisions are resolved when the finished download is
/// moved onto its target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    AutoRename,
    Overwrite,
    Skip,
}

/// Handle to the `.part` file a download assembles into.
#[derive(Debug, Clone)]
pub struct PartialFile {
    path: PathBuf,
}

impl PartialFile {
    /// Open or create the partial file, creating parent directories and
    /// extending a newly created file to the advertised size so workers
    /// can write anywhere inside it.
    pub async fn open(path: &Path, size: i64) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !try_exists(parent).await? {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        if size > 0 && file.metadata().await?.len() < size as u64 {
            file.set_len(size as u64).await?;
        }

        Ok(PartialFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole chunk at the given absolute offset, in slices of
    /// at most `MAX_WRITE` bytes. The handle is opened per call, so no
    /// cursor is shared between workers.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        let mut written = 0usize;
        while written < data.len() {
            let take = (data.len() - written).min(MAX_WRITE);
            file.seek(SeekFrom::Start(offset + written as u64)).await?;
            file.write_all(&data[written..written + take]).await?;
            written += take;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Move the completed partial file onto its final path, resolving a
/// name collision according to `policy`. Returns the path the bytes
/// ended up at. Falls back to copy-then-delete when a plain rename
/// fails (e.g. across volumes).
pub async fn finalize(
    partial: &Path,
    target: &Path,
    policy: ConflictPolicy,
) -> Result<PathBuf, StorageError> {
    let mut final_path = target.to_path_buf();

    if try_exists(target).await? {
        match policy {
            ConflictPolicy::AutoRename => {
                final_path = unique_target_name(target).await?;
            }
            ConflictPolicy::Overwrite => {
                fs::remove_file(target).await?;
            }
            ConflictPolicy::Skip => {
                event!(Level::INFO, target = %target.display(),
                       "Target already exists, discarding partial file");
                fs::remove_file(partial).await?;
                return Ok(final_path);
            }
        }
    }

    if let Err(rename_err) = fs::rename(partial, &final_path).await {
        event!(Level::DEBUG, error = %rename_err,
               "Rename failed, falling back to copy and delete");
        fs::copy(partial, &final_path)
            .await
            .map_err(|_| StorageError::Finalize(final_path.display().to_string()))?;
        fs::remove_file(partial).await?;
    }

    event!(Level::INFO, path = %final_path.display(), "Finalized download");
    Ok(final_path)
}

/// Find `name(1).ext`, `name(2).ext`, ... that does not exist yet. Past
/// 9999 candidates a timestamp suffix is used instead.
async fn unique_target_name(target: &Path) -> Result<PathBuf, StorageError> {
    let dir = target.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for i in 1..10_000u32 {
        let candidate = dir.join(format!("{stem}({i}){ext}"));
        if !try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }

    let stamp = chrono::Utc::now().timestamp_micros();
    Ok(dir.join(format!("{stem}_{stamp}{ext}")))
}

/// Best-effort: stamp the final file with the origin's Last-Modified
/// date ("Thu, 01 Dec 2020 12:00:00 GMT" format).
pub fn set_mtime(path: &Path, http_date: &str) -> bool {
    if http_date.is_empty() {
        return false;
    }
    let parsed = match httpdate::parse_http_date(http_date) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let file = match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    file.set_modified(parsed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_preallocates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("file.part");
        let partial = PartialFile::open(&path, 4096).await.unwrap();
        assert_eq!(std::fs::metadata(partial.path()).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn writes_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.part");
        let partial = PartialFile::open(&path, 16).await.unwrap();

        partial.write_at(8, b"BBBBBBBB").await.unwrap();
        partial.write_at(0, b"AAAAAAAA").await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents, b"AAAAAAAABBBBBBBB");
    }

    #[tokio::test]
    async fn finalize_renames_partial() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("file.part");
        let target = dir.path().join("file.bin");
        std::fs::write(&partial, b"data").unwrap();

        let result = finalize(&partial, &target, ConflictPolicy::AutoRename)
            .await
            .unwrap();
        assert_eq!(result, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn auto_rename_produces_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"first").unwrap();

        let partial = dir.path().join("file.part");
        std::fs::write(&partial, b"second").unwrap();
        let renamed = finalize(&partial, &target, ConflictPolicy::AutoRename)
            .await
            .unwrap();
        assert_eq!(renamed, dir.path().join("file(1).bin"));
        assert_eq!(std::fs::read(&target).unwrap(), b"first");
        assert_eq!(std::fs::read(&renamed).unwrap(), b"second");

        // Finalizing again keeps producing fresh names without losing bytes.
        let partial2 = dir.path().join("file2.part");
        std::fs::write(&partial2, b"third").unwrap();
        let renamed2 = finalize(&partial2, &target, ConflictPolicy::AutoRename)
            .await
            .unwrap();
        assert_eq!(renamed2, dir.path().join("file(2).bin"));
        assert_eq!(std::fs::read(&renamed2).unwrap(), b"third");
    }

    #[tokio::test]
    async fn overwrite_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"old").unwrap();
        let partial = dir.path().join("file.part");
        std::fs::write(&partial, b"new").unwrap();

        let result = finalize(&partial, &target, ConflictPolicy::Overwrite)
            .await
            .unwrap();
        assert_eq!(result, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[tokio::test]
    async fn skip_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"keep").unwrap();
        let partial = dir.path().join("file.part");
        std::fs::write(&partial, b"drop").unwrap();

        let result = finalize(&partial, &target, ConflictPolicy::Skip)
            .await
            .unwrap();
        assert_eq!(result, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"keep");
        assert!(!partial.exists());
    }

    #[test]
    fn mtime_parses_http_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"x").unwrap();
        assert!(set_mtime(&path, "Thu, 01 Dec 2020 12:00:00 GMT"));
        assert!(!set_mtime(&path, "not a date"));
        assert!(!set_mtime(&path, ""));
    }
}
