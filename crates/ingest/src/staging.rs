//! Per-upload write-ahead staging on local disk.
//!
//! Each in-flight append owns `root/<upload id>/`, holding chunk files named
//! by sequence number (`1`, `2`, ...) until the flusher commits them. The
//! owner holds an exclusive lock on `.lock` in that directory for as long as
//! the area is open.

use crate::error::{UploadError, UploadResult};
use bytes::Bytes;
use fs2::FileExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tusblob_core::UploadId;

/// A locally staged, not yet committed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position within the append call.
    pub sequence: u64,
    /// Payload length in bytes.
    pub len: u64,
    /// Staging file holding the payload.
    pub path: PathBuf,
}

/// Scoped staging directory for one append call.
///
/// Call [`StagingArea::close`] when the call ends. If the owning future is
/// dropped first, `Drop` removes the directory synchronously.
#[derive(Debug)]
pub struct StagingArea {
    id: UploadId,
    dir: PathBuf,
    closed: bool,
    // Released after the directory is removed
    _lock: std::fs::File,
}

const LOCK_FILE: &str = ".lock";

fn staging_err(path: &Path) -> impl FnOnce(std::io::Error) -> UploadError + '_ {
    move |source| UploadError::Staging {
        path: path.to_path_buf(),
        source,
    }
}

/// Open the lock file in `dir` and try to lock it exclusively.
///
/// Returns `None` if another staging area holds the lock, or if the holder
/// removed the directory before releasing it.
async fn try_lock(dir: &Path, create: bool) -> std::io::Result<Option<std::fs::File>> {
    let path = dir.join(LOCK_FILE);
    let file = fs::OpenOptions::new()
        .write(true)
        .create(create)
        .open(&path)
        .await?
        .into_std()
        .await;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
        Err(e) => return Err(e),
    }

    if fs::try_exists(&path).await? {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}

/// Remove everything in `dir` except the lock file.
async fn clear_chunks(dir: &Path) -> UploadResult<usize> {
    let mut entries = fs::read_dir(dir).await.map_err(staging_err(dir))?;
    let mut cleared = 0;
    while let Some(entry) = entries.next_entry().await.map_err(staging_err(dir))? {
        if entry.file_name() == LOCK_FILE {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(staging_err(&path))?;
        let result = if file_type.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => cleared += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(staging_err(&path)(e)),
        }
    }
    Ok(cleared)
}

impl StagingArea {
    /// Create and lock the staging directory for `id` under `root`.
    ///
    /// Fails with `AppendInProgress` if another staging area holds the
    /// directory. An unlocked directory left by a dead process is emptied
    /// and taken over.
    pub async fn open(root: &Path, id: &UploadId) -> UploadResult<Self> {
        fs::create_dir_all(root).await.map_err(staging_err(root))?;

        let dir = root.join(id.to_string());
        let fresh = match fs::create_dir(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
            Err(e) => return Err(staging_err(&dir)(e)),
        };

        let lock = match try_lock(&dir, true).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return Err(UploadError::AppendInProgress(*id)),
            // Removed by a concurrent reclaim or close
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(UploadError::AppendInProgress(*id));
            }
            Err(e) => return Err(staging_err(&dir)(e)),
        };

        if !fresh {
            let cleared = clear_chunks(&dir).await?;
            tracing::warn!(
                upload_id = %id,
                dir = %dir.display(),
                cleared,
                "Took over staging area left by a previous process"
            );
        }

        tracing::debug!(upload_id = %id, dir = %dir.display(), "Opened staging area");
        Ok(Self {
            id: *id,
            dir,
            closed: false,
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.id
    }

    /// Persist a block as chunk `sequence`, synced to disk before returning.
    pub async fn stage(&self, sequence: u64, data: &[u8]) -> UploadResult<Chunk> {
        let path = self.dir.join(sequence.to_string());

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(staging_err(&path))?;
        file.write_all(data).await.map_err(staging_err(&path))?;
        file.sync_all().await.map_err(staging_err(&path))?;

        tracing::trace!(upload_id = %self.id, sequence, len = data.len(), "Staged chunk");
        Ok(Chunk {
            sequence,
            len: data.len() as u64,
            path,
        })
    }

    /// Read a staged chunk back.
    pub async fn load(&self, chunk: &Chunk) -> UploadResult<Bytes> {
        let data = fs::read(&chunk.path).await.map_err(staging_err(&chunk.path))?;
        if data.len() as u64 != chunk.len {
            return Err(UploadError::Staging {
                path: chunk.path.clone(),
                source: std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("staged {} bytes, found {}", chunk.len, data.len()),
                ),
            });
        }
        Ok(Bytes::from(data))
    }

    /// Delete a committed chunk.
    pub async fn discard(&self, chunk: &Chunk) -> UploadResult<()> {
        match fs::remove_file(&chunk.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(staging_err(&chunk.path)(e)),
        }
    }

    /// Remove the staging directory and everything left in it.
    pub async fn close(mut self) -> UploadResult<()> {
        self.closed = true;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(staging_err(&self.dir)(e)),
        }
        tracing::debug!(upload_id = %self.id, "Closed staging area");
        Ok(())
    }

    /// Remove staging directories left behind by a previous process.
    ///
    /// Directories whose lock is held by an open staging area are skipped,
    /// as are directories not yet holding a lock file. Returns the number of
    /// entries removed.
    pub async fn reclaim(root: &Path) -> UploadResult<usize> {
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(staging_err(root)(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(staging_err(root))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(staging_err(&path))?;
            let result = if file_type.is_dir() {
                match try_lock(&path, false).await {
                    // Held until the directory is gone
                    Ok(Some(_lock)) => fs::remove_dir_all(&path).await,
                    Ok(None) => {
                        tracing::debug!(path = %path.display(), "Staging area in use; skipping");
                        continue;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        tracing::debug!(path = %path.display(), "Staging area not locked yet; skipping");
                        continue;
                    }
                    Err(e) => return Err(staging_err(&path)(e)),
                }
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Reclaimed stale staging entry");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(staging_err(&path)(e)),
            }
        }
        Ok(removed)
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                tracing::debug!(upload_id = %self.id, "Removed staging area on drop");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    upload_id = %self.id,
                    dir = %self.dir.display(),
                    error = %e,
                    "Failed to remove staging area on drop"
                );
            }
        }
    }
}
