//! Local filesystem emulation of append objects.
//!
//! Each object is a directory under the root holding the appended bytes in
//! `data` and the creation properties in `attributes.json`.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AppendObjectStore, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;
use tusblob_core::{UploadAttributes, UploadId};
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const DATA_FILE: &str = "data";
const ATTRIBUTES_FILE: &str = "attributes.json";

/// Creation properties persisted next to the data file.
#[derive(Serialize, Deserialize)]
struct StoredAttributes {
    upload_length: u64,
    metadata: String,
}

/// Local filesystem append object store.
pub struct FilesystemBackend {
    root: PathBuf,
    /// Per-object locks serializing the position check and write of appends.
    append_locks: Mutex<HashMap<UploadId, Arc<Mutex<()>>>>,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            append_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn append_lock(&self, id: &UploadId) -> Arc<Mutex<()>> {
        self.append_locks
            .lock()
            .await
            .entry(*id)
            .or_default()
            .clone()
    }

    /// Drop the map entry once no other append for `id` holds or awaits it.
    async fn release_append_lock(&self, id: &UploadId, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.append_locks.lock().await;
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    async fn append_at(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let path = self.object_dir(id).join(DATA_FILE);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(Self::not_found(id))?;

        let actual = file.metadata().await?.len();
        if actual != expected_offset {
            return Err(StorageError::OffsetMismatch {
                key: id.to_string(),
                expected: expected_offset,
                actual,
            });
        }

        file.write_all(&data).await?;
        // Durable before the new offset is reported
        file.sync_data().await?;

        Ok(expected_offset + data.len() as u64)
    }

    fn object_dir(&self, id: &UploadId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn not_found(id: &UploadId) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(id.to_string())
            } else {
                StorageError::Io(e)
            }
        }
    }

    /// Build the object in a temp directory, fsync both files, then rename
    /// it into place so the attributes exist from the first instant.
    async fn write_object_dir(temp_dir: &Path, attributes: &StoredAttributes) -> StorageResult<()> {
        fs::create_dir(temp_dir).await?;

        let encoded = serde_json::to_vec(attributes)
            .map_err(|e| StorageError::InvalidAttributes(e.to_string()))?;
        {
            let mut file = fs::File::create(temp_dir.join(ATTRIBUTES_FILE)).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
        }
        {
            let file = fs::File::create(temp_dir.join(DATA_FILE)).await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AppendObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_if_missing(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    #[instrument(skip(self, metadata), fields(backend = "filesystem", upload_id = %id))]
    async fn create_object(
        &self,
        id: &UploadId,
        upload_length: u64,
        metadata: &str,
    ) -> StorageResult<()> {
        let final_dir = self.object_dir(id);
        if fs::try_exists(&final_dir).await? {
            return Err(StorageError::AlreadyExists(id.to_string()));
        }

        let temp_dir = self.root.join(format!(".tmp.{}", Uuid::new_v4()));
        let attributes = StoredAttributes {
            upload_length,
            metadata: metadata.to_string(),
        };

        let result = match Self::write_object_dir(&temp_dir, &attributes).await {
            Ok(()) => fs::rename(&temp_dir, &final_dir).await.map_err(|e| {
                if final_dir.exists() {
                    StorageError::AlreadyExists(id.to_string())
                } else {
                    StorageError::Io(e)
                }
            }),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = fs::remove_dir_all(&temp_dir).await;
        }
        result
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", upload_id = %id, size = data.len()))]
    async fn append_bytes(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let lock = self.append_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.append_at(id, expected_offset, data).await
        };
        self.release_append_lock(id, lock).await;
        result
    }

    #[instrument(skip(self), fields(backend = "filesystem", upload_id = %id))]
    async fn fetch_attributes(&self, id: &UploadId) -> StorageResult<UploadAttributes> {
        let dir = self.object_dir(id);
        let raw = fs::read(dir.join(ATTRIBUTES_FILE))
            .await
            .map_err(Self::not_found(id))?;
        let stored: StoredAttributes = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::InvalidAttributes(format!("{id}: {e}")))?;

        let offset = fs::metadata(dir.join(DATA_FILE))
            .await
            .map_err(Self::not_found(id))?
            .len();

        Ok(UploadAttributes {
            upload_length: stored.upload_length,
            metadata: stored.metadata,
            offset,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem", upload_id = %id))]
    async fn exists(&self, id: &UploadId) -> StorageResult<bool> {
        let path = self.object_dir(id).join(ATTRIBUTES_FILE);
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem", upload_id = %id))]
    async fn open_readable(&self, id: &UploadId) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.object_dir(id).join(DATA_FILE);
        let file = fs::File::open(&path).await.map_err(Self::not_found(id))?;

        // Reads whatever has been appended by the time each chunk is pulled
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn read_all(backend: &FilesystemBackend, id: &UploadId) -> Vec<u8> {
        let chunks: Vec<Bytes> = backend
            .open_readable(id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_create_then_fetch_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let id = UploadId::new();

        assert!(!backend.exists(&id).await.unwrap());
        backend.create_object(&id, 100, "meta-x").await.unwrap();
        assert!(backend.exists(&id).await.unwrap());

        let attrs = backend.fetch_attributes(&id).await.unwrap();
        assert_eq!(attrs, UploadAttributes::new(100, "meta-x"));
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let id = UploadId::new();

        backend.create_object(&id, 10, "first").await.unwrap();
        let err = backend.create_object(&id, 20, "second").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        // Original properties untouched
        let attrs = backend.fetch_attributes(&id).await.unwrap();
        assert_eq!(attrs.upload_length, 10);
        assert_eq!(attrs.metadata, "first");

        // No temp directories left behind
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().starts_with(".tmp."));
        }
    }

    #[tokio::test]
    async fn test_append_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let id = UploadId::new();
        backend.create_object(&id, 11, "").await.unwrap();

        let offset = backend
            .append_bytes(&id, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(offset, 6);
        let offset = backend
            .append_bytes(&id, 6, Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(offset, 11);

        assert_eq!(backend.fetch_attributes(&id).await.unwrap().offset, 11);
        assert_eq!(read_all(&backend, &id).await, b"hello world");
    }

    #[tokio::test]
    async fn test_append_at_wrong_offset_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let id = UploadId::new();
        backend.create_object(&id, 10, "").await.unwrap();
        backend
            .append_bytes(&id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let err = backend
            .append_bytes(&id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        match err {
            StorageError::OffsetMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 3);
            }
            other => panic!("expected OffsetMismatch, got {other:?}"),
        }
        assert_eq!(read_all(&backend, &id).await, b"abc");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let id = UploadId::new();

        assert!(matches!(
            backend.fetch_attributes(&id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.append_bytes(&id, 0, Bytes::from_static(b"x")).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.open_readable(&id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.health_check().await.unwrap();

        let file_root = dir.path().join("plain-file");
        std::fs::write(&file_root, b"x").unwrap();
        let backend = FilesystemBackend {
            root: file_root,
            append_locks: Mutex::new(HashMap::new()),
        };
        assert!(backend.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_appends_lock_per_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let a = UploadId::new();
        let b = UploadId::new();
        backend.create_object(&a, 8, "").await.unwrap();
        backend.create_object(&b, 8, "").await.unwrap();

        // An append holding one object's lock does not block another object
        let held = backend.append_lock(&a).await;
        let guard = held.lock().await;
        let offset = backend
            .append_bytes(&b, 0, Bytes::from_static(b"bbbb"))
            .await
            .unwrap();
        assert_eq!(offset, 4);
        drop(guard);
        backend.release_append_lock(&a, held).await;

        let (first, second) = tokio::join!(
            backend.append_bytes(&a, 0, Bytes::from_static(b"aaaa")),
            backend.append_bytes(&a, 0, Bytes::from_static(b"AAAA")),
        );
        // Exactly one racing append at the same offset wins
        assert!(first.is_ok() != second.is_ok());
        assert_eq!(backend.fetch_attributes(&a).await.unwrap().offset, 4);
        assert!(backend.append_locks.lock().await.is_empty());
    }
}
