//! In-process append object store.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AppendObjectStore, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::instrument;
use tusblob_core::{UploadAttributes, UploadId};

struct MemoryObject {
    upload_length: u64,
    metadata: String,
    data: BytesMut,
}

/// Object store keeping every object in memory.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<UploadId, MemoryObject>>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an object's bytes.
    pub async fn contents(&self, id: &UploadId) -> Option<Bytes> {
        let objects = self.objects.lock().await;
        objects.get(id).map(|o| Bytes::copy_from_slice(&o.data))
    }
}

#[async_trait]
impl AppendObjectStore for MemoryBackend {
    async fn create_if_missing(&self) -> StorageResult<()> {
        Ok(())
    }

    #[instrument(skip(self, metadata), fields(backend = "memory", upload_id = %id))]
    async fn create_object(
        &self,
        id: &UploadId,
        upload_length: u64,
        metadata: &str,
    ) -> StorageResult<()> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(id) {
            return Err(StorageError::AlreadyExists(id.to_string()));
        }
        objects.insert(
            *id,
            MemoryObject {
                upload_length,
                metadata: metadata.to_string(),
                data: BytesMut::new(),
            },
        );
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "memory", upload_id = %id, size = data.len()))]
    async fn append_bytes(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let mut objects = self.objects.lock().await;
        let object = objects
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let actual = object.data.len() as u64;
        if actual != expected_offset {
            return Err(StorageError::OffsetMismatch {
                key: id.to_string(),
                expected: expected_offset,
                actual,
            });
        }

        object.data.extend_from_slice(&data);
        Ok(object.data.len() as u64)
    }

    async fn fetch_attributes(&self, id: &UploadId) -> StorageResult<UploadAttributes> {
        let objects = self.objects.lock().await;
        let object = objects
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(UploadAttributes {
            upload_length: object.upload_length,
            metadata: object.metadata.clone(),
            offset: object.data.len() as u64,
        })
    }

    async fn exists(&self, id: &UploadId) -> StorageResult<bool> {
        Ok(self.objects.lock().await.contains_key(id))
    }

    async fn open_readable(&self, id: &UploadId) -> StorageResult<ByteStream> {
        let data = self
            .contents(id)
            .await
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
