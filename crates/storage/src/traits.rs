//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use tusblob_core::{UploadAttributes, UploadId};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Remote append-only object store.
///
/// Objects are keyed by upload id, carry the declared upload length and an
/// opaque metadata string from the moment they exist, and only ever grow by
/// appending at their current end.
#[async_trait]
pub trait AppendObjectStore: Send + Sync + 'static {
    /// Ensure the container holding the objects exists.
    async fn create_if_missing(&self) -> StorageResult<()>;

    /// Create an empty object with its upload length and metadata set.
    ///
    /// The object must never be observable without both properties.
    /// Returns `AlreadyExists` if an object with this id exists.
    async fn create_object(
        &self,
        id: &UploadId,
        upload_length: u64,
        metadata: &str,
    ) -> StorageResult<()>;

    /// Append bytes at `expected_offset` and return the new object length.
    ///
    /// Returns `OffsetMismatch` if the object's current length is not
    /// `expected_offset`; nothing is written in that case.
    async fn append_bytes(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> StorageResult<u64>;

    /// Fetch upload length, metadata and current length.
    async fn fetch_attributes(&self, id: &UploadId) -> StorageResult<UploadAttributes>;

    /// Check if an object exists.
    async fn exists(&self, id: &UploadId) -> StorageResult<bool>;

    /// Open the object's current content as a byte stream.
    async fn open_readable(&self, id: &UploadId) -> StorageResult<ByteStream>;

    /// Get the name of this storage backend.
    ///
    /// Used for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
