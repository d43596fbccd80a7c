//! Upload operations over an append-only object store.

use crate::error::{UploadError, UploadResult};
use crate::flusher::RemoteFlusher;
use crate::reader::ChunkedStreamReader;
use crate::retry::RetryPolicy;
use crate::staging::{Chunk, StagingArea};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tusblob_core::{AppConfig, StagingConfig, UploadAttributes, UploadId};
use tusblob_storage::{AppendObjectStore, ByteStream};

/// Inbound upload body.
pub type UploadBody<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// Storage operations a resumable-upload protocol layer drives.
#[async_trait]
pub trait TusStore: Send + Sync {
    /// Create an upload with its declared length and opaque metadata.
    async fn create_upload(&self, upload_length: u64, metadata: &str) -> UploadResult<UploadId>;

    /// Append the body to the upload and return the bytes written.
    ///
    /// Every byte counted in the result is committed remotely before return.
    /// Cancelling `cancel` stops reading; already staged bytes are still
    /// committed.
    async fn append_data(
        &self,
        id: &UploadId,
        body: UploadBody<'_>,
        cancel: &CancellationToken,
    ) -> UploadResult<u64>;

    /// Bytes committed to the remote object.
    async fn get_offset(&self, id: &UploadId) -> UploadResult<u64>;

    /// Declared upload length.
    async fn get_length(&self, id: &UploadId) -> UploadResult<u64>;

    /// Metadata given at creation.
    async fn get_metadata(&self, id: &UploadId) -> UploadResult<String>;

    async fn exists(&self, id: &UploadId) -> UploadResult<bool>;

    /// Stream the bytes committed so far.
    async fn fetch_readable_content(&self, id: &UploadId) -> UploadResult<ByteStream>;
}

/// Staged, ordered upload ingestion.
///
/// Holds no per-upload state between calls; all progress is read from the
/// remote object, so several instances may share one store.
pub struct UploadStore {
    objects: Arc<dyn AppendObjectStore>,
    staging: StagingConfig,
    retry: RetryPolicy,
}

impl UploadStore {
    /// Create a store; fails if `staging` has a zero block size or queue depth.
    pub fn new(
        objects: Arc<dyn AppendObjectStore>,
        staging: StagingConfig,
        retry: RetryPolicy,
    ) -> UploadResult<Self> {
        staging.validate()?;
        Ok(Self {
            objects,
            staging,
            retry,
        })
    }

    /// Build the object store described by `config` and wrap it.
    pub async fn from_config(config: &AppConfig) -> UploadResult<Self> {
        config.validate()?;
        let objects = tusblob_storage::from_config(&config.storage).await?;
        Self::new(
            objects,
            config.staging.clone(),
            RetryPolicy::from(&config.retry),
        )
    }

    pub fn objects(&self) -> &Arc<dyn AppendObjectStore> {
        &self.objects
    }

    /// Fetch the remote attributes of an upload.
    pub async fn attributes(&self, id: &UploadId) -> UploadResult<UploadAttributes> {
        self.objects
            .fetch_attributes(id)
            .await
            .map_err(|e| UploadError::from_storage(id, e))
    }

    /// Remove staging directories left by a crashed process.
    pub async fn reclaim_staging(&self) -> UploadResult<usize> {
        StagingArea::reclaim(&self.staging.root).await
    }

    async fn run_append(
        &self,
        id: &UploadId,
        body: UploadBody<'_>,
        attributes: &UploadAttributes,
        cancel: &CancellationToken,
    ) -> UploadResult<u64> {
        let staging = StagingArea::open(&self.staging.root, id).await?;

        // Cancelled by the caller or by a failing flusher
        let stop = cancel.child_token();
        let (tx, rx) = mpsc::channel(self.staging.max_pending_chunks);

        let mut reader = ChunkedStreamReader::new(body);
        let producer = Producer {
            id: *id,
            staging: &staging,
            block_len: self.staging.block_len(),
            upload_length: attributes.upload_length,
            remaining: attributes.remaining(),
            chunks: tx,
        };
        let flusher = RemoteFlusher::new(
            self.objects.as_ref(),
            &staging,
            &self.retry,
            attributes.offset,
        );

        let (produced, flushed) = tokio::join!(
            producer.run(&mut reader, &stop),
            flusher.run(rx, stop.clone()),
        );

        let closed = staging.close().await;

        let summary = flushed?;
        let written = produced?;
        closed?;

        debug_assert_eq!(written, summary.bytes);
        if cancel.is_cancelled() {
            tracing::info!(
                upload_id = %id,
                bytes = written,
                offset = summary.offset,
                "Append cancelled; staged chunks committed"
            );
        }
        Ok(written)
    }
}

/// Reads blocks from the body and stages them for the flusher.
struct Producer<'a> {
    id: UploadId,
    staging: &'a StagingArea,
    block_len: usize,
    upload_length: u64,
    remaining: u64,
    chunks: mpsc::Sender<Chunk>,
}

impl Producer<'_> {
    /// Returns the bytes pulled from the body. Dropping `chunks` on return
    /// tells the flusher that no more chunks follow.
    async fn run<R>(
        mut self,
        reader: &mut ChunkedStreamReader<R>,
        stop: &CancellationToken,
    ) -> UploadResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut sequence = 0;
        let mut total = 0;

        loop {
            if stop.is_cancelled() {
                return Ok(total);
            }

            if self.remaining == 0 {
                let overflow = reader.read(1, stop).await;
                if let Some(e) = overflow.abort_error {
                    return Err(UploadError::Stream(e));
                }
                if overflow.bytes_read() > 0 {
                    return Err(UploadError::LengthExceeded {
                        id: self.id,
                        upload_length: self.upload_length,
                    });
                }
                return Ok(total);
            }

            let limit = self.remaining.min(self.block_len as u64) as usize;
            let outcome = reader.read(limit, stop).await;

            if !outcome.data.is_empty() {
                sequence += 1;
                let chunk = self.staging.stage(sequence, &outcome.data).await?;
                total += chunk.len;
                self.remaining -= chunk.len;

                if self.chunks.send(chunk).await.is_err() {
                    // Flusher stopped; its error is reported instead
                    return Ok(total);
                }
            }

            if let Some(e) = outcome.abort_error {
                return Err(UploadError::Stream(e));
            }
            if outcome.aborted || outcome.data.is_empty() {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl TusStore for UploadStore {
    #[instrument(skip(self, metadata), fields(backend = self.objects.backend_name()))]
    async fn create_upload(&self, upload_length: u64, metadata: &str) -> UploadResult<UploadId> {
        let id = UploadId::new();
        self.objects
            .create_object(&id, upload_length, metadata)
            .await?;
        tracing::info!(upload_id = %id, upload_length, "Created upload");
        Ok(id)
    }

    #[instrument(skip(self, body, cancel), fields(upload_id = %id, backend = self.objects.backend_name()))]
    async fn append_data(
        &self,
        id: &UploadId,
        body: UploadBody<'_>,
        cancel: &CancellationToken,
    ) -> UploadResult<u64> {
        let attributes = self.attributes(id).await?;

        if attributes.is_complete() {
            tracing::debug!(
                upload_length = attributes.upload_length,
                "Upload already complete; ignoring body"
            );
            return Ok(0);
        }

        let written = self.run_append(id, body, &attributes, cancel).await?;

        tracing::info!(
            bytes = written,
            offset = attributes.offset + written,
            upload_length = attributes.upload_length,
            "Appended data"
        );
        Ok(written)
    }

    async fn get_offset(&self, id: &UploadId) -> UploadResult<u64> {
        Ok(self.attributes(id).await?.offset)
    }

    async fn get_length(&self, id: &UploadId) -> UploadResult<u64> {
        Ok(self.attributes(id).await?.upload_length)
    }

    async fn get_metadata(&self, id: &UploadId) -> UploadResult<String> {
        Ok(self.attributes(id).await?.metadata)
    }

    async fn exists(&self, id: &UploadId) -> UploadResult<bool> {
        Ok(self.objects.exists(id).await?)
    }

    async fn fetch_readable_content(&self, id: &UploadId) -> UploadResult<ByteStream> {
        self.objects
            .open_readable(id)
            .await
            .map_err(|e| UploadError::from_storage(id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tusblob_storage::MemoryBackend;

    fn staging(block_size: u64, max_pending_chunks: usize) -> StagingConfig {
        StagingConfig {
            root: PathBuf::from("/nonexistent/staging"),
            block_size,
            max_pending_chunks,
        }
    }

    fn build(config: StagingConfig) -> UploadResult<UploadStore> {
        UploadStore::new(
            Arc::new(MemoryBackend::new()),
            config,
            RetryPolicy::new(Duration::from_millis(1), 1),
        )
    }

    #[test]
    fn test_new_rejects_zero_queue_depth() {
        match build(staging(4, 0)) {
            Err(UploadError::Core(tusblob_core::Error::Config(_))) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected zero queue depth to be rejected"),
        }
    }

    #[test]
    fn test_new_rejects_zero_block_size() {
        match build(staging(0, 4)) {
            Err(UploadError::Core(tusblob_core::Error::InvalidBlockSize { size: 0, .. })) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected zero block size to be rejected"),
        }
    }

    #[test]
    fn test_new_accepts_valid_staging() {
        let store = build(staging(4, 1)).unwrap();
        assert_eq!(store.objects().backend_name(), "memory");
    }
}
