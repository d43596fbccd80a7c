//! Ordered commit of staged chunks to the remote object.

use crate::error::{UploadError, UploadResult};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::staging::{Chunk, StagingArea};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tusblob_core::UploadId;
use tusblob_storage::{AppendObjectStore, StorageError};

/// Totals for one flusher run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Chunks committed.
    pub chunks: u64,
    /// Bytes committed.
    pub bytes: u64,
    /// Remote offset after the last commit.
    pub offset: u64,
}

/// Consumes staged chunks and appends them to the remote object in sequence.
///
/// Chunks are committed strictly in order starting at sequence 1. Each
/// committed chunk's staging file is deleted before the next is attempted.
pub struct RemoteFlusher<'a> {
    store: &'a dyn AppendObjectStore,
    staging: &'a StagingArea,
    retry: &'a RetryPolicy,
    id: UploadId,
    next_sequence: u64,
    summary: FlushSummary,
}

impl<'a> RemoteFlusher<'a> {
    /// Create a flusher continuing from the remote object's current `offset`.
    pub fn new(
        store: &'a dyn AppendObjectStore,
        staging: &'a StagingArea,
        retry: &'a RetryPolicy,
        offset: u64,
    ) -> Self {
        Self {
            store,
            staging,
            retry,
            id: *staging.upload_id(),
            next_sequence: 1,
            summary: FlushSummary {
                offset,
                ..FlushSummary::default()
            },
        }
    }

    /// Drain `chunks` until the producer hangs up.
    ///
    /// On failure `fault` is cancelled so the producer stops reading, and the
    /// receiver is dropped so a blocked send returns.
    pub async fn run(
        mut self,
        mut chunks: mpsc::Receiver<Chunk>,
        fault: CancellationToken,
    ) -> UploadResult<FlushSummary> {
        while let Some(chunk) = chunks.recv().await {
            if let Err(e) = self.flush(chunk).await {
                tracing::error!(upload_id = %self.id, error = %e, "Flusher failed");
                fault.cancel();
                return Err(e);
            }
        }
        Ok(self.summary)
    }

    async fn flush(&mut self, chunk: Chunk) -> UploadResult<()> {
        if chunk.sequence != self.next_sequence {
            return Err(UploadError::OutOfOrder {
                id: self.id,
                expected: self.next_sequence,
                actual: chunk.sequence,
            });
        }

        let data = self.staging.load(&chunk).await?;
        let expected = self.summary.offset;
        let target = expected + chunk.len;
        let sequence = chunk.sequence;
        let store = self.store;
        let id = self.id;

        let new_offset = self
            .retry
            .run(move |attempt| {
                let data = data.clone();
                async move {
                    match store.append_bytes(&id, expected, data).await {
                        // An earlier attempt may have landed before its response was lost
                        Err(StorageError::OffsetMismatch { .. }) if attempt > 1 => {
                            let attributes = store.fetch_attributes(&id).await?;
                            if attributes.offset == target {
                                tracing::info!(
                                    upload_id = %id,
                                    sequence,
                                    attempt,
                                    "Earlier append attempt had committed"
                                );
                                Ok(attributes.offset)
                            } else {
                                Err(StorageError::OffsetMismatch {
                                    key: id.to_string(),
                                    expected,
                                    actual: attributes.offset,
                                })
                            }
                        }
                        other => other,
                    }
                }
            })
            .await
            .map_err(|failure| self.escalate(sequence, failure))?;

        if new_offset != target {
            return Err(UploadError::OffsetConflict {
                id: self.id,
                expected: target,
                actual: new_offset,
            });
        }

        self.staging.discard(&chunk).await?;
        self.summary.chunks += 1;
        self.summary.bytes += chunk.len;
        self.summary.offset = new_offset;
        self.next_sequence += 1;

        tracing::debug!(
            upload_id = %self.id,
            sequence = chunk.sequence,
            len = chunk.len,
            offset = new_offset,
            "Committed chunk"
        );
        Ok(())
    }

    fn escalate(&self, sequence: u64, failure: RetryFailure) -> UploadError {
        let RetryFailure {
            attempts,
            exhausted,
            error,
        } = failure;

        if exhausted {
            return UploadError::RetriesExhausted {
                id: self.id,
                sequence,
                attempts,
                source: error,
            };
        }
        match error {
            StorageError::OffsetMismatch {
                expected, actual, ..
            } => UploadError::OffsetConflict {
                id: self.id,
                expected,
                actual,
            },
            StorageError::NotFound(_) => UploadError::NotFound(self.id),
            source => UploadError::Append {
                id: self.id,
                sequence,
                source,
            },
        }
    }
}
