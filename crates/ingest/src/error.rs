//! Upload pipeline error types.

use thiserror::Error;
use tusblob_core::UploadId;
use tusblob_storage::StorageError;

/// Errors raised by upload operations.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload not found: {0}")]
    NotFound(UploadId),

    #[error("upload {id} declares {upload_length} bytes; stream carries more")]
    LengthExceeded { id: UploadId, upload_length: u64 },

    #[error("an append is already in progress for upload {0}")]
    AppendInProgress(UploadId),

    #[error("inbound stream failed: {0}")]
    Stream(#[source] std::io::Error),

    #[error("staging error at {}: {source}", path.display())]
    Staging {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk {actual} of upload {id} arrived out of order (expected {expected})")]
    OutOfOrder {
        id: UploadId,
        expected: u64,
        actual: u64,
    },

    #[error("remote append of chunk {sequence} for upload {id} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        id: UploadId,
        sequence: u64,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("remote append of chunk {sequence} for upload {id} failed: {source}")]
    Append {
        id: UploadId,
        sequence: u64,
        #[source]
        source: StorageError,
    },

    #[error("upload {id} was modified concurrently: expected offset {expected}, remote has {actual}")]
    OffsetConflict {
        id: UploadId,
        expected: u64,
        actual: u64,
    },

    #[error("core error: {0}")]
    Core(#[from] tusblob_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UploadError {
    /// The client sent bytes that contradict the upload's declared state.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::LengthExceeded { .. })
    }

    /// The failure stems from a fault that may clear on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } | Self::AppendInProgress(_) => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Map a storage error for a known upload, keeping NotFound typed.
    pub(crate) fn from_storage(id: &UploadId, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => Self::NotFound(*id),
            other => Self::Storage(other),
        }
    }
}

/// Result type for upload operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;
