//! Durable ingestion of resumable uploads.
//!
//! An append call pulls fixed-size blocks from the inbound body, stages each
//! block on local disk, and commits the staged blocks to the remote
//! append-only object strictly in order:
//!
//! - [`ChunkedStreamReader`] reads blocks and survives client disconnects
//! - [`StagingArea`] holds staged chunks for exactly one call
//! - [`RemoteFlusher`] appends chunks with bounded linear retry
//! - [`UploadStore`] ties them together behind the [`TusStore`] operations

pub mod error;
pub mod flusher;
pub mod reader;
pub mod retry;
pub mod staging;
pub mod store;

pub use error::{UploadError, UploadResult};
pub use flusher::{FlushSummary, RemoteFlusher};
pub use reader::{ChunkedStreamReader, ReadOutcome};
pub use retry::RetryPolicy;
pub use staging::{Chunk, StagingArea};
pub use store::{TusStore, UploadBody, UploadStore};
