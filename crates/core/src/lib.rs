//! Core domain types shared by the tusblob crates.
//!
//! This crate defines:
//! - Upload identifiers and the remote attribute set of an upload
//! - The per-upload state machine derived from those attributes
//! - Configuration for storage, local staging and remote retries

pub mod config;
pub mod error;
pub mod upload;

pub use config::{AppConfig, RetryConfig, StagingConfig, StorageConfig};
pub use error::{Error, Result};
pub use upload::{UploadAttributes, UploadId, UploadState};

/// Default staging block size: 4 MiB, the size of one remote append block.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum staging block size: 64 MiB
pub const MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
