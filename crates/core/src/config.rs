//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote object store holding the uploads.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local write-ahead staging.
    #[serde(default)]
    pub staging: StagingConfig,
    /// Retry policy for remote appends.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate().map_err(crate::Error::Config)?;
        self.staging.validate()?;
        self.retry.validate().map_err(crate::Error::Config)?;
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem emulation of append objects.
    Filesystem {
        /// Root directory for objects.
        path: PathBuf,
    },
    /// S3 bucket with append support (`WriteOffsetBytes`).
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for S3-compatible services).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`).
        #[serde(default)]
        force_path_style: bool,
    },
    /// In-process store, lost on exit.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/objects"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Local staging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root directory; each in-flight append owns one subdirectory.
    #[serde(default = "default_staging_root")]
    pub root: PathBuf,
    /// Bytes read from the inbound stream per staged chunk.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Staged chunks the reader may run ahead of the remote flusher.
    #[serde(default = "default_max_pending_chunks")]
    pub max_pending_chunks: usize,
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("./data/staging")
}

fn default_block_size() -> u64 {
    crate::DEFAULT_BLOCK_SIZE
}

fn default_max_pending_chunks() -> usize {
    4
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: default_staging_root(),
            block_size: default_block_size(),
            max_pending_chunks: default_max_pending_chunks(),
        }
    }
}

impl StagingConfig {
    /// Validate block size and queue depth.
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_size == 0 || self.block_size > crate::MAX_BLOCK_SIZE {
            return Err(crate::Error::InvalidBlockSize {
                size: self.block_size,
                min: 1,
                max: crate::MAX_BLOCK_SIZE,
            });
        }
        if self.max_pending_chunks == 0 {
            return Err(crate::Error::Config(
                "staging.max_pending_chunks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Block size as a buffer length.
    pub fn block_len(&self) -> usize {
        // Bounded by MAX_BLOCK_SIZE once validated
        usize::try_from(self.block_size).unwrap_or(usize::MAX)
    }
}

/// Linear retry policy for remote appends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fixed delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    /// Total attempts per chunk, including the first.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_retry_max_attempts() -> u32 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_retry_delay_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// Get the retry delay as a Duration.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Validate the attempt count.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}
