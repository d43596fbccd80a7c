//! S3 append object store.
//!
//! Requires a bucket type that supports appends through `WriteOffsetBytes`
//! on `PutObject` (S3 Express One Zone directory buckets and compatible
//! services). The upload length and metadata travel as user metadata of the
//! creating `PutObject`, which is conditional on `If-None-Match: *`.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AppendObjectStore, ByteStream};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use tusblob_core::{UploadAttributes, UploadId};

/// User metadata key holding the declared upload length.
const UPLOAD_LENGTH_KEY: &str = "upload-length";

/// User metadata key holding the opaque upload metadata.
const UPLOAD_METADATA_KEY: &str = "upload-metadata";

/// S3 append object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// Explicit credentials are used as given; otherwise the AWS default
    /// credential chain is loaded for the resolved region.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let region = aws_config::Region::new(resolved_region.clone());

        let mut s3_config_builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    key_id, secret, None, None, "tusblob-config",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        let normalized_endpoint = endpoint.map(|endpoint_url| {
            // Bare host:port endpoints get http://
            let lower = endpoint_url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain HTTP endpoints must not depend on native trust roots
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            region: resolved_region,
        })
    }

    /// Get the full object key for an upload (applies prefix if configured).
    fn full_key(&self, id: &UploadId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{id}"),
            None => id.to_string(),
        }
    }

    /// Status code of a service error response, if any.
    fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
        match err {
            SdkError::ServiceError(service_err) => Some(service_err.raw().status().as_u16()),
            _ => None,
        }
    }

    /// Convert an AWS SDK error to StorageError.
    ///
    /// Transport failures, timeouts, throttling and 5xx responses are
    /// transient; 404 maps to NotFound.
    fn map_sdk_error<E>(err: SdkError<E>, id: &UploadId) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                return StorageError::Transient(format!("{id}: {err}"));
            }
            _ => {}
        }

        match Self::status_of(&err) {
            Some(404) => StorageError::NotFound(id.to_string()),
            Some(status) if status == 429 || status >= 500 => {
                StorageError::Transient(format!("{id}: HTTP {status}: {err}"))
            }
            _ => StorageError::S3(Box::new(err)),
        }
    }

    /// Reject metadata S3 cannot carry in a header value.
    fn validate_metadata(metadata: &str) -> StorageResult<()> {
        if !metadata.is_ascii() || metadata.chars().any(|c| c.is_ascii_control()) {
            return Err(StorageError::InvalidAttributes(
                "s3 user metadata must be printable ASCII".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the user metadata map returned by HeadObject.
    fn attributes_from_head(
        id: &UploadId,
        metadata: Option<&std::collections::HashMap<String, String>>,
        content_length: Option<i64>,
    ) -> StorageResult<UploadAttributes> {
        let metadata = metadata.ok_or_else(|| {
            StorageError::InvalidAttributes(format!("{id}: object has no user metadata"))
        })?;

        let upload_length = metadata
            .get(UPLOAD_LENGTH_KEY)
            .ok_or_else(|| {
                StorageError::InvalidAttributes(format!("{id}: missing {UPLOAD_LENGTH_KEY}"))
            })?
            .parse::<u64>()
            .map_err(|e| {
                StorageError::InvalidAttributes(format!("{id}: bad {UPLOAD_LENGTH_KEY}: {e}"))
            })?;

        Ok(UploadAttributes {
            upload_length,
            metadata: metadata
                .get(UPLOAD_METADATA_KEY)
                .cloned()
                .unwrap_or_default(),
            offset: content_length.unwrap_or(0).max(0) as u64,
        })
    }
}

#[async_trait]
impl AppendObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn create_if_missing(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) if Self::status_of(&err) == Some(404) => {}
            Err(err) => return Err(StorageError::S3(Box::new(err))),
        }

        tracing::info!(bucket = %self.bucket, "Creating missing bucket");
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(err) => Err(StorageError::S3(Box::new(err))),
        }
    }

    #[instrument(skip(self, metadata), fields(backend = "s3", upload_id = %id))]
    async fn create_object(
        &self,
        id: &UploadId,
        upload_length: u64,
        metadata: &str,
    ) -> StorageResult<()> {
        Self::validate_metadata(metadata)?;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(id))
            .if_none_match("*")
            .metadata(UPLOAD_LENGTH_KEY, upload_length.to_string())
            .metadata(UPLOAD_METADATA_KEY, metadata)
            .body(Bytes::new().into())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            // 412 Precondition Failed: object already there
            Err(err) if Self::status_of(&err) == Some(412) => {
                Err(StorageError::AlreadyExists(id.to_string()))
            }
            Err(err) => Err(Self::map_sdk_error(err, id)),
        }
    }

    #[instrument(skip(self, data), fields(backend = "s3", upload_id = %id, size = data.len()))]
    async fn append_bytes(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let write_offset = i64::try_from(expected_offset).map_err(|_| {
            StorageError::InvalidAttributes(format!("{id}: offset {expected_offset} too large"))
        })?;
        let len = data.len() as u64;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(id))
            .write_offset_bytes(write_offset)
            .body(data.into())
            .send()
            .await;

        match result {
            Ok(_) => Ok(expected_offset + len),
            Err(err) if Self::status_of(&err) == Some(400) => {
                // InvalidWriteOffset: report the real position
                let actual = self.fetch_attributes(id).await?.offset;
                if actual != expected_offset {
                    Err(StorageError::OffsetMismatch {
                        key: id.to_string(),
                        expected: expected_offset,
                        actual,
                    })
                } else {
                    Err(StorageError::S3(Box::new(err)))
                }
            }
            Err(err) => Err(Self::map_sdk_error(err, id)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3", upload_id = %id))]
    async fn fetch_attributes(&self, id: &UploadId) -> StorageResult<UploadAttributes> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(id))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, id))?;

        Self::attributes_from_head(id, output.metadata(), output.content_length())
    }

    #[instrument(skip(self), fields(backend = "s3", upload_id = %id))]
    async fn exists(&self, id: &UploadId) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(id))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if Self::status_of(&err) == Some(404) => Ok(false),
            Err(err) => Err(Self::map_sdk_error(err, id)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3", upload_id = %id))]
    async fn open_readable(&self, id: &UploadId) -> StorageResult<ByteStream> {
        use futures::StreamExt;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(id))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, id))?;

        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let request = self.client.head_bucket().bucket(&self.bucket).send();
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, request)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(())
    }
}
