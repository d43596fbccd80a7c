use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tusblob_core::{UploadAttributes, UploadId};
use tusblob_storage::{AppendObjectStore, ByteStream, MemoryBackend, StorageError, StorageResult};

/// Scripted fault for the next append call.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    /// Fail transiently without writing.
    Transient,
    /// Write the bytes, then report a transient failure (lost response).
    TransientAfterCommit,
    /// Fail with a non-retryable error.
    Fatal,
}

/// Memory-backed store that counts calls, records append order and can
/// inject append failures.
#[allow(dead_code)]
pub struct InstrumentedStore {
    inner: MemoryBackend,
    pub creates: Arc<AtomicUsize>,
    pub appends: Arc<AtomicUsize>,
    pub fetches: Arc<AtomicUsize>,
    pub reads: Arc<AtomicUsize>,
    append_offsets: Mutex<Vec<u64>>,
    failures: Mutex<VecDeque<Failure>>,
    always_fail: Option<Failure>,
    append_delay: Duration,
}

#[allow(dead_code)]
impl InstrumentedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(Vec::new(), None, Duration::ZERO))
    }

    /// Inject `failures` into the next append calls, in order.
    pub fn with_failures(failures: Vec<Failure>) -> Arc<Self> {
        Arc::new(Self::build(failures, None, Duration::ZERO))
    }

    /// Every append fails with `failure`.
    pub fn always_failing(failure: Failure) -> Arc<Self> {
        Arc::new(Self::build(Vec::new(), Some(failure), Duration::ZERO))
    }

    /// Every append sleeps for `delay` before touching the object.
    pub fn with_append_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Vec::new(), None, delay))
    }

    fn build(failures: Vec<Failure>, always_fail: Option<Failure>, append_delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            creates: Arc::new(AtomicUsize::new(0)),
            appends: Arc::new(AtomicUsize::new(0)),
            fetches: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
            append_offsets: Mutex::new(Vec::new()),
            failures: Mutex::new(failures.into()),
            always_fail,
            append_delay,
        }
    }

    /// Total calls that touched the store, excluding `fetch_attributes`.
    pub fn mutating_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.appends.load(Ordering::SeqCst)
    }

    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Expected offsets of the appends that committed, in commit order.
    pub fn committed_offsets(&self) -> Vec<u64> {
        self.append_offsets.lock().unwrap().clone()
    }

    pub async fn contents(&self, id: &UploadId) -> Bytes {
        self.inner.contents(id).await.unwrap_or_default()
    }

    fn next_failure(&self) -> Option<Failure> {
        self.always_fail
            .or_else(|| self.failures.lock().unwrap().pop_front())
    }
}

#[async_trait]
impl AppendObjectStore for InstrumentedStore {
    async fn create_if_missing(&self) -> StorageResult<()> {
        self.inner.create_if_missing().await
    }

    async fn create_object(
        &self,
        id: &UploadId,
        upload_length: u64,
        metadata: &str,
    ) -> StorageResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_object(id, upload_length, metadata).await
    }

    async fn append_bytes(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if !self.append_delay.is_zero() {
            tokio::time::sleep(self.append_delay).await;
        }

        match self.next_failure() {
            Some(Failure::Transient) => {
                Err(StorageError::Transient("injected 503".to_string()))
            }
            Some(Failure::Fatal) => Err(StorageError::InvalidAttributes(
                "injected fatal failure".to_string(),
            )),
            Some(Failure::TransientAfterCommit) => {
                self.inner.append_bytes(id, expected_offset, data).await?;
                self.append_offsets.lock().unwrap().push(expected_offset);
                Err(StorageError::Transient("injected lost response".to_string()))
            }
            None => {
                let offset = self.inner.append_bytes(id, expected_offset, data).await?;
                self.append_offsets.lock().unwrap().push(expected_offset);
                Ok(offset)
            }
        }
    }

    async fn fetch_attributes(&self, id: &UploadId) -> StorageResult<UploadAttributes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_attributes(id).await
    }

    async fn exists(&self, id: &UploadId) -> StorageResult<bool> {
        self.inner.exists(id).await
    }

    async fn open_readable(&self, id: &UploadId) -> StorageResult<ByteStream> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.open_readable(id).await
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
