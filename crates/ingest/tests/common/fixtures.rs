use super::mocks::InstrumentedStore;
use bytes::Bytes;
use futures::stream;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;
use tokio_util::io::StreamReader;
use tusblob_core::StagingConfig;
use tusblob_ingest::{RetryPolicy, UploadStore};

/// Inbound body replaying `parts`, including injected faults.
#[allow(dead_code)]
pub fn body(parts: Vec<io::Result<Bytes>>) -> StreamReader<stream::Iter<std::vec::IntoIter<io::Result<Bytes>>>, Bytes> {
    StreamReader::new(stream::iter(parts))
}

/// Generate deterministic test data using a seeded pseudo-random generator
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// An upload store over an instrumented backend with a temporary staging root.
#[allow(dead_code)]
pub struct Harness {
    pub store: UploadStore,
    pub backend: Arc<InstrumentedStore>,
    pub staging_root: PathBuf,
    _temp: TempDir,
}

#[allow(dead_code)]
impl Harness {
    /// Staging directory an append for `id` would use.
    pub fn staging_dir(&self, id: &tusblob_core::UploadId) -> PathBuf {
        self.staging_root.join(id.to_string())
    }
}

/// Build a harness with a small block size so tests span several chunks.
#[allow(dead_code)]
pub fn harness(backend: Arc<InstrumentedStore>, block_size: u64) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let staging_root = temp.path().join("staging");
    let staging = StagingConfig {
        root: staging_root.clone(),
        block_size,
        max_pending_chunks: 4,
    };
    let store = UploadStore::new(
        backend.clone(),
        staging,
        RetryPolicy::new(Duration::from_millis(1), 3),
    )
    .unwrap();

    Harness {
        store,
        backend,
        staging_root,
        _temp: temp,
    }
}
