use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tempfile::TempDir;
use tusblob_core::UploadId;
use tusblob_storage::{AppendObjectStore, FilesystemBackend, MemoryBackend};

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Every backend that runs without external services.
///
/// The returned `TempDir` must outlive the backends.
#[allow(dead_code)]
pub async fn backends() -> (TempDir, Vec<Arc<dyn AppendObjectStore>>) {
    let temp = TempDir::new().unwrap();
    let filesystem = FilesystemBackend::new(temp.path().join("objects"))
        .await
        .unwrap();
    let stores: Vec<Arc<dyn AppendObjectStore>> =
        vec![Arc::new(filesystem), Arc::new(MemoryBackend::new())];
    (temp, stores)
}

/// Collect an object's readable stream.
#[allow(dead_code)]
pub async fn read_all(store: &dyn AppendObjectStore, id: &UploadId) -> Vec<u8> {
    let mut stream = store.open_readable(id).await.unwrap();
    let mut out = Vec::new();
    while let Some(part) = stream.next().await {
        out.extend_from_slice(&part.unwrap());
    }
    out
}
