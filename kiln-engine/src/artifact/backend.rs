// Blob backend contract
// put/get/delete/list/head over opaque keys, with range reads and a bounded
// retry helper for transient failures.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::StorageError;

/// Byte range for resumable reads: `start` offset plus optional length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, len: None }
    }

    pub fn slice(start: u64, len: u64) -> Self {
        Self {
            start,
            len: Some(len),
        }
    }

    /// Apply the range to a full buffer.
    pub fn apply(&self, data: &Bytes) -> Bytes {
        let start = (self.start as usize).min(data.len());
        let end = match self.len {
            Some(len) => (start + len as usize).min(data.len()),
            None => data.len(),
        };
        data.slice(start..end)
    }
}

/// Object metadata from `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub size: u64,
}

/// Pluggable storage backend. The store picks one implementation at startup;
/// keys are opaque to the backend.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Store an object, returning its size.
    async fn put(&self, key: &str, data: Bytes) -> Result<u64, StorageError>;

    /// Read an object, optionally a byte range of it.
    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes, StorageError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Object metadata.
    async fn head(&self, key: &str) -> Result<BlobMeta, StorageError>;
}

/// Retry a storage operation with bounded exponential backoff.
///
/// Only transient errors retry; permanent errors and NotFound surface
/// immediately. A success after retries is invisible to callers.
pub async fn retrying<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(attempt, error = %err, "transient storage error, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
            Err(err) => return Err(err),
        }
    }
}
