// In-memory blob backend
// For tests and single-node setups; objects live in a concurrent map.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::artifact::backend::{BlobBackend, BlobMeta, ByteRange};
use crate::error::StorageError;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: DashMap<String, Bytes>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<u64, StorageError> {
        let size = data.len() as u64;
        self.objects.insert(key.to_string(), data);
        Ok(size)
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes, StorageError> {
        let data = self
            .objects
            .get(key)
            .map(|d| d.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(match range {
            Some(range) => range.apply(&data),
            None => data,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn head(&self, key: &str) -> Result<BlobMeta, StorageError> {
        self.objects
            .get(key)
            .map(|d| BlobMeta {
                size: d.len() as u64,
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_list() {
        let backend = MemoryBackend::new();
        backend.put("x/1", Bytes::from("one")).await.unwrap();
        backend.put("x/2", Bytes::from("two")).await.unwrap();
        backend.put("y/3", Bytes::from("three")).await.unwrap();

        assert_eq!(backend.get("x/1", None).await.unwrap(), Bytes::from("one"));
        assert_eq!(backend.list("x/").await.unwrap(), vec!["x/1", "x/2"]);
        assert_eq!(backend.head("y/3").await.unwrap().size, 5);

        backend.delete("x/1").await.unwrap();
        assert!(matches!(
            backend.get("x/1", None).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_range() {
        let backend = MemoryBackend::new();
        backend.put("k", Bytes::from("abcdef")).await.unwrap();
        assert_eq!(
            backend.get("k", Some(ByteRange::slice(1, 3))).await.unwrap(),
            Bytes::from("bcd")
        );
    }
}
