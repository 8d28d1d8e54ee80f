// Filesystem blob backend

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::artifact::backend::{BlobBackend, BlobMeta, ByteRange};
use crate::error::StorageError;

/// Stores objects as files under a root directory; keys become relative
/// paths.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key, rejecting path escapes.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part == ".." || part == "." || part.is_empty())
        {
            return Err(StorageError::Permanent(format!("invalid key '{key}'")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobBackend for FsBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<u64, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(data.len() as u64)
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        let data = Bytes::from(tokio::fs::read(&path).await?);
        Ok(match range {
            Some(range) => range.apply(&data),
            None => data,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        collect(&self.root, &self.root, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn head(&self, key: &str) -> Result<BlobMeta, StorageError> {
        let path = self.path_for(key)?;
        let meta = tokio::fs::metadata(&path).await?;
        Ok(BlobMeta { size: meta.len() })
    }
}

/// Walk the tree iteratively; recursion and async fns don't mix cheaply.
async fn collect(root: &Path, start: &Path, out: &mut Vec<String>) -> Result<(), StorageError> {
    let mut pending = vec![start.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().map_or(true, |e| e != "partial") {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, FsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        (dir, backend)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, backend) = backend();
        let data = Bytes::from("artifact bytes");
        let size = backend.put("run1/bundle", data.clone()).await.unwrap();
        assert_eq!(size, data.len() as u64);

        let back = backend.get("run1/bundle", None).await.unwrap();
        assert_eq!(back, data);

        let head = backend.head("run1/bundle").await.unwrap();
        assert_eq!(head.size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_range_read() {
        let (_dir, backend) = backend();
        backend
            .put("k", Bytes::from("0123456789"))
            .await
            .unwrap();
        let tail = backend.get("k", Some(ByteRange::from(5))).await.unwrap();
        assert_eq!(tail, Bytes::from("56789"));
        let mid = backend
            .get("k", Some(ByteRange::slice(2, 3)))
            .await
            .unwrap();
        assert_eq!(mid, Bytes::from("234"));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (_dir, backend) = backend();
        let err = backend.get("nope", None).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        let err = backend.head("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, backend) = backend();
        backend.put("k", Bytes::from("x")).await.unwrap();
        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(backend.get("k", None).await.is_err());
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let (_dir, backend) = backend();
        backend.put("a/one", Bytes::from("1")).await.unwrap();
        backend.put("a/two", Bytes::from("2")).await.unwrap();
        backend.put("b/three", Bytes::from("3")).await.unwrap();

        let a = backend.list("a/").await.unwrap();
        assert_eq!(a, vec!["a/one", "a/two"]);
        let all = backend.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_dir, backend) = backend();
        assert!(backend.put("../evil", Bytes::from("x")).await.is_err());
        assert!(backend.get("/abs", None).await.is_err());
        assert!(backend.get("a//b", None).await.is_err());
    }
}
