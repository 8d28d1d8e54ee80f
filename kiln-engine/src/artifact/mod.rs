// Artifact store
// Content-addressed uploads with quotas and occurrence-suffix naming, signed
// downloads honoring expiry, and the retention sweep.

pub mod backend;
pub mod fs;
pub mod memory;
pub mod object;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Limits, Retention, StorageBackendKind, StorageConfig};
use crate::error::{EngineError, StorageError};
use crate::model::{Artifact, ArtifactId, RunId};

pub use backend::{retrying, BlobBackend, BlobMeta, ByteRange};
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use object::ObjectStoreBackend;

/// A time-limited, signed grant to download one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDownload {
    pub artifact: ArtifactId,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

/// Per-run accounting guarded together so quota checks and name suffixes
/// are race-free.
#[derive(Debug, Default)]
struct RunUsage {
    total_bytes: u64,
    names: Vec<String>,
}

pub struct ArtifactStore {
    backend: Arc<dyn BlobBackend>,
    meta: DashMap<ArtifactId, Artifact>,
    usage: Mutex<HashMap<RunId, RunUsage>>,
    limits: Limits,
    retention: Retention,
    signing_key: [u8; 32],
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn BlobBackend>, limits: Limits, retention: Retention) -> Self {
        let mut signing_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut signing_key);
        Self {
            backend,
            meta: DashMap::new(),
            usage: Mutex::new(HashMap::new()),
            limits,
            retention,
            signing_key,
        }
    }

    /// Build the backend selected by configuration.
    pub fn from_config(
        storage: &StorageConfig,
        limits: Limits,
        retention: Retention,
    ) -> Self {
        let backend: Arc<dyn BlobBackend> = match storage.backend {
            StorageBackendKind::Filesystem => {
                Arc::new(FsBackend::new(storage.filesystem.root.clone()))
            }
            StorageBackendKind::ObjectStore => {
                Arc::new(ObjectStoreBackend::new(&storage.object_store))
            }
            StorageBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Self::new(backend, limits, retention)
    }

    /// Upload an artifact for a run.
    ///
    /// The stored name gets an occurrence suffix on collision (`dist`,
    /// `dist-2`, ...). Fails with QuotaExceeded before touching the backend.
    pub async fn upload(
        &self,
        run_id: RunId,
        name: &str,
        data: Bytes,
    ) -> Result<Artifact, EngineError> {
        self.upload_with_retention(run_id, name, data, self.retention.artifact_default_days)
            .await
    }

    /// Upload with an explicit retention window; archived logs use
    /// `retention.log_days` through this path.
    pub async fn upload_with_retention(
        &self,
        run_id: RunId,
        name: &str,
        data: Bytes,
        retention_days: u32,
    ) -> Result<Artifact, EngineError> {
        let size = data.len() as u64;
        if size > self.limits.artifact_size_bytes {
            return Err(EngineError::QuotaExceeded(format!(
                "artifact '{name}' is {size} bytes, per-artifact cap is {}",
                self.limits.artifact_size_bytes
            )));
        }

        // Reserve quota and the final name under the usage lock.
        let final_name = {
            let mut usage = self.usage.lock();
            let entry = usage.entry(run_id).or_default();
            if entry.total_bytes + size > self.limits.run_artifact_total_bytes {
                return Err(EngineError::QuotaExceeded(format!(
                    "run {run_id} would exceed its artifact total of {} bytes",
                    self.limits.run_artifact_total_bytes
                )));
            }
            let final_name = next_name(&entry.names, name);
            entry.total_bytes += size;
            entry.names.push(final_name.clone());
            final_name
        };

        let id = ArtifactId::new();
        let digest = format!("{:x}", Sha256::digest(&data));
        let storage_key = format!("{run_id}/{}-{id}", &digest[..16]);

        let stored = retrying(3, || self.backend.put(&storage_key, data.clone())).await;
        let stored_size = match stored {
            Ok(size) => size,
            Err(err) => {
                // Roll the reservation back; the upload never happened.
                let mut usage = self.usage.lock();
                if let Some(entry) = usage.get_mut(&run_id) {
                    entry.total_bytes = entry.total_bytes.saturating_sub(size);
                    entry.names.retain(|n| n != &final_name);
                }
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let artifact = Artifact {
            id,
            run_id,
            name: final_name,
            storage_key,
            digest,
            size: stored_size,
            created_at: now,
            expires_at: now + Duration::days(i64::from(retention_days)),
            expired: false,
        };
        self.meta.insert(id, artifact.clone());
        info!(artifact = %id, run = %run_id, name = %artifact.name, size, "artifact stored");
        Ok(artifact)
    }

    pub fn head(&self, id: ArtifactId) -> Option<Artifact> {
        self.meta.get(&id).map(|a| a.clone())
    }

    /// Artifacts of a run, expired ones excluded.
    pub fn list_for_run(&self, run_id: RunId) -> Vec<Artifact> {
        let now = Utc::now();
        let mut artifacts: Vec<Artifact> = self
            .meta
            .iter()
            .filter(|a| a.run_id == run_id && !a.is_expired_at(now))
            .map(|a| a.clone())
            .collect();
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        artifacts
    }

    /// Download artifact content; expired artifacts read as NotFound.
    pub async fn download(
        &self,
        id: ArtifactId,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let artifact = self
            .meta
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if artifact.is_expired_at(Utc::now()) {
            return Err(StorageError::NotFound(id.to_string()));
        }
        retrying(3, || self.backend.get(&artifact.storage_key, range)).await
    }

    /// Issue a signed download grant.
    pub fn signed_download(
        &self,
        id: ArtifactId,
        ttl: std::time::Duration,
    ) -> Result<SignedDownload, StorageError> {
        let artifact = self
            .meta
            .get(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if artifact.is_expired_at(Utc::now()) {
            return Err(StorageError::NotFound(id.to_string()));
        }
        let expires_at =
            Utc::now() + Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(10));
        Ok(SignedDownload {
            artifact: id,
            expires_at,
            signature: self.sign(id, expires_at),
        })
    }

    /// Validate a signed grant: signature intact and not yet expired.
    pub fn verify(&self, grant: &SignedDownload) -> bool {
        grant.expires_at > Utc::now() && self.sign(grant.artifact, grant.expires_at) == grant.signature
    }

    fn sign(&self, id: ArtifactId, expires_at: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key);
        hasher.update(id.to_string().as_bytes());
        hasher.update(expires_at.timestamp().to_be_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Retention sweep: mark artifacts past expires-at, then delete their
    /// backend objects. Returns how many were reaped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Artifact> = self
            .meta
            .iter()
            .filter(|a| !a.expired && a.expires_at < now)
            .map(|a| a.clone())
            .collect();

        let mut reaped = 0;
        for artifact in due {
            if let Some(mut entry) = self.meta.get_mut(&artifact.id) {
                entry.expired = true;
            }
            match retrying(3, || self.backend.delete(&artifact.storage_key)).await {
                Ok(()) => {
                    reaped += 1;
                    info!(artifact = %artifact.id, name = %artifact.name, "expired artifact reaped");
                }
                Err(err) => {
                    warn!(artifact = %artifact.id, error = %err, "failed to delete expired artifact");
                }
            }
        }
        reaped
    }
}

/// First free occurrence-suffixed name: `dist`, `dist-2`, `dist-3`, ...
fn next_name(taken: &[String], base: &str) -> String {
    if !taken.iter().any(|n| n == base) {
        return base.to_string();
    }
    let mut occurrence = 2;
    loop {
        let candidate = format!("{base}-{occurrence}");
        if !taken.iter().any(|n| n == &candidate) {
            return candidate;
        }
        occurrence += 1;
    }
}
