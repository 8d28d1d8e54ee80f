// Artifact metadata entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{ArtifactId, RunId};

/// Metadata for a named binary produced by a run.
///
/// The storage key is unique and opaque; size is fixed at seal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    /// Logical name; collisions within a run get an occurrence suffix.
    pub name: String,
    /// Content-addressed backend key.
    pub storage_key: String,
    /// Hex sha-256 of the content.
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set by the retention sweep before the backend object is deleted.
    pub expired: bool,
}

impl Artifact {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let artifact = Artifact {
            id: ArtifactId::new(),
            run_id: RunId::new(),
            name: "bundle".into(),
            storage_key: "k".into(),
            digest: "d".into(),
            size: 5,
            created_at: now,
            expires_at: now + Duration::days(30),
            expired: false,
        };

        assert!(!artifact.is_expired_at(now));
        assert!(artifact.is_expired_at(now + Duration::days(31)));

        let mut flagged = artifact;
        flagged.expired = true;
        assert!(flagged.is_expired_at(now));
    }
}
