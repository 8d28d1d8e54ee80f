// Runner entity
// Runners are independent lifetime-wise; jobs reference them by id only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::RunnerId;

/// Visibility scope of a runner. Resolution order for a job is
/// repo, then org, then global.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "level", content = "name")]
pub enum RunnerScope {
    Repo(String),
    Org(String),
    Global,
}

impl RunnerScope {
    /// Whether a runner in this scope may serve jobs of the given repo.
    ///
    /// Org membership is by repo prefix (`org/repo`).
    pub fn covers(&self, repo: &str) -> bool {
        match self {
            RunnerScope::Repo(r) => r == repo,
            RunnerScope::Org(org) => repo.split('/').next() == Some(org.as_str()),
            RunnerScope::Global => true,
        }
    }

    /// Precedence for scope resolution, lower wins.
    pub fn precedence(&self) -> u8 {
        match self {
            RunnerScope::Repo(_) => 0,
            RunnerScope::Org(_) => 1,
            RunnerScope::Global => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// Short-lived container launched by the runner manager for one job.
    EphemeralContainer,
    SelfHosted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Online,
    Busy,
    Offline,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Online => "online",
            RunnerStatus::Busy => "busy",
            RunnerStatus::Offline => "offline",
        }
    }
}

/// Host metadata reported at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerMetadata {
    pub version: String,
    pub os: String,
    pub arch: String,
}

/// An execution host with a label set that claims jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub scope: RunnerScope,
    pub labels: Vec<String>,
    pub kind: RunnerKind,
    pub status: RunnerStatus,
    pub metadata: RunnerMetadata,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Runner {
    /// Whether this runner's labels satisfy a job's required set.
    pub fn satisfies(&self, required: &[String]) -> bool {
        required.iter().all(|l| self.labels.contains(l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_covers() {
        assert!(RunnerScope::Repo("acme/widgets".into()).covers("acme/widgets"));
        assert!(!RunnerScope::Repo("acme/widgets".into()).covers("acme/gears"));
        assert!(RunnerScope::Org("acme".into()).covers("acme/gears"));
        assert!(!RunnerScope::Org("acme".into()).covers("rival/gears"));
        assert!(RunnerScope::Global.covers("anything/at-all"));
    }

    #[test]
    fn test_scope_precedence_ordering() {
        assert!(RunnerScope::Repo("a/b".into()).precedence() < RunnerScope::Org("a".into()).precedence());
        assert!(RunnerScope::Org("a".into()).precedence() < RunnerScope::Global.precedence());
    }

    #[test]
    fn test_label_satisfaction() {
        let runner = Runner {
            id: RunnerId::new(),
            name: "r1".into(),
            scope: RunnerScope::Global,
            labels: vec!["linux".into(), "x64".into(), "docker".into()],
            kind: RunnerKind::SelfHosted,
            status: RunnerStatus::Online,
            metadata: RunnerMetadata::default(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };

        assert!(runner.satisfies(&["linux".into()]));
        assert!(runner.satisfies(&["linux".into(), "docker".into()]));
        assert!(!runner.satisfies(&["windows".into()]));
        assert!(runner.satisfies(&[]));
    }
}
