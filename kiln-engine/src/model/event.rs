// Trigger event records
// Webhook ingestion is out of scope; events arrive as these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Event kinds the trigger matcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Release,
    Schedule,
    WorkflowDispatch,
}

impl EventKind {
    /// The `on:` key this event matches.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Release => "release",
            EventKind::Schedule => "schedule",
            EventKind::WorkflowDispatch => "workflow_dispatch",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "push" => Some(EventKind::Push),
            "pull_request" => Some(EventKind::PullRequest),
            "release" => Some(EventKind::Release),
            "schedule" => Some(EventKind::Schedule),
            "workflow_dispatch" => Some(EventKind::WorkflowDispatch),
            _ => None,
        }
    }
}

/// A trigger event as produced by the (external) ingestion layer.
///
/// The record is frozen into the run snapshot at match time and becomes the
/// `event` / `github` expression context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// Repository the event belongs to.
    pub repo: String,
    /// Fully qualified ref, e.g. `refs/heads/main` or `refs/tags/v1.2.0`.
    pub git_ref: String,
    /// Head commit sha.
    pub sha: String,
    /// User that caused the event.
    pub actor: String,
    /// Paths touched by the event, used by `paths` filters.
    #[serde(default)]
    pub changed_paths: Vec<String>,
    /// Workflow a manual dispatch targets (by registered name).
    #[serde(default)]
    pub workflow: Option<String>,
    /// Inputs supplied with a manual dispatch.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Raw provider payload, exposed verbatim to expressions.
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Branch name when the ref is a branch.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Tag name when the ref is a tag.
    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    /// The event context object exposed to expressions under `event`/`github`.
    pub fn context(&self) -> Value {
        serde_json::json!({
            "event_name": self.kind.as_str(),
            "repository": self.repo,
            "ref": self.git_ref,
            "sha": self.sha,
            "actor": self.actor,
            "event": self.payload,
            "inputs": self.inputs,
        })
    }
}
