// Run / Job / Step domain entities
// State machines and ownership: a Run owns Jobs, a Job owns Steps.
// Terminal statuses are write-once; the store enforces that on every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::model::ids::{JobId, RunId, RunnerId, StepId};
use crate::model::TriggerEvent;
use crate::workflow::models::Workflow;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Run conclusion, set once the run is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
    TimedOut,
}

impl RunConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunConclusion::Success => "success",
            RunConclusion::Failure => "failure",
            RunConclusion::Cancelled => "cancelled",
            RunConclusion::Skipped => "skipped",
            RunConclusion::TimedOut => "timed_out",
        }
    }
}

/// Job lifecycle status.
///
/// pending -> queued -> claimed -> running -> completed
/// with the conclusion carrying the terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Claimed,
    Running,
    Completed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobConclusion {
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl JobConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobConclusion::Succeeded => "succeeded",
            JobConclusion::Failed => "failed",
            JobConclusion::Cancelled => "cancelled",
            JobConclusion::Skipped => "skipped",
        }
    }

    /// The value exposed to expressions via `needs.<job>.result`.
    pub fn result_str(&self) -> &'static str {
        match self {
            JobConclusion::Succeeded => "success",
            JobConclusion::Failed => "failure",
            JobConclusion::Cancelled => "cancelled",
            JobConclusion::Skipped => "skipped",
        }
    }
}

/// Structured reason attached to a failed or skipped job, preserved for the
/// lifetime of retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// A step reported a failing conclusion.
    StepFailed(String),
    /// Job deadline exceeded while claimed or running.
    TimedOut(String),
    /// Lease expired without heartbeat past the attempt ceiling.
    RunnerLost(String),
    /// No runner could satisfy the required labels within the dispatch wait.
    NoMatchingRunner(String),
    /// Planning or scheduling invariant violation.
    SetupFailed(String),
    /// Condition evaluation produced a runtime type error.
    EvalFailed(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::StepFailed(_) => "step_failed",
            FailureReason::TimedOut(_) => "timed_out",
            FailureReason::RunnerLost(_) => "runner_lost",
            FailureReason::NoMatchingRunner(_) => "no_matching_runner",
            FailureReason::SetupFailed(_) => "setup_failed",
            FailureReason::EvalFailed(_) => "eval_failed",
        }
    }
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
}

/// Terminal outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepConclusion {
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl StepConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepConclusion::Succeeded => "succeeded",
            StepConclusion::Failed => "failed",
            StepConclusion::Cancelled => "cancelled",
            StepConclusion::Skipped => "skipped",
        }
    }
}

/// One invocation of a workflow.
///
/// The workflow spec is snapshotted at creation; edits to the source never
/// retroactively mutate an active run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Repository this run belongs to.
    pub repo: String,
    /// Monotonic per-repo sequence number (gaps allowed).
    pub number: u64,
    /// Workflow name at snapshot time.
    pub workflow_name: String,
    /// Frozen copy of the parsed workflow.
    pub snapshot: Workflow,
    /// The trigger event that created this run.
    pub event: TriggerEvent,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    /// Structured reason when the run failed before jobs existed.
    pub failure: Option<FailureReason>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Job ids owned by this run, in declaration-then-matrix order.
    pub jobs: Vec<JobId>,
}

/// Matrix sibling metadata carried on expanded jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixCell {
    /// Position within the expanded sibling set.
    pub index: usize,
    /// Total number of siblings.
    pub total: usize,
    /// Axis values for this cell.
    pub values: HashMap<String, Value>,
}

/// Concurrency group configuration resolved for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySetting {
    pub group: String,
    pub cancel_in_progress: bool,
}

/// A unit of work in a run; the unit of runner assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    /// Logical name from the workflow (`jobs.<name>`).
    pub name: String,
    /// Display name including the matrix cell rendering, e.g. `test (ubuntu, 1.75)`.
    pub display_name: String,
    /// Matrix cell, present when this job came from a strategy expansion.
    pub matrix: Option<MatrixCell>,
    /// Labels a runner must carry to claim this job.
    pub labels: Vec<String>,
    pub needs: Vec<String>,
    pub if_expr: Option<String>,
    pub env: HashMap<String, String>,
    pub concurrency: Option<ConcurrencySetting>,
    pub environment: Option<String>,
    /// Expressions mapping job outputs from step outputs.
    pub output_exprs: HashMap<String, String>,
    pub timeout_minutes: u32,
    /// fail-fast from the strategy block; meaningful only for matrix jobs.
    pub fail_fast: bool,
    /// max-parallel from the strategy block.
    pub max_parallel: Option<u32>,

    pub status: JobStatus,
    pub conclusion: Option<JobConclusion>,
    pub failure: Option<FailureReason>,
    /// Cooperative cancellation flag, surfaced to the runner on heartbeat.
    pub cancel_requested: bool,
    /// Runner currently holding the claim lease (weak reference, id only).
    pub runner: Option<RunnerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Claim attempts made so far, incremented on lease-loss requeue.
    pub attempt: u32,
    /// Deadline recorded at enqueue time.
    pub deadline: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved job outputs, published when the job completes.
    pub outputs: HashMap<String, String>,
    pub steps: Vec<Step>,
}

impl Job {
    /// True when every step is terminal or the job itself concluded.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Ordinal of the next step expected to start.
    pub fn next_ordinal(&self) -> u32 {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Pending)
            .count() as u32
    }
}

/// What a step executes: an action reference or an inline script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// `uses: owner/name@ref` or `uses: ./local`.
    Uses {
        reference: String,
        with: HashMap<String, Value>,
    },
    /// `run:` script with its shell and working directory.
    Run {
        script: String,
        shell: Option<String>,
        working_directory: Option<String>,
    },
}

/// An ordered unit within a job; the unit of log streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    /// Contiguous position within the job, starting at zero.
    pub ordinal: u32,
    pub name: String,
    /// `id:` from the workflow, used for `steps.<id>.outputs` lookups.
    pub step_key: Option<String>,
    pub action: StepAction,
    pub env: HashMap<String, String>,
    pub if_expr: Option<String>,
    pub continue_on_error: bool,
    pub timeout_minutes: Option<u32>,
    pub status: StepStatus,
    pub conclusion: Option<StepConclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_conclusion_result_strings() {
        assert_eq!(JobConclusion::Succeeded.result_str(), "success");
        assert_eq!(JobConclusion::Failed.result_str(), "failure");
        assert_eq!(JobConclusion::Skipped.result_str(), "skipped");
    }

    #[test]
    fn test_failure_reason_serde_tagging() {
        let reason = FailureReason::RunnerLost("lease expired".to_string());
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "runner_lost");
        assert_eq!(json["detail"], "lease expired");
    }
}
