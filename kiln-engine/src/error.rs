// Engine error taxonomy
// Every public operation surfaces one of these kinds; see module docs for recovery rules.

use thiserror::Error;

use crate::model::{JobId, RunId};
use crate::workflow::parser::ParseError;

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Top-level error surface for Parse, Plan, Schedule, Dispatch, and Execute stages.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed YAML or spec violation. The workflow update or run is rejected.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Cycle, matrix explosion past limits, unknown dependency. The run fails
    /// before any job is created.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Internal invariant violation during scheduling. Fatal to the run.
    #[error("schedule error for run {run}: {message}")]
    Schedule { run: RunId, message: String },

    /// No runner capable of satisfying the required labels within the wait.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Executor protocol violation (out-of-order transitions, unknown claims).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Artifact or log size cap exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Backend read/write failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration load or validation failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Planning failures; the run concludes failed before any job starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("job '{job}' depends on unknown job '{needs}'")]
    UnknownDependency { job: String, needs: String },

    #[error("circular dependency: {cycle}")]
    CyclicDependency { cycle: String },

    #[error("matrix for job '{job}' expands to {cells} cells, limit is {limit}")]
    MatrixExplosion { job: String, cells: usize, limit: usize },

    #[error("run would contain {jobs} jobs, limit is {limit}")]
    TooManyJobs { jobs: usize, limit: usize },
}

/// Queue and dispatch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {job} has no queue entry")]
    NotQueued { job: JobId },

    #[error("no runner satisfies labels {labels:?} for job {job}")]
    NoMatchingRunner { job: JobId, labels: Vec<String> },

    #[error("job {job} exhausted {attempts} claim attempts")]
    AttemptsExhausted { job: JobId, attempts: u32 },
}

/// Executor protocol violations reported back to the runner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown job {job}")]
    UnknownJob { job: JobId },

    #[error("unknown runner {0}")]
    UnknownRunner(String),

    #[error("job {job} is not leased to runner {runner}")]
    NotLeased { job: JobId, runner: String },

    #[error("step transition out of order for job {job}: got ordinal {got}, expected {expected}")]
    OutOfOrder { job: JobId, got: u32, expected: u32 },

    #[error("job {job} is already terminal")]
    AlreadyTerminal { job: JobId },

    #[error("secrets handle rejected for job {job}")]
    BadSecretsHandle { job: JobId },

    #[error("log stream for job {job} step {ordinal} is sealed")]
    StreamSealed { job: JobId, ordinal: u32 },
}

/// Storage backend failures, classified for retry policy.
///
/// Transient errors are retried locally with bounded backoff and never become
/// visible in state changes when the retry succeeds. Permanent errors surface
/// and fail the operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("permanent storage error: {0}")]
    Permanent(String),

    #[error("object not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                StorageError::Transient(err.to_string())
            }
            _ => StorageError::Permanent(err.to_string()),
        }
    }
}
