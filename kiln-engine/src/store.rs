// Shared state store
// The transactional heart: runs, jobs, and runners behind keyed locks, with
// transition methods that enforce the write-once terminal invariant. All
// writes from every worker go through here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{
    FailureReason, Job, JobConclusion, JobId, JobStatus, Run, RunConclusion, RunId, RunStatus,
    Runner, RunnerId, RunnerStatus, StepConclusion, StepStatus,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("runner {0} not found")]
    RunnerNotFound(RunnerId),

    #[error("job {job} is terminal; refusing transition to {to}")]
    TerminalJob { job: JobId, to: &'static str },

    #[error("run {run} is terminal; refusing transition")]
    TerminalRun { run: RunId },

    #[error("invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("step {ordinal} of job {job} not found")]
    StepNotFound { job: JobId, ordinal: u32 },
}

/// In-memory transactional store.
///
/// Each entry is guarded by its shard lock; multi-row operations (claiming,
/// run-number allocation) take the dedicated mutexes below.
#[derive(Debug, Default)]
pub struct StateStore {
    runs: DashMap<RunId, Run>,
    jobs: DashMap<JobId, Job>,
    runners: DashMap<RunnerId, Runner>,
    run_numbers: Mutex<HashMap<String, u64>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- runs ----------------------------------------------------------

    /// Allocate the next run number for a repo. Monotonic; gaps are fine.
    pub fn next_run_number(&self, repo: &str) -> u64 {
        let mut numbers = self.run_numbers.lock();
        let counter = numbers.entry(repo.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn insert_run(&self, run: Run) {
        self.runs.insert(run.id, run);
    }

    pub fn run(&self, id: RunId) -> Option<Run> {
        self.runs.get(&id).map(|r| r.clone())
    }

    pub fn runs_for_repo(&self, repo: &str) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.repo == repo)
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.number);
        runs
    }

    /// Runs currently in progress, for scheduler walks.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect()
    }

    pub fn mark_run_started(&self, id: RunId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if run.status.is_terminal() {
            return Err(StoreError::TerminalRun { run: id });
        }
        if run.status == RunStatus::Queued {
            run.status = RunStatus::InProgress;
            run.started_at.get_or_insert(at);
        }
        Ok(())
    }

    /// Terminal run transition; write-once.
    pub fn complete_run(
        &self,
        id: RunId,
        status: RunStatus,
        conclusion: RunConclusion,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if run.status.is_terminal() {
            return Err(StoreError::TerminalRun { run: id });
        }
        run.status = status;
        run.conclusion = Some(conclusion);
        run.completed_at = Some(at);
        Ok(())
    }

    pub fn set_run_failure(&self, id: RunId, reason: FailureReason) -> Result<(), StoreError> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        run.failure = Some(reason);
        Ok(())
    }

    // ---- jobs ----------------------------------------------------------

    pub fn insert_job(&self, job: Job) {
        let run_id = job.run_id;
        let job_id = job.id;
        self.jobs.insert(job_id, job);
        if let Some(mut run) = self.runs.get_mut(&run_id) {
            if !run.jobs.contains(&job_id) {
                run.jobs.push(job_id);
            }
        }
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn jobs_of_run(&self, run_id: RunId) -> Vec<Job> {
        let Some(run) = self.run(run_id) else {
            return Vec::new();
        };
        run.jobs.iter().filter_map(|id| self.job(*id)).collect()
    }

    /// Matrix siblings: same run, same logical name, different id.
    pub fn siblings_of(&self, job: &Job) -> Vec<Job> {
        self.jobs_of_run(job.run_id)
            .into_iter()
            .filter(|j| j.name == job.name && j.id != job.id)
            .collect()
    }

    /// Move a pending job into the queue-visible state.
    pub fn mark_job_queued(&self, id: JobId, deadline: DateTime<Utc>) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Queued;
                job.deadline = Some(deadline);
                Ok(())
            }
            // Jobs born queued (no needs) pick up their deadline at the
            // first physical enqueue.
            JobStatus::Queued => {
                job.deadline.get_or_insert(deadline);
                Ok(())
            }
            _ => Err(StoreError::InvalidTransition {
                job: id,
                from: job.status.as_str(),
                to: "queued",
            }),
        }
    }

    /// Claim transition: queued -> claimed, with the lease recorded.
    ///
    /// Called by the queue with its partition lock held, which is what makes
    /// the claim at-most-once.
    pub fn claim_job(
        &self,
        id: JobId,
        runner: RunnerId,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.status != JobStatus::Queued {
            return Err(StoreError::InvalidTransition {
                job: id,
                from: job.status.as_str(),
                to: "claimed",
            });
        }
        job.status = JobStatus::Claimed;
        job.runner = Some(runner);
        job.lease_expires_at = Some(lease_expires_at);
        job.attempt += 1;
        Ok(())
    }

    pub fn mark_job_running(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        match job.status {
            JobStatus::Claimed => {
                job.status = JobStatus::Running;
                job.started_at = Some(at);
                Ok(())
            }
            JobStatus::Running => Ok(()),
            _ => Err(StoreError::InvalidTransition {
                job: id,
                from: job.status.as_str(),
                to: "running",
            }),
        }
    }

    pub fn renew_lease(&self, id: JobId, until: DateTime<Utc>) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.is_terminal() {
            return Err(StoreError::TerminalJob {
                job: id,
                to: "lease renewal",
            });
        }
        job.lease_expires_at = Some(until);
        Ok(())
    }

    /// Requeue after a lost lease: claimed/running -> queued, lease cleared.
    pub fn requeue_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        match job.status {
            JobStatus::Claimed | JobStatus::Running => {
                job.status = JobStatus::Queued;
                job.runner = None;
                job.lease_expires_at = None;
                Ok(())
            }
            _ => Err(StoreError::InvalidTransition {
                job: id,
                from: job.status.as_str(),
                to: "queued",
            }),
        }
    }

    /// Terminal job transition; write-once.
    pub fn complete_job(
        &self,
        id: JobId,
        conclusion: JobConclusion,
        failure: Option<FailureReason>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.is_terminal() {
            return Err(StoreError::TerminalJob {
                job: id,
                to: conclusion.as_str(),
            });
        }
        job.status = JobStatus::Completed;
        job.conclusion = Some(conclusion);
        job.failure = failure;
        job.completed_at = Some(at);
        job.runner = None;
        job.lease_expires_at = None;
        // Unstarted steps resolve to skipped (or cancelled alongside the job).
        let step_conclusion = match conclusion {
            JobConclusion::Cancelled => StepConclusion::Cancelled,
            _ => StepConclusion::Skipped,
        };
        for step in &mut job.steps {
            if step.status != StepStatus::Completed {
                step.status = StepStatus::Completed;
                step.conclusion.get_or_insert(step_conclusion);
                step.completed_at.get_or_insert(at);
            }
        }
        Ok(())
    }

    pub fn set_job_outputs(&self, id: JobId, outputs: HashMap<String, String>) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.outputs = outputs;
        Ok(())
    }

    /// Flag a job for cooperative cancellation; the runner sees it on its
    /// next heartbeat.
    pub fn request_cancel(&self, id: JobId) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.is_terminal() {
            job.cancel_requested = true;
        }
        Ok(())
    }

    // ---- steps ---------------------------------------------------------

    pub fn mark_step_started(
        &self,
        job_id: JobId,
        ordinal: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        let step = job
            .steps
            .get_mut(ordinal as usize)
            .ok_or(StoreError::StepNotFound {
                job: job_id,
                ordinal,
            })?;
        step.status = StepStatus::Running;
        step.started_at = Some(at);
        Ok(())
    }

    pub fn complete_step(
        &self,
        job_id: JobId,
        ordinal: u32,
        conclusion: StepConclusion,
        outputs: HashMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        let step = job
            .steps
            .get_mut(ordinal as usize)
            .ok_or(StoreError::StepNotFound {
                job: job_id,
                ordinal,
            })?;
        if step.status == StepStatus::Completed {
            return Err(StoreError::TerminalJob {
                job: job_id,
                to: "step completion",
            });
        }
        step.status = StepStatus::Completed;
        step.conclusion = Some(conclusion);
        step.outputs = outputs;
        step.completed_at = Some(at);
        Ok(())
    }

    // ---- runners -------------------------------------------------------

    pub fn insert_runner(&self, runner: Runner) {
        self.runners.insert(runner.id, runner);
    }

    pub fn runner(&self, id: RunnerId) -> Option<Runner> {
        self.runners.get(&id).map(|r| r.clone())
    }

    pub fn remove_runner(&self, id: RunnerId) -> Option<Runner> {
        self.runners.remove(&id).map(|(_, r)| r)
    }

    pub fn all_runners(&self) -> Vec<Runner> {
        self.runners.iter().map(|r| r.clone()).collect()
    }

    pub fn set_runner_status(&self, id: RunnerId, status: RunnerStatus) -> Result<(), StoreError> {
        let mut runner = self
            .runners
            .get_mut(&id)
            .ok_or(StoreError::RunnerNotFound(id))?;
        runner.status = status;
        Ok(())
    }

    pub fn record_heartbeat(
        &self,
        id: RunnerId,
        status: RunnerStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runner = self
            .runners
            .get_mut(&id)
            .ok_or(StoreError::RunnerNotFound(id))?;
        runner.status = status;
        runner.last_heartbeat = at;
        Ok(())
    }

    /// Jobs holding a lease from the given runner.
    pub fn jobs_leased_to(&self, runner: RunnerId) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.runner == Some(runner) && !j.is_terminal())
            .map(|j| j.id)
            .collect()
    }

    /// Non-terminal jobs whose lease expired before `now`.
    pub fn jobs_with_expired_leases(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| {
                matches!(j.status, JobStatus::Claimed | JobStatus::Running)
                    && j.lease_expires_at.is_some_and(|exp| exp < now)
            })
            .map(|j| j.id)
            .collect()
    }

    /// Non-terminal jobs whose deadline passed while claimed or running.
    pub fn jobs_past_deadline(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| {
                matches!(j.status, JobStatus::Claimed | JobStatus::Running)
                    && j.deadline.is_some_and(|d| d < now)
            })
            .map(|j| j.id)
            .collect()
    }
}
