// Executor protocol
// The transport-neutral contract between the core and runners: claim,
// ordered step transitions, log appends, heartbeats, and cancellation.
// A transport layer wraps this service; ordering is enforced here.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::artifact::ArtifactStore;
use crate::config::{LeaseConfig, Retention};
use crate::error::ProtocolError;
use crate::expression::{self, EvalContext};
use crate::logs::LogPipeline;
use crate::model::{
    Job, JobConclusion, JobId, RunnerId, StepAction, StepConclusion, StepStatus,
};
use crate::queue::JobQueue;
use crate::scheduler::SchedulerEvent;
use crate::secrets::{SecretProvider, SecretQuery};
use crate::store::{StateStore, StoreError};

/// The work handed to a runner on a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: JobId,
    pub run_id: crate::model::RunId,
    pub display_name: String,
    pub attempt: u32,
    /// Merged workflow/job environment.
    pub env: HashMap<String, String>,
    /// Frozen event context for expression evaluation on the runner.
    pub event_context: Value,
    /// Matrix cell values for this job.
    pub matrix: HashMap<String, Value>,
    pub steps: Vec<StepPlan>,
    /// Opaque handle for scoped secret access during the job.
    pub secrets_handle: String,
}

/// One step of the plan, in execution order.
#[derive(Debug, Clone)]
pub struct StepPlan {
    pub ordinal: u32,
    pub name: String,
    pub action: StepAction,
    pub env: HashMap<String, String>,
    pub if_expr: Option<String>,
    pub continue_on_error: bool,
    pub timeout_minutes: Option<u32>,
}

/// Reported completion of a step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub outputs: HashMap<String, String>,
    /// Runner-side measurements (durations, sizes); recorded, not interpreted.
    pub metrics: HashMap<String, f64>,
}

/// Heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub lease_extended_until: DateTime<Utc>,
    pub cancel_requested: bool,
}

/// The executor service the transport wraps.
pub struct ExecutorService {
    store: Arc<StateStore>,
    queue: Arc<JobQueue>,
    logs: Arc<LogPipeline>,
    artifacts: Arc<ArtifactStore>,
    secrets: Arc<dyn SecretProvider>,
    lease: LeaseConfig,
    retention: Retention,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    handles: DashMap<JobId, String>,
}

impl ExecutorService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        queue: Arc<JobQueue>,
        logs: Arc<LogPipeline>,
        artifacts: Arc<ArtifactStore>,
        secrets: Arc<dyn SecretProvider>,
        lease: LeaseConfig,
        retention: Retention,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            store,
            queue,
            logs,
            artifacts,
            secrets,
            lease,
            retention,
            events,
            handles: DashMap::new(),
        }
    }

    /// Claim work for a runner. Idempotent: a runner already holding a live
    /// claim gets that claim back instead of a second job.
    pub fn claim(&self, runner_id: RunnerId) -> Result<Option<ClaimedJob>, ProtocolError> {
        let runner = self
            .store
            .runner(runner_id)
            .ok_or_else(|| ProtocolError::UnknownRunner(runner_id.to_string()))?;

        // Existing live claim wins.
        if let Some(job_id) = self.store.jobs_leased_to(runner_id).into_iter().next() {
            let job = self.store.job(job_id).ok_or(ProtocolError::UnknownJob { job: job_id })?;
            return Ok(Some(self.claimed_job(&job)));
        }

        let now = Utc::now();
        let Some(job_id) = self.queue.claim(runner_id, &runner.labels, &self.store, now) else {
            return Ok(None);
        };
        let job = self
            .store
            .job(job_id)
            .ok_or(ProtocolError::UnknownJob { job: job_id })?;
        info!(job = %job_id, runner = %runner_id, attempt = job.attempt, "job claimed");
        Ok(Some(self.claimed_job(&job)))
    }

    fn claimed_job(&self, job: &Job) -> ClaimedJob {
        let handle = self
            .handles
            .entry(job.id)
            .or_insert_with(|| {
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect()
            })
            .clone();

        let event_context = self
            .store
            .run(job.run_id)
            .map(|r| r.event.context())
            .unwrap_or(Value::Null);

        ClaimedJob {
            job_id: job.id,
            run_id: job.run_id,
            display_name: job.display_name.clone(),
            attempt: job.attempt,
            env: job.env.clone(),
            event_context,
            matrix: job
                .matrix
                .as_ref()
                .map(|m| m.values.clone())
                .unwrap_or_default(),
            steps: job
                .steps
                .iter()
                .map(|s| StepPlan {
                    ordinal: s.ordinal,
                    name: s.name.clone(),
                    action: s.action.clone(),
                    env: s.env.clone(),
                    if_expr: s.if_expr.clone(),
                    continue_on_error: s.continue_on_error,
                    timeout_minutes: s.timeout_minutes,
                })
                .collect(),
            secrets_handle: handle,
        }
    }

    /// Step transitions must arrive in ordinal order; anything else is a
    /// protocol error back to the runner.
    pub fn step_started(
        &self,
        runner_id: RunnerId,
        job_id: JobId,
        ordinal: u32,
    ) -> Result<(), ProtocolError> {
        let job = self.leased_job(runner_id, job_id)?;

        let expected = job.next_ordinal();
        if ordinal != expected {
            return Err(ProtocolError::OutOfOrder {
                job: job_id,
                got: ordinal,
                expected,
            });
        }

        let now = Utc::now();
        if job.status == crate::model::JobStatus::Claimed {
            self.store
                .mark_job_running(job_id, now)
                .map_err(|e| store_to_protocol(e, job_id))?;
        }
        self.store
            .mark_step_started(job_id, ordinal, now)
            .map_err(|e| store_to_protocol(e, job_id))?;
        debug!(job = %job_id, ordinal, "step started");
        Ok(())
    }

    /// Append an ordered log chunk for a running step.
    pub fn log_append(
        &self,
        runner_id: RunnerId,
        job_id: JobId,
        ordinal: u32,
        seq: u64,
        chunk: Bytes,
    ) -> Result<(), ProtocolError> {
        self.leased_job(runner_id, job_id)?;
        self.logs.append(job_id, ordinal, seq, chunk)
    }

    /// Finish a step: record its conclusion and outputs, seal the stream,
    /// and archive the rendered log.
    pub async fn step_finished(
        &self,
        runner_id: RunnerId,
        job_id: JobId,
        ordinal: u32,
        conclusion: StepConclusion,
        outcome: StepOutcome,
    ) -> Result<(), ProtocolError> {
        let job = self.leased_job(runner_id, job_id)?;
        let step = job
            .steps
            .get(ordinal as usize)
            .ok_or(ProtocolError::OutOfOrder {
                job: job_id,
                got: ordinal,
                expected: job.next_ordinal(),
            })?;
        if step.status != StepStatus::Running {
            return Err(ProtocolError::OutOfOrder {
                job: job_id,
                got: ordinal,
                expected: job.next_ordinal(),
            });
        }

        self.store
            .complete_step(job_id, ordinal, conclusion, outcome.outputs, Utc::now())
            .map_err(|e| store_to_protocol(e, job_id))?;

        // Seal and archive under the reserved logical name; durable logs
        // follow the log retention window.
        let rendered = self.logs.seal(job_id, ordinal);
        let name = format!("logs/{job_id}/step-{ordinal}");
        if let Err(err) = self
            .artifacts
            .upload_with_retention(job.run_id, &name, rendered, self.retention.log_days)
            .await
        {
            tracing::warn!(job = %job_id, ordinal, error = %err, "log archival failed");
        }
        debug!(job = %job_id, ordinal, conclusion = conclusion.as_str(), "step finished");
        Ok(())
    }

    /// Terminal job report from the runner.
    pub async fn job_finished(
        &self,
        runner_id: RunnerId,
        job_id: JobId,
        conclusion: JobConclusion,
    ) -> Result<(), ProtocolError> {
        let job = self.leased_job(runner_id, job_id)?;

        // Resolve declared job outputs against the finished steps.
        let outputs = resolve_job_outputs(&job);
        let _ = self.store.set_job_outputs(job_id, outputs);

        let failure = match conclusion {
            JobConclusion::Failed => Some(crate::model::FailureReason::StepFailed(
                job.steps
                    .iter()
                    .find(|s| s.conclusion == Some(StepConclusion::Failed))
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| "step failed".to_string()),
            )),
            _ => None,
        };

        self.store
            .complete_job(job_id, conclusion, failure, Utc::now())
            .map_err(|e| store_to_protocol(e, job_id))?;
        self.handles.remove(&job_id);
        self.logs.forget_job(job_id);
        info!(job = %job_id, conclusion = conclusion.as_str(), "job finished");
        let _ = self.events.send(SchedulerEvent::JobTerminal(job_id));
        Ok(())
    }

    /// Per-job heartbeat: extends the lease, reports cancellation.
    pub fn heartbeat(
        &self,
        runner_id: RunnerId,
        job_id: JobId,
    ) -> Result<HeartbeatAck, ProtocolError> {
        let job = self.leased_job(runner_id, job_id)?;
        let until = Utc::now()
            + Duration::from_std(self.lease.ttl()).unwrap_or_else(|_| Duration::seconds(60));
        self.store
            .renew_lease(job_id, until)
            .map_err(|e| store_to_protocol(e, job_id))?;
        Ok(HeartbeatAck {
            lease_extended_until: until,
            cancel_requested: job.cancel_requested,
        })
    }

    /// Core-initiated cooperative cancellation.
    pub fn cancel(&self, job_id: JobId) {
        let _ = self.store.request_cancel(job_id);
        let _ = self.events.send(SchedulerEvent::CancelJob(job_id));
    }

    /// Scoped secret access through the claim's handle. Values are
    /// registered with the log masker before they are returned.
    pub fn secret(
        &self,
        job_id: JobId,
        handle: &str,
        name: &str,
    ) -> Result<Option<String>, ProtocolError> {
        let valid = self
            .handles
            .get(&job_id)
            .map(|h| h.as_str() == handle)
            .unwrap_or(false);
        if !valid {
            return Err(ProtocolError::BadSecretsHandle { job: job_id });
        }

        let job = self
            .store
            .job(job_id)
            .ok_or(ProtocolError::UnknownJob { job: job_id })?;
        let run = self
            .store
            .run(job.run_id)
            .ok_or(ProtocolError::UnknownJob { job: job_id })?;

        let query = SecretQuery {
            repo: run.repo.clone(),
            environment: job.environment.clone(),
        };
        let value = self.secrets.secret(&query, name);
        if let Some(value) = &value {
            self.logs.register_secret(job_id, value.clone());
        }
        Ok(value)
    }

    /// Live log subscription passthrough for the (out of scope) UI surface.
    pub fn subscribe_logs(&self, job_id: JobId, ordinal: u32) -> crate::logs::Subscription {
        self.logs.subscribe(job_id, ordinal)
    }

    fn leased_job(&self, runner_id: RunnerId, job_id: JobId) -> Result<Job, ProtocolError> {
        let job = self
            .store
            .job(job_id)
            .ok_or(ProtocolError::UnknownJob { job: job_id })?;
        if job.is_terminal() {
            return Err(ProtocolError::AlreadyTerminal { job: job_id });
        }
        if job.runner != Some(runner_id) {
            return Err(ProtocolError::NotLeased {
                job: job_id,
                runner: runner_id.to_string(),
            });
        }
        Ok(job)
    }
}

fn store_to_protocol(err: StoreError, job: JobId) -> ProtocolError {
    match err {
        StoreError::TerminalJob { .. } | StoreError::TerminalRun { .. } => {
            ProtocolError::AlreadyTerminal { job }
        }
        StoreError::StepNotFound { ordinal, .. } => ProtocolError::OutOfOrder {
            job,
            got: ordinal,
            expected: 0,
        },
        _ => ProtocolError::UnknownJob { job },
    }
}

/// Evaluate `jobs.<id>.outputs` expressions against the steps context.
fn resolve_job_outputs(job: &Job) -> HashMap<String, String> {
    if job.output_exprs.is_empty() {
        return HashMap::new();
    }

    let mut steps_obj = serde_json::Map::new();
    for step in &job.steps {
        let Some(key) = &step.step_key else { continue };
        let outputs: serde_json::Map<String, Value> = step
            .outputs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        steps_obj.insert(
            key.clone(),
            serde_json::json!({
                "conclusion": step.conclusion.map(|c| c.as_str()),
                "outputs": outputs,
            }),
        );
    }

    let ctx = EvalContext::new()
        .with_env(job.env.clone())
        .with_matrix(
            job.matrix
                .as_ref()
                .map(|m| m.values.clone())
                .unwrap_or_default(),
        )
        .with_steps(Value::Object(steps_obj));

    job.output_exprs
        .iter()
        .filter_map(|(name, expr)| {
            expression::interpolate(expr, &ctx)
                .ok()
                .map(|v| (name.clone(), v))
        })
        .collect()
}
