// Scheduler
// Event-driven DAG walker: promotes jobs whose needs concluded satisfactorily
// and whose `if` holds, applies concurrency groups, fail-fast, max-parallel,
// and deadlines. Runs as a single worker; all state changes go through the
// store's transition methods.

pub mod concurrency;

use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::expression::{self, EvalContext, StatusFlags};
use crate::model::{
    FailureReason, Job, JobConclusion, JobId, JobStatus, Run, RunConclusion, RunId, RunStatus,
};
use crate::queue::{JobQueue, QueueEntry};
use crate::store::StateStore;

pub use concurrency::{Admission, ConcurrencyGroups};

/// Wake reasons for the scheduler worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    RunCreated(RunId),
    JobTerminal(JobId),
    RunnerChanged,
    GroupReleased(String),
    Tick,
    CancelRun(RunId),
    CancelJob(JobId),
}

/// Side effects the (async) engine loop performs after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Tear down any ephemeral environment for this terminal job.
    Reclaim(JobId),
    /// Newly queued jobs may need ephemeral capacity.
    ProvisionCheck,
}

pub struct Scheduler {
    store: Arc<StateStore>,
    queue: Arc<JobQueue>,
    groups: ConcurrencyGroups,
    queue_config: QueueConfig,
}

impl Scheduler {
    pub fn new(store: Arc<StateStore>, queue: Arc<JobQueue>, queue_config: QueueConfig) -> Self {
        Self {
            store,
            queue,
            groups: ConcurrencyGroups::new(),
            queue_config,
        }
    }

    /// Process one wake event. Synchronous and single-threaded by design;
    /// the returned effects are executed by the engine loop.
    pub fn handle(&self, event: SchedulerEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            SchedulerEvent::RunCreated(run_id) => {
                let _ = self.store.mark_run_started(run_id, Utc::now());
                self.pass_run(run_id, &mut effects);
            }
            SchedulerEvent::JobTerminal(job_id) => {
                self.on_job_terminal(job_id, &mut effects);
            }
            SchedulerEvent::RunnerChanged | SchedulerEvent::Tick => {
                self.check_deadlines(&mut effects);
                self.check_dispatch_waits(&mut effects);
                for run_id in self.store.active_runs() {
                    self.pass_run(run_id, &mut effects);
                }
            }
            SchedulerEvent::GroupReleased(_) => {
                for run_id in self.store.active_runs() {
                    self.pass_run(run_id, &mut effects);
                }
            }
            SchedulerEvent::CancelRun(run_id) => {
                self.cancel_run(run_id, &mut effects);
            }
            SchedulerEvent::CancelJob(job_id) => {
                if self.cancel_job(job_id, &mut effects) {
                    self.on_job_terminal(job_id, &mut effects);
                }
            }
        }
        effects
    }

    /// One scheduling pass over a run, iterated to fixpoint so that skip
    /// propagation settles within a single wake.
    pub fn pass_run(&self, run_id: RunId, effects: &mut Vec<Effect>) {
        let Some(run) = self.store.run(run_id) else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }

        loop {
            let mut changed = false;
            let jobs = self.store.jobs_of_run(run_id);

            for job in &jobs {
                if job.is_terminal() {
                    continue;
                }
                match job.status {
                    JobStatus::Claimed | JobStatus::Running => continue,
                    JobStatus::Queued if self.queue.contains(job.id) => continue,
                    _ => {}
                }

                if !self.needs_terminal(job, &jobs) {
                    continue;
                }

                match self.decide(job, &jobs, &run) {
                    Decision::Skip(reason) => {
                        debug!(job = %job.id, name = %job.name, "skipping job");
                        if self
                            .store
                            .complete_job(job.id, JobConclusion::Skipped, reason, Utc::now())
                            .is_ok()
                        {
                            self.release_group(job);
                            changed = true;
                        }
                    }
                    Decision::Hold => {}
                    Decision::Dispatch => {
                        if self.admit_and_enqueue(job, effects) {
                            changed = true;
                        }
                    }
                }
            }

            if !changed {
                break;
            }
        }

        self.finalize_run(run_id);
    }

    /// All `needs` terminal?
    fn needs_terminal(&self, job: &Job, jobs: &[Job]) -> bool {
        job.needs.iter().all(|needed| {
            jobs.iter()
                .filter(|j| &j.name == needed)
                .all(|j| j.is_terminal())
        })
    }

    fn decide(&self, job: &Job, jobs: &[Job], run: &Run) -> Decision {
        // Status flags over the direct needs.
        let mut all_success = true;
        let mut any_failure = false;
        let mut any_cancelled = false;
        for needed in &job.needs {
            for j in jobs.iter().filter(|j| &j.name == needed) {
                match j.conclusion {
                    Some(JobConclusion::Succeeded) => {}
                    Some(JobConclusion::Failed) => {
                        all_success = false;
                        any_failure = true;
                    }
                    Some(JobConclusion::Cancelled) => {
                        all_success = false;
                        any_cancelled = true;
                    }
                    Some(JobConclusion::Skipped) | None => {
                        all_success = false;
                    }
                }
            }
        }

        let should_run = match &job.if_expr {
            None => all_success,
            Some(expr) => {
                let ctx = self.eval_context(job, jobs, run, all_success, any_failure, any_cancelled);
                match expression::evaluate_bool(expr, &ctx) {
                    // An `if` with no status function keeps the implied
                    // success-of-needs gate; always()/failure()/cancelled()
                    // (or an explicit success()) take over completely.
                    Ok(value) => value && (mentions_status_fn(expr) || all_success),
                    Err(err) => {
                        // Runtime eval errors skip the job with a structured
                        // reason rather than crashing the run.
                        return Decision::Skip(Some(FailureReason::EvalFailed(err.to_string())));
                    }
                }
            }
        };

        if !should_run {
            return Decision::Skip(None);
        }

        // max-parallel: cap simultaneously dispatched matrix siblings.
        if let (Some(max), Some(_)) = (job.max_parallel, &job.matrix) {
            let dispatched = jobs
                .iter()
                .filter(|j| j.name == job.name && j.id != job.id)
                .filter(|j| {
                    matches!(j.status, JobStatus::Claimed | JobStatus::Running)
                        || (j.status == JobStatus::Queued && self.queue.contains(j.id))
                })
                .count();
            if dispatched as u32 >= max {
                return Decision::Hold;
            }
        }

        Decision::Dispatch
    }

    fn eval_context(
        &self,
        job: &Job,
        jobs: &[Job],
        run: &Run,
        all_success: bool,
        any_failure: bool,
        any_cancelled: bool,
    ) -> EvalContext {
        let mut needs_obj = serde_json::Map::new();
        for needed in &job.needs {
            // Matrix needs collapse onto one entry; a failed cell wins.
            let cells: Vec<&Job> = jobs.iter().filter(|j| &j.name == needed).collect();
            let result = if cells
                .iter()
                .any(|j| j.conclusion == Some(JobConclusion::Failed))
            {
                "failure"
            } else if cells
                .iter()
                .any(|j| j.conclusion == Some(JobConclusion::Cancelled))
            {
                "cancelled"
            } else if cells
                .iter()
                .all(|j| j.conclusion == Some(JobConclusion::Succeeded))
            {
                "success"
            } else {
                "skipped"
            };

            let mut outputs = serde_json::Map::new();
            for cell in &cells {
                for (k, v) in &cell.outputs {
                    outputs.insert(k.clone(), Value::String(v.clone()));
                }
            }

            needs_obj.insert(
                needed.clone(),
                serde_json::json!({ "result": result, "outputs": outputs }),
            );
        }

        EvalContext::new()
            .with_event(run.event.context())
            .with_env(job.env.clone())
            .with_matrix(
                job.matrix
                    .as_ref()
                    .map(|m| m.values.clone())
                    .unwrap_or_default(),
            )
            .with_needs(Value::Object(needs_obj))
            .with_status(StatusFlags {
                success: all_success,
                failure: any_failure,
                cancelled: any_cancelled,
            })
    }

    /// Concurrency admission, then the physical enqueue.
    fn admit_and_enqueue(&self, job: &Job, effects: &mut Vec<Effect>) -> bool {
        if let Some(concurrency) = &job.concurrency {
            match self
                .groups
                .admit(&concurrency.group, job.id, concurrency.cancel_in_progress)
            {
                Admission::Admitted => {}
                Admission::Blocked => return false,
                Admission::AdmittedCancelling(predecessor) => {
                    info!(
                        group = %concurrency.group,
                        cancelled = %predecessor,
                        admitted = %job.id,
                        "concurrency group cancelling in-progress job"
                    );
                    if self.cancel_job(predecessor, effects) {
                        self.on_job_terminal_no_release(predecessor, effects);
                    }
                }
            }
        }

        let now = Utc::now();
        let deadline = now + Duration::minutes(i64::from(job.timeout_minutes));
        if self.store.mark_job_queued(job.id, deadline).is_err() {
            return false;
        }
        self.queue.enqueue(QueueEntry {
            job_id: job.id,
            required_labels: job.labels.clone(),
            priority: 0,
            earliest_dispatch_time: now,
            enqueued_at: now,
        });
        debug!(job = %job.id, name = %job.name, "job enqueued");
        effects.push(Effect::ProvisionCheck);
        true
    }

    /// Terminal bookkeeping: group release, fail-fast, run finalization.
    fn on_job_terminal(&self, job_id: JobId, effects: &mut Vec<Effect>) {
        let Some(job) = self.store.job(job_id) else {
            return;
        };
        let released = self.release_group(&job);
        self.on_job_terminal_no_release(job_id, effects);
        if released {
            // A freed slot may unblock jobs in other runs of the group.
            for run_id in self.store.active_runs() {
                self.pass_run(run_id, effects);
            }
        }
    }

    fn on_job_terminal_no_release(&self, job_id: JobId, effects: &mut Vec<Effect>) {
        let Some(job) = self.store.job(job_id) else {
            return;
        };
        effects.push(Effect::Reclaim(job_id));

        // fail-fast: a failed matrix cell cancels queued/claimed siblings.
        if job.conclusion == Some(JobConclusion::Failed) && job.fail_fast && job.matrix.is_some() {
            for sibling in self.store.siblings_of(&job) {
                if matches!(sibling.status, JobStatus::Queued | JobStatus::Claimed) {
                    info!(job = %sibling.id, failed = %job.id, "fail-fast cancelling sibling");
                    self.cancel_job(sibling.id, effects);
                }
            }
        }

        self.pass_run(job.run_id, effects);
    }

    /// Cancel one job; true when it actually transitioned here.
    fn cancel_job(&self, job_id: JobId, effects: &mut Vec<Effect>) -> bool {
        let Some(job) = self.store.job(job_id) else {
            return false;
        };
        if job.is_terminal() {
            return false;
        }

        self.queue.remove(job_id);
        let _ = self.store.request_cancel(job_id);
        let transitioned = self
            .store
            .complete_job(job_id, JobConclusion::Cancelled, None, Utc::now())
            .is_ok();
        if transitioned {
            self.release_group(&job);
            effects.push(Effect::Reclaim(job_id));
        }
        transitioned
    }

    /// Run-level cancel: every non-terminal job goes cancelled, then the run.
    fn cancel_run(&self, run_id: RunId, effects: &mut Vec<Effect>) {
        for job in self.store.jobs_of_run(run_id) {
            self.cancel_job(job.id, effects);
        }
        let _ = self.store.complete_run(
            run_id,
            RunStatus::Cancelled,
            RunConclusion::Cancelled,
            Utc::now(),
        );
        info!(run = %run_id, "run cancelled");
        // Freed group slots may unblock other runs.
        for other in self.store.active_runs() {
            self.pass_run(other, effects);
        }
    }

    fn release_group(&self, job: &Job) -> bool {
        match &job.concurrency {
            Some(concurrency) => self.groups.release(&concurrency.group, job.id),
            None => false,
        }
    }

    /// Jobs past their deadline fail with `timed_out` and lose their lease.
    fn check_deadlines(&self, effects: &mut Vec<Effect>) {
        let now = Utc::now();
        for job_id in self.store.jobs_past_deadline(now) {
            warn!(job = %job_id, "job deadline exceeded");
            let _ = self.store.request_cancel(job_id);
            if self
                .store
                .complete_job(
                    job_id,
                    JobConclusion::Failed,
                    Some(FailureReason::TimedOut("job deadline exceeded".to_string())),
                    now,
                )
                .is_ok()
            {
                self.on_job_terminal(job_id, effects);
            }
        }
    }

    /// Jobs waiting past the dispatch window with no capable runner fail
    /// with `no_matching_runner`. A busy-but-capable fleet keeps the job
    /// queued; only a fleet that can never serve it gives up.
    fn check_dispatch_waits(&self, effects: &mut Vec<Effect>) {
        let now = Utc::now();
        for job_id in self
            .queue
            .waiting_longer_than(self.queue_config.dispatch_wait(), now)
        {
            let Some(job) = self.store.job(job_id) else {
                continue;
            };
            let repo = self.store.run(job.run_id).map(|r| r.repo);
            let capable = self.store.all_runners().into_iter().any(|r| {
                r.status != crate::model::RunnerStatus::Offline
                    && repo.as_deref().map(|repo| r.scope.covers(repo)).unwrap_or(false)
                    && r.satisfies(&job.labels)
            });
            if capable {
                continue;
            }
            warn!(job = %job_id, labels = ?job.labels, "no matching runner within dispatch wait");
            self.queue.remove(job_id);
            if self
                .store
                .complete_job(
                    job_id,
                    JobConclusion::Failed,
                    Some(FailureReason::NoMatchingRunner(format!(
                        "no runner satisfied labels {:?}",
                        job.labels
                    ))),
                    now,
                )
                .is_ok()
            {
                self.on_job_terminal(job_id, effects);
            }
        }
    }

    /// Conclude the run once every job is terminal.
    fn finalize_run(&self, run_id: RunId) {
        let Some(run) = self.store.run(run_id) else {
            return;
        };
        if run.status.is_terminal() || run.jobs.is_empty() {
            return;
        }
        let jobs = self.store.jobs_of_run(run_id);
        if !jobs.iter().all(Job::is_terminal) {
            return;
        }

        let conclusion = if jobs
            .iter()
            .any(|j| j.conclusion == Some(JobConclusion::Failed))
        {
            let timed_out = jobs
                .iter()
                .any(|j| matches!(j.failure, Some(FailureReason::TimedOut(_))));
            if timed_out {
                RunConclusion::TimedOut
            } else {
                RunConclusion::Failure
            }
        } else if jobs
            .iter()
            .any(|j| j.conclusion == Some(JobConclusion::Cancelled))
        {
            RunConclusion::Cancelled
        } else if jobs
            .iter()
            .all(|j| j.conclusion == Some(JobConclusion::Skipped))
        {
            RunConclusion::Skipped
        } else {
            RunConclusion::Success
        };

        let status = if conclusion == RunConclusion::Cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        if self
            .store
            .complete_run(run_id, status, conclusion, Utc::now())
            .is_ok()
        {
            info!(run = %run_id, conclusion = conclusion.as_str(), "run concluded");
        }
    }
}

enum Decision {
    Dispatch,
    Hold,
    Skip(Option<FailureReason>),
}

/// Whether an `if` expression invokes any of the status functions.
fn mentions_status_fn(expr: &str) -> bool {
    ["always(", "success(", "failure(", "cancelled("]
        .iter()
        .any(|f| expr.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::model::{EventKind, TriggerEvent};
    use crate::planner;
    use crate::workflow::WorkflowParser;
    use std::collections::HashMap;

    fn make_run(yaml: &str, git_ref: &str) -> Run {
        let workflow = WorkflowParser::parse(yaml).unwrap();
        Run {
            id: RunId::new(),
            repo: "acme/widgets".into(),
            number: 1,
            workflow_name: "ci".into(),
            snapshot: workflow,
            event: TriggerEvent {
                kind: EventKind::Push,
                repo: "acme/widgets".into(),
                git_ref: git_ref.into(),
                sha: "abc".into(),
                actor: "alice".into(),
                changed_paths: vec![],
                workflow: None,
                inputs: HashMap::new(),
                payload: Value::Null,
                occurred_at: Utc::now(),
            },
            status: RunStatus::Queued,
            conclusion: None,
            failure: None,
            actor: "alice".into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            jobs: vec![],
        }
    }

    struct Fixture {
        store: Arc<StateStore>,
        queue: Arc<JobQueue>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StateStore::new());
        let queue = Arc::new(JobQueue::new(std::time::Duration::from_secs(60)));
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&queue), QueueConfig::default());
        Fixture {
            store,
            queue,
            scheduler,
        }
    }

    fn create_run(fx: &Fixture, yaml: &str, git_ref: &str) -> RunId {
        let run = make_run(yaml, git_ref);
        let run_id = run.id;
        let jobs = planner::plan(&run, &Limits::default()).unwrap();
        fx.store.insert_run(run);
        for job in jobs {
            fx.store.insert_job(job);
        }
        fx.scheduler.handle(SchedulerEvent::RunCreated(run_id));
        run_id
    }

    fn job_by_name(fx: &Fixture, run_id: RunId, name: &str) -> Job {
        fx.store
            .jobs_of_run(run_id)
            .into_iter()
            .find(|j| j.name == name)
            .unwrap()
    }

    fn finish(fx: &Fixture, job_id: JobId, conclusion: JobConclusion) {
        fx.queue.remove(job_id);
        fx.store
            .complete_job(job_id, conclusion, None, Utc::now())
            .unwrap();
        fx.scheduler.handle(SchedulerEvent::JobTerminal(job_id));
    }

    const LINEAR: &str = r#"
on: push
jobs:
  a:
    runs-on: linux
    steps: [{run: echo a}]
  b:
    needs: a
    runs-on: linux
    steps: [{run: echo b}]
  c:
    needs: b
    runs-on: linux
    steps: [{run: echo c}]
"#;

    #[test]
    fn test_linear_dag_gates_on_needs() {
        let fx = fixture();
        let run_id = create_run(&fx, LINEAR, "refs/heads/main");

        // Only `a` is dispatched at first.
        assert_eq!(job_by_name(&fx, run_id, "a").status, JobStatus::Queued);
        assert!(fx.queue.contains(job_by_name(&fx, run_id, "a").id));
        assert_eq!(job_by_name(&fx, run_id, "b").status, JobStatus::Pending);

        finish(&fx, job_by_name(&fx, run_id, "a").id, JobConclusion::Succeeded);
        assert_eq!(job_by_name(&fx, run_id, "b").status, JobStatus::Queued);
        assert_eq!(job_by_name(&fx, run_id, "c").status, JobStatus::Pending);

        finish(&fx, job_by_name(&fx, run_id, "b").id, JobConclusion::Succeeded);
        finish(&fx, job_by_name(&fx, run_id, "c").id, JobConclusion::Succeeded);

        let run = fx.store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.conclusion, Some(RunConclusion::Success));
    }

    #[test]
    fn test_failed_need_skips_dependents() {
        let fx = fixture();
        let run_id = create_run(&fx, LINEAR, "refs/heads/main");

        finish(&fx, job_by_name(&fx, run_id, "a").id, JobConclusion::Failed);

        // b and c settle to skipped in the same wake (propagation fixpoint).
        assert_eq!(
            job_by_name(&fx, run_id, "b").conclusion,
            Some(JobConclusion::Skipped)
        );
        assert_eq!(
            job_by_name(&fx, run_id, "c").conclusion,
            Some(JobConclusion::Skipped)
        );

        let run = fx.store.run(run_id).unwrap();
        assert_eq!(run.conclusion, Some(RunConclusion::Failure));
    }

    #[test]
    fn test_conditional_skip_keeps_run_green() {
        let fx = fixture();
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: linux
    steps: [{run: echo b}]
  deploy:
    needs: build
    runs-on: linux
    if: success() && github.ref == 'refs/heads/main'
    steps: [{run: echo d}]
"#;
        let run_id = create_run(&fx, yaml, "refs/heads/feature");

        finish(&fx, job_by_name(&fx, run_id, "build").id, JobConclusion::Succeeded);

        assert_eq!(
            job_by_name(&fx, run_id, "deploy").conclusion,
            Some(JobConclusion::Skipped)
        );
        let run = fx.store.run(run_id).unwrap();
        assert_eq!(run.conclusion, Some(RunConclusion::Success));
    }

    #[test]
    fn test_always_runs_after_failure() {
        let fx = fixture();
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: linux
    steps: [{run: echo b}]
  report:
    needs: build
    runs-on: linux
    if: always()
    steps: [{run: echo r}]
  onfail:
    needs: build
    runs-on: linux
    if: failure()
    steps: [{run: echo f}]
"#;
        let run_id = create_run(&fx, yaml, "refs/heads/main");

        finish(&fx, job_by_name(&fx, run_id, "build").id, JobConclusion::Failed);

        assert_eq!(job_by_name(&fx, run_id, "report").status, JobStatus::Queued);
        assert_eq!(job_by_name(&fx, run_id, "onfail").status, JobStatus::Queued);
    }

    #[test]
    fn test_fail_fast_cancels_siblings() {
        let fx = fixture();
        let yaml = r#"
on: push
jobs:
  test:
    runs-on: linux
    strategy:
      fail-fast: true
      matrix:
        n: [1, 2, 3]
    steps: [{run: echo n}]
"#;
        let run_id = create_run(&fx, yaml, "refs/heads/main");
        let jobs = fx.store.jobs_of_run(run_id);
        assert_eq!(jobs.len(), 3);

        // Cell n=2 fails; its queued siblings are cancelled.
        let victim = jobs
            .iter()
            .find(|j| j.matrix.as_ref().unwrap().index == 1)
            .unwrap();
        finish(&fx, victim.id, JobConclusion::Failed);

        for job in fx.store.jobs_of_run(run_id) {
            if job.id == victim.id {
                assert_eq!(job.conclusion, Some(JobConclusion::Failed));
            } else {
                assert_eq!(job.conclusion, Some(JobConclusion::Cancelled));
            }
        }
        let run = fx.store.run(run_id).unwrap();
        assert_eq!(run.conclusion, Some(RunConclusion::Failure));
    }

    #[test]
    fn test_max_parallel_holds_siblings() {
        let fx = fixture();
        let yaml = r#"
on: push
jobs:
  test:
    runs-on: linux
    strategy:
      max-parallel: 1
      matrix:
        n: [1, 2]
    steps: [{run: echo n}]
"#;
        let run_id = create_run(&fx, yaml, "refs/heads/main");

        let queued: Vec<Job> = fx
            .store
            .jobs_of_run(run_id)
            .into_iter()
            .filter(|j| fx.queue.contains(j.id))
            .collect();
        assert_eq!(queued.len(), 1);

        // Finishing the first releases the second.
        finish(&fx, queued[0].id, JobConclusion::Succeeded);
        let queued_now: Vec<Job> = fx
            .store
            .jobs_of_run(run_id)
            .into_iter()
            .filter(|j| fx.queue.contains(j.id))
            .collect();
        assert_eq!(queued_now.len(), 1);
        assert_ne!(queued_now[0].id, queued[0].id);
    }

    #[test]
    fn test_concurrency_cancel_in_progress() {
        let fx = fixture();
        let yaml = r#"
on: push
concurrency:
  group: deploy-prod
  cancel-in-progress: true
jobs:
  deploy:
    runs-on: linux
    steps: [{run: echo d}]
"#;
        let first = create_run(&fx, yaml, "refs/heads/main");
        let first_job = job_by_name(&fx, first, "deploy");
        assert_eq!(first_job.status, JobStatus::Queued);

        // Second run arrives; the earlier holder is cancelled before the
        // newcomer dispatches.
        let second = create_run(&fx, yaml, "refs/heads/main");

        let first_job = fx.store.job(first_job.id).unwrap();
        assert_eq!(first_job.conclusion, Some(JobConclusion::Cancelled));
        assert!(!fx.queue.contains(first_job.id));

        let second_job = job_by_name(&fx, second, "deploy");
        assert_eq!(second_job.status, JobStatus::Queued);
        assert!(fx.queue.contains(second_job.id));

        let first_run = fx.store.run(first).unwrap();
        assert_eq!(first_run.conclusion, Some(RunConclusion::Cancelled));

        finish(&fx, second_job.id, JobConclusion::Succeeded);
        assert_eq!(
            fx.store.run(second).unwrap().conclusion,
            Some(RunConclusion::Success)
        );
    }

    #[test]
    fn test_concurrency_without_cancel_blocks() {
        let fx = fixture();
        let yaml = r#"
on: push
concurrency: deploy-prod
jobs:
  deploy:
    runs-on: linux
    steps: [{run: echo d}]
"#;
        let first = create_run(&fx, yaml, "refs/heads/main");
        let second = create_run(&fx, yaml, "refs/heads/main");

        let first_job = job_by_name(&fx, first, "deploy");
        let second_job = job_by_name(&fx, second, "deploy");
        assert!(fx.queue.contains(first_job.id));
        assert!(!fx.queue.contains(second_job.id));

        // Releasing the slot admits the blocked job on the next pass.
        finish(&fx, first_job.id, JobConclusion::Succeeded);
        assert!(fx.queue.contains(second_job.id));
    }

    #[test]
    fn test_run_cancel() {
        let fx = fixture();
        let run_id = create_run(&fx, LINEAR, "refs/heads/main");

        fx.scheduler.handle(SchedulerEvent::CancelRun(run_id));

        let run = fx.store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.conclusion, Some(RunConclusion::Cancelled));
        for job in fx.store.jobs_of_run(run_id) {
            assert_eq!(job.conclusion, Some(JobConclusion::Cancelled));
            assert!(!fx.queue.contains(job.id));
        }
    }

    #[test]
    fn test_eval_error_skips_with_reason() {
        let fx = fixture();
        let yaml = r#"
on: push
jobs:
  odd:
    runs-on: linux
    if: fromJSON('not json')
    steps: [{run: echo x}]
"#;
        let run_id = create_run(&fx, yaml, "refs/heads/main");

        let job = job_by_name(&fx, run_id, "odd");
        assert_eq!(job.conclusion, Some(JobConclusion::Skipped));
        assert!(matches!(job.failure, Some(FailureReason::EvalFailed(_))));
    }

    #[test]
    fn test_deadline_times_out_claimed_job() {
        let fx = fixture();
        let run_id = create_run(&fx, LINEAR, "refs/heads/main");
        let a = job_by_name(&fx, run_id, "a");

        fx.queue.remove(a.id);
        fx.store
            .claim_job(a.id, crate::model::RunnerId::new(), Utc::now() + Duration::hours(1))
            .unwrap();

        // Deadline still ahead: the tick leaves the job alone.
        let mut effects = Vec::new();
        fx.scheduler.check_deadlines(&mut effects);
        assert_eq!(fx.store.job(a.id).unwrap().status, JobStatus::Claimed);

        // Drag the deadline into the past through a rebuilt job entry.
        let mut stale = fx.store.job(a.id).unwrap();
        stale.deadline = Some(Utc::now() - Duration::minutes(1));
        fx.store.insert_job(stale);

        fx.scheduler.check_deadlines(&mut effects);
        let job = fx.store.job(a.id).unwrap();
        assert_eq!(job.conclusion, Some(JobConclusion::Failed));
        assert!(matches!(job.failure, Some(FailureReason::TimedOut(_))));
        assert!(job.lease_expires_at.is_none());
    }

    #[test]
    fn test_no_matching_runner_after_dispatch_wait() {
        let store = Arc::new(StateStore::new());
        let queue = Arc::new(JobQueue::new(std::time::Duration::from_secs(60)));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            QueueConfig {
                dispatch_wait_secs: 0,
                ..QueueConfig::default()
            },
        );
        let fx = Fixture {
            store,
            queue,
            scheduler,
        };
        let run_id = create_run(
            &fx,
            "on: push\njobs:\n  exotic:\n    runs-on: mars\n    steps: [{run: echo hi}]\n",
            "refs/heads/main",
        );
        let job = job_by_name(&fx, run_id, "exotic");
        assert!(fx.queue.contains(job.id));

        // No registered runner can ever serve `mars`; the wait expires.
        std::thread::sleep(std::time::Duration::from_millis(5));
        fx.scheduler.handle(SchedulerEvent::Tick);

        let job = fx.store.job(job.id).unwrap();
        assert_eq!(job.conclusion, Some(JobConclusion::Failed));
        assert!(matches!(
            job.failure,
            Some(FailureReason::NoMatchingRunner(_))
        ));
        assert!(!fx.queue.contains(job.id));
        assert_eq!(
            fx.store.run(run_id).unwrap().conclusion,
            Some(RunConclusion::Failure)
        );
    }

    #[test]
    fn test_timeout_minutes_sets_deadline() {
        let fx = fixture();
        let yaml = r#"
on: push
jobs:
  slow:
    runs-on: linux
    timeout-minutes: 30
    steps: [{run: sleep 1}]
"#;
        let run_id = create_run(&fx, yaml, "refs/heads/main");
        let job = job_by_name(&fx, run_id, "slow");
        let deadline = job.deadline.unwrap();
        let expected = Utc::now() + Duration::minutes(30);
        assert!((deadline - expected).num_seconds().abs() < 5);
    }
}
