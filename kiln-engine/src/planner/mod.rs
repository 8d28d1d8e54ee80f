// Run planner
// Turns a run's workflow snapshot into concrete jobs and steps: matrix
// expansion, DAG validation, initial statuses.

pub mod dag;
pub mod matrix;

use std::collections::HashMap;

use crate::config::Limits;
use crate::error::PlanError;
use crate::expression::{self, EvalContext};
use crate::model::{
    ConcurrencySetting, Job, JobId, JobStatus, MatrixCell, Run, Step, StepAction, StepId,
    StepStatus,
};
use crate::workflow::models::{Concurrency, JobSpec, StepSpec};

pub use dag::JobDag;

/// Plan a run: instantiate jobs in declaration order, one per matrix cell,
/// with steps attached and the DAG validated.
///
/// Jobs with no `needs` start queued (their `if` is evaluated at dispatch
/// time); the rest start pending.
pub fn plan(run: &Run, limits: &Limits) -> Result<Vec<Job>, PlanError> {
    let workflow = &run.snapshot;
    JobDag::build(&workflow.jobs)?;

    let mut jobs = Vec::new();
    for (name, spec) in workflow.jobs.iter() {
        let cells = match spec.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
            Some(m) => {
                let cells = matrix::expand(m);
                if cells.len() > limits.max_jobs_per_run {
                    return Err(PlanError::MatrixExplosion {
                        job: name.to_string(),
                        cells: cells.len(),
                        limit: limits.max_jobs_per_run,
                    });
                }
                cells.into_iter().map(Some).collect()
            }
            None => vec![None],
        };

        let total = cells.len();
        for (index, cell) in cells.into_iter().enumerate() {
            let job = build_job(run, name, spec, cell.map(|values| MatrixCell {
                index,
                total,
                values,
            }))?;
            jobs.push(job);

            if jobs.len() > limits.max_jobs_per_run {
                return Err(PlanError::TooManyJobs {
                    jobs: jobs.len(),
                    limit: limits.max_jobs_per_run,
                });
            }
        }
    }

    Ok(jobs)
}

fn build_job(
    run: &Run,
    name: &str,
    spec: &JobSpec,
    cell: Option<MatrixCell>,
) -> Result<Job, PlanError> {
    let id = JobId::new();

    // Matrix values are in scope for `runs-on` and the concurrency group.
    let eval_ctx = EvalContext::new()
        .with_event(run.event.context())
        .with_matrix(
            cell.as_ref()
                .map(|c| c.values.clone())
                .unwrap_or_default(),
        );

    let raw_labels = spec
        .runs_on
        .as_ref()
        .map(|r| r.labels())
        .unwrap_or_default();
    // Labels that fail to interpolate keep their literal form; the queue
    // then simply never finds a runner for them.
    let labels: Vec<String> = raw_labels
        .iter()
        .map(|label| {
            expression::interpolate(label, &eval_ctx).unwrap_or_else(|_| label.clone())
        })
        .collect();

    let concurrency = spec
        .concurrency
        .as_ref()
        .or(run.snapshot.concurrency.as_ref())
        .map(|c| resolve_concurrency(c, &eval_ctx));

    let display_name = {
        let base = spec.name.clone().unwrap_or_else(|| name.to_string());
        match &cell {
            Some(c) if !c.values.is_empty() => {
                format!("{base} ({})", matrix::cell_label(&c.values))
            }
            _ => base,
        }
    };

    let mut env = run.snapshot.env.clone();
    env.extend(spec.env.clone());

    let status = if spec.needs.is_empty() {
        JobStatus::Queued
    } else {
        JobStatus::Pending
    };

    let strategy = spec.strategy.as_ref();
    let steps = spec
        .steps
        .iter()
        .enumerate()
        .map(|(ordinal, step)| build_step(id, ordinal as u32, step))
        .collect();

    Ok(Job {
        id,
        run_id: run.id,
        name: name.to_string(),
        display_name,
        matrix: cell,
        labels,
        needs: spec.needs.to_vec(),
        if_expr: spec.if_expr.clone(),
        env,
        concurrency,
        environment: spec.environment.as_ref().map(|e| e.name().to_string()),
        output_exprs: spec.outputs.clone(),
        timeout_minutes: spec.timeout_minutes.unwrap_or(360),
        fail_fast: strategy.map(|s| s.fail_fast).unwrap_or(true),
        max_parallel: strategy.and_then(|s| s.max_parallel),
        status,
        conclusion: None,
        failure: None,
        cancel_requested: false,
        runner: None,
        lease_expires_at: None,
        attempt: 0,
        deadline: None,
        started_at: None,
        completed_at: None,
        outputs: HashMap::new(),
        steps,
    })
}

fn resolve_concurrency(concurrency: &Concurrency, ctx: &EvalContext) -> ConcurrencySetting {
    let group = expression::interpolate(concurrency.group(), ctx)
        .unwrap_or_else(|_| concurrency.group().to_string());
    ConcurrencySetting {
        group,
        cancel_in_progress: concurrency.cancel_in_progress(),
    }
}

fn build_step(job_id: JobId, ordinal: u32, spec: &StepSpec) -> Step {
    let action = if let Some(uses) = &spec.uses {
        StepAction::Uses {
            reference: uses.clone(),
            with: spec.with.clone(),
        }
    } else {
        StepAction::Run {
            script: spec.run.clone().unwrap_or_default(),
            shell: spec.shell.clone(),
            working_directory: spec.working_directory.clone(),
        }
    };

    Step {
        id: StepId::new(),
        job_id,
        ordinal,
        name: spec.display_name(),
        step_key: spec.id.clone(),
        action,
        env: spec.env.clone(),
        if_expr: spec.if_expr.clone(),
        continue_on_error: spec.continue_on_error,
        timeout_minutes: spec.timeout_minutes,
        status: StepStatus::Pending,
        conclusion: None,
        started_at: None,
        completed_at: None,
        outputs: HashMap::new(),
    }
}
