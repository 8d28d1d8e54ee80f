// Embedded local runner
// Speaks the executor protocol against an in-process engine and executes
// `run:` steps with the local shell. Action (`uses:`) steps are recorded in
// the log but not executed; local runs have no action marketplace.

use bytes::Bytes;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use kiln_engine::exec::{ClaimedJob, StepOutcome, StepPlan};
use kiln_engine::expression::{self, EvalContext, StatusFlags};
use kiln_engine::model::{
    JobConclusion, RunId, RunnerKind, RunnerMetadata, RunnerScope, RunnerStatus, StepAction,
    StepConclusion,
};
use kiln_engine::Engine;

pub struct LocalRunner {
    engine: Arc<Engine>,
    runner_id: kiln_engine::RunnerId,
    workspace: PathBuf,
}

impl LocalRunner {
    /// Register a global-scope runner carrying the given labels.
    pub fn register(engine: Arc<Engine>, labels: Vec<String>, workspace: PathBuf) -> Result<Self> {
        let token = engine
            .runners
            .issue_token(RunnerScope::Global, labels, RunnerKind::SelfHosted);
        let runner = engine.runners.register(
            &token,
            "local",
            vec![],
            RunnerMetadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            },
        )?;
        Ok(Self {
            engine,
            runner_id: runner.id,
            workspace,
        })
    }

    /// Claim and execute jobs until the run is terminal.
    pub async fn drive(&self, run_id: RunId) -> Result<()> {
        // Generous backstop against a wedged schedule.
        for _ in 0..100_000 {
            self.engine.drain_events().await;

            let run = self
                .engine
                .store
                .run(run_id)
                .ok_or_else(|| eyre!("run {run_id} vanished"))?;
            if run.status.is_terminal() {
                return Ok(());
            }

            self.engine
                .runners
                .heartbeat(self.runner_id, RunnerStatus::Online, &[])?;

            match self.engine.executor.claim(self.runner_id)? {
                Some(claim) => self.execute_job(claim).await?,
                None => {
                    self.engine.tick().await;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
        Err(eyre!("run {run_id} did not settle"))
    }

    async fn execute_job(&self, claim: ClaimedJob) -> Result<()> {
        debug!(job = %claim.job_id, name = %claim.display_name, "executing job");
        let mut failed = false;

        for step in &claim.steps {
            self.engine
                .executor
                .step_started(self.runner_id, claim.job_id, step.ordinal)?;

            let should_run = self.step_should_run(step, &claim, failed)?;
            let (conclusion, outcome) = if should_run {
                self.execute_step(&claim, step).await?
            } else {
                (StepConclusion::Skipped, StepOutcome::default())
            };

            if conclusion == StepConclusion::Failed && !step.continue_on_error {
                failed = true;
            }

            self.engine
                .executor
                .step_finished(self.runner_id, claim.job_id, step.ordinal, conclusion, outcome)
                .await?;

            // Lease stays warm across long steps.
            let ack = self.engine.executor.heartbeat(self.runner_id, claim.job_id)?;
            if ack.cancel_requested {
                break;
            }
        }

        let conclusion = if failed {
            JobConclusion::Failed
        } else {
            JobConclusion::Succeeded
        };
        self.engine
            .executor
            .job_finished(self.runner_id, claim.job_id, conclusion)
            .await?;
        Ok(())
    }

    /// Step-level `if`: default semantics skip after a hard failure.
    fn step_should_run(&self, step: &StepPlan, claim: &ClaimedJob, failed: bool) -> Result<bool> {
        let Some(expr) = &step.if_expr else {
            return Ok(!failed);
        };
        let ctx = EvalContext::new()
            .with_event(claim.event_context.clone())
            .with_env(merged_env(claim, step))
            .with_matrix(claim.matrix.clone())
            .with_status(StatusFlags {
                success: !failed,
                failure: failed,
                cancelled: false,
            })
            .with_workspace(self.workspace.clone());
        expression::evaluate_bool(expr, &ctx).map_err(|e| eyre!("step condition: {e}"))
    }

    async fn execute_step(
        &self,
        claim: &ClaimedJob,
        step: &StepPlan,
    ) -> Result<(StepConclusion, StepOutcome)> {
        match &step.action {
            StepAction::Uses { reference, .. } => {
                self.engine.executor.log_append(
                    self.runner_id,
                    claim.job_id,
                    step.ordinal,
                    0,
                    Bytes::from(format!(
                        "action '{reference}' recorded (actions do not execute in local runs)\n"
                    )),
                )?;
                Ok((StepConclusion::Succeeded, StepOutcome::default()))
            }
            StepAction::Run {
                script,
                shell,
                working_directory,
            } => {
                self.run_script(claim, step, script, shell.as_deref(), working_directory.as_deref())
                    .await
            }
        }
    }

    async fn run_script(
        &self,
        claim: &ClaimedJob,
        step: &StepPlan,
        script: &str,
        shell: Option<&str>,
        working_directory: Option<&str>,
    ) -> Result<(StepConclusion, StepOutcome)> {
        let ctx = EvalContext::new()
            .with_event(claim.event_context.clone())
            .with_env(merged_env(claim, step))
            .with_matrix(claim.matrix.clone())
            .with_workspace(self.workspace.clone());
        let script = expression::interpolate(script, &ctx).map_err(|e| eyre!("{e}"))?;

        let outputs_file = tempfile::NamedTempFile::new()?;
        let cwd = match working_directory {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        };

        let (program, flag): (&str, &str) = match shell.unwrap_or("sh") {
            "bash" => ("bash", "-c"),
            "sh" => ("sh", "-c"),
            other => (other, "-c"),
        };

        let mut command = tokio::process::Command::new(program);
        command
            .arg(flag)
            .arg(&script)
            .current_dir(&cwd)
            .env("KILN_OUTPUT", outputs_file.path())
            .envs(merged_env(claim, step))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let output = command.output().await?;

        let mut seq = 0u64;
        for payload in [&output.stdout, &output.stderr] {
            if !payload.is_empty() {
                self.engine.executor.log_append(
                    self.runner_id,
                    claim.job_id,
                    step.ordinal,
                    seq,
                    Bytes::from(payload.clone()),
                )?;
                seq += 1;
            }
        }

        let mut outcome = StepOutcome::default();
        if let Ok(contents) = std::fs::read_to_string(outputs_file.path()) {
            for line in contents.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    outcome
                        .outputs
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }

        let conclusion = if output.status.success() {
            StepConclusion::Succeeded
        } else {
            StepConclusion::Failed
        };
        Ok((conclusion, outcome))
    }
}

fn merged_env(claim: &ClaimedJob, step: &StepPlan) -> HashMap<String, String> {
    let mut env = claim.env.clone();
    env.extend(step.env.clone());
    env
}
