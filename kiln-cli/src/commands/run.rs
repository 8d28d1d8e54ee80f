// `kiln run` - execute a workflow locally through the full engine:
// trigger match, planning, scheduling, queue claim, executor protocol,
// log pipeline, and artifact archival, with an embedded shell runner.

use chrono::Utc;
use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use kiln_engine::config::{Config, StorageBackendKind};
use kiln_engine::model::{EventKind, TriggerEvent};
use kiln_engine::secrets::StaticSecrets;
use kiln_engine::Engine;

use crate::local_runner::LocalRunner;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow YAML file
    pub file: PathBuf,

    /// Git ref the trigger event carries
    #[arg(long, default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Working directory for steps (defaults to the current directory)
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Repo-scoped secrets, NAME=value (repeatable)
    #[arg(long = "secret", value_name = "NAME=VALUE")]
    pub secrets: Vec<String>,

    /// Print archived step logs after the run
    #[arg(long)]
    pub logs: bool,
}

const LOCAL_REPO: &str = "local/workspace";

pub async fn execute(args: RunArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)?;
    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let mut secrets = StaticSecrets::new();
    for pair in &args.secrets {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| eyre!("secret '{pair}' is not NAME=VALUE"))?;
        secrets.set_repo(LOCAL_REPO, name, value);
    }

    let mut config = Config::default();
    config.storage.backend = StorageBackendKind::Memory;
    let engine = Arc::new(Engine::new(config, Arc::new(secrets)));

    engine
        .trigger
        .upsert_workflow(LOCAL_REPO, &args.file.display().to_string(), &source)
        .map_err(|err| eyre!("{err}"))?;

    let event = TriggerEvent {
        kind: EventKind::Push,
        repo: LOCAL_REPO.into(),
        git_ref: args.git_ref.clone(),
        sha: "0".repeat(40),
        actor: whoami(),
        changed_paths: vec![],
        workflow: None,
        inputs: HashMap::new(),
        payload: serde_json::Value::Null,
        occurred_at: Utc::now(),
    };

    let runs = engine.submit_event(&event).map_err(|err| eyre!("{err}"))?;
    let run = runs
        .into_iter()
        .next()
        .ok_or_else(|| eyre!("the event matched no workflow"))?;

    // One local runner carrying every label the plan asks for.
    let labels: Vec<String> = engine
        .store
        .jobs_of_run(run.id)
        .iter()
        .flat_map(|j| j.labels.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let runner = LocalRunner::register(Arc::clone(&engine), labels, workspace)?;
    runner.drive(run.id).await?;

    // Report.
    let run = engine
        .store
        .run(run.id)
        .ok_or_else(|| eyre!("run disappeared"))?;
    println!(
        "run #{} {}: {}",
        run.number,
        run.workflow_name,
        run.conclusion.map(|c| c.as_str()).unwrap_or("unknown")
    );
    for job in engine.store.jobs_of_run(run.id) {
        println!(
            "  {} -> {}",
            job.display_name,
            job.conclusion.map(|c| c.as_str()).unwrap_or("pending")
        );
        if args.logs {
            for artifact in engine.artifacts.list_for_run(run.id) {
                if !artifact.name.starts_with(&format!("logs/{}", job.id)) {
                    continue;
                }
                if let Ok(content) = engine.artifacts.download(artifact.id, None).await {
                    for line in String::from_utf8_lossy(&content).lines() {
                        println!("    | {line}");
                    }
                }
            }
        }
    }

    if run.conclusion == Some(kiln_engine::model::RunConclusion::Success) {
        Ok(())
    } else {
        Err(eyre!("run concluded {:?}", run.conclusion))
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}
