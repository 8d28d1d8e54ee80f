// `kiln plan` - dry-run planning: jobs, matrix cells, dependency order

use chrono::Utc;
use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::collections::HashMap;
use std::path::PathBuf;

use kiln_engine::config::Limits;
use kiln_engine::model::{EventKind, Run, RunId, RunStatus, TriggerEvent};
use kiln_engine::planner::{self, JobDag};
use kiln_engine::workflow::WorkflowParser;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Workflow YAML file
    pub file: PathBuf,

    /// Git ref the hypothetical event carries
    #[arg(long, default_value = "refs/heads/main")]
    pub git_ref: String,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)?;
    let workflow = WorkflowParser::parse_and_validate(&source, &Limits::default())
        .map_err(|err| eyre!("{}: {err}", args.file.display()))?;

    let dag = JobDag::build(&workflow.jobs).map_err(|err| eyre!("{err}"))?;
    let order: Vec<String> = dag.topological_order().iter().map(|s| s.to_string()).collect();

    let run = Run {
        id: RunId::new(),
        repo: "local/plan".into(),
        number: 0,
        workflow_name: workflow.name.clone().unwrap_or_default(),
        snapshot: workflow,
        event: TriggerEvent {
            kind: EventKind::Push,
            repo: "local/plan".into(),
            git_ref: args.git_ref.clone(),
            sha: "0".repeat(40),
            actor: "local".into(),
            changed_paths: vec![],
            workflow: None,
            inputs: HashMap::new(),
            payload: serde_json::Value::Null,
            occurred_at: Utc::now(),
        },
        status: RunStatus::Queued,
        conclusion: None,
        failure: None,
        actor: "local".into(),
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        jobs: vec![],
    };

    let jobs = planner::plan(&run, &Limits::default()).map_err(|err| eyre!("{err}"))?;

    println!("execution order: {}", order.join(" -> "));
    println!();
    for job in &jobs {
        let needs = if job.needs.is_empty() {
            String::new()
        } else {
            format!("  needs: {}", job.needs.join(", "))
        };
        println!(
            "{}  [{}]{}",
            job.display_name,
            job.labels.join(", "),
            needs
        );
        for step in &job.steps {
            println!("    {}. {}", step.ordinal + 1, step.name);
        }
    }
    println!();
    println!("{} job(s) planned", jobs.len());
    Ok(())
}
