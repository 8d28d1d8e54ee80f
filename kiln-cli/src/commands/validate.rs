// `kiln validate` - parse and validate a workflow file

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::path::PathBuf;

use kiln_engine::config::Limits;
use kiln_engine::workflow::WorkflowParser;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Workflow YAML file
    pub file: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)?;

    match WorkflowParser::parse_and_validate(&source, &Limits::default()) {
        Ok(workflow) => {
            let name = workflow
                .name
                .clone()
                .unwrap_or_else(|| args.file.display().to_string());
            println!("{name}: OK ({} jobs)", workflow.jobs.len());
            Ok(())
        }
        Err(err) => Err(eyre!("{}: {err}", args.file.display())),
    }
}
