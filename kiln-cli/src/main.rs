use clap::{Parser, Subcommand};
use color_eyre::Result;

mod commands;
mod local_runner;

/// Kiln - workflow engine CLI
///
/// Validate workflow YAML, inspect the planned job graph, or execute a
/// workflow end-to-end against an embedded local runner.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a workflow YAML file
    Validate(commands::validate::ValidateArgs),

    /// Show the planned jobs, matrix cells, and dependency order
    Plan(commands::plan::PlanArgs),

    /// Run a workflow locally through the full engine
    Run(commands::run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Plan(args) => commands::plan::execute(args),
        Commands::Run(args) => commands::run::execute(args).await,
    }
}
