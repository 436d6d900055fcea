use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod definition;
mod executors;
mod run;

use config::{LoggingConfig, RunnerConfig};
use definition::WorkflowDefinition;

#[derive(Parser, Debug)]
#[command(name = "stepwise")]
#[command(about = "Run a multi-step workflow pipeline", long_about = None)]
struct Args {
    /// Workflow definition file (JSON, or TOML by extension)
    workflow: PathBuf,

    /// Path to configuration file
    #[arg(short, long, default_value = "stepwise.toml", env = "STEPWISE_CONFIG")]
    config: PathBuf,

    /// Bind every executor the workflow names to the fixture stub
    #[arg(long)]
    stub_all: bool,

    /// Include the execution ledger in the output
    #[arg(long)]
    ledger: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RunnerConfig::load(&args.config)?;
    init_tracing(&config.logging);

    if !args.config.exists() {
        tracing::info!("Configuration file not found, using defaults");
    }
    tracing::info!("Loading workflow from {}", args.workflow.display());

    let definition = WorkflowDefinition::from_path(&args.workflow)?;
    let output = run::run_definition(definition, config.engine, args.stub_all, args.ledger).await?;

    let rendered = serde_json::to_string_pretty(&output).context("Failed to render report")?;
    println!("{}", rendered);

    if !output.succeeded() {
        anyhow::bail!("workflow {} did not complete", output.report.name);
    }

    Ok(())
}
