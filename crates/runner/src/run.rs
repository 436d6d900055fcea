use crate::definition::WorkflowDefinition;
use crate::executors::builtin_registry;
use anyhow::{Context, Result};
use serde::Serialize;
use stepwise_core::{EngineConfig, LedgerEvent, WorkflowEngine, WorkflowStatusReport};

/// What the runner prints once a workflow stops
#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub report: WorkflowStatusReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<Vec<LedgerEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Build an engine for the definition, run it to a stop and collect the
/// final report
pub async fn run_definition(
    definition: WorkflowDefinition,
    config: EngineConfig,
    stub_all: bool,
    include_ledger: bool,
) -> Result<RunOutput> {
    let executors = builtin_registry(&definition.executor_names(), stub_all);
    let workflow = definition.into_workflow()?;
    let engine = WorkflowEngine::new(executors, config);

    let id = engine.submit(workflow).context("Failed to submit workflow")?;
    let error = engine.run(&id).await.err().map(|e| e.to_string());

    let workflow = engine
        .registry()
        .get(&id)
        .context("Workflow disappeared from the registry")?;

    Ok(RunOutput {
        report: WorkflowStatusReport::from(&workflow),
        ledger: include_ledger.then(|| workflow.ledger().events().to_vec()),
        error,
    })
}
