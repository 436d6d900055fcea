use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use stepwise_core::{Payload, Step, Workflow};

/// On-disk workflow description (JSON, or TOML by file extension)
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub context: Payload,
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(&content).context("Failed to parse TOML workflow definition")
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON workflow definition")
        }
    }

    /// Executor names referenced by the steps, deduplicated and sorted
    pub fn executor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.iter().map(|s| s.executor.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn into_workflow(self) -> Result<Workflow> {
        Workflow::new(self.name, self.steps, self.context).context("Invalid workflow definition")
    }
}
