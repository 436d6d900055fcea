use crate::types::{StepStatus, Workflow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate performance figures, populated when a workflow completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_duration_ms: u64,
    pub step_count: usize,
    pub average_step_duration_ms: f64,
    pub handoff_count: usize,
    pub total_retries: u32,
    pub rounds: u32,
}

impl WorkflowMetrics {
    pub(crate) fn compute(workflow: &Workflow, completed_at: DateTime<Utc>) -> Self {
        let total_duration_ms = workflow
            .started_at()
            .map(|started| (completed_at - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let durations: Vec<u64> = workflow
            .results()
            .values()
            .map(|output| output.duration_ms)
            .collect();
        let average_step_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        Self {
            total_duration_ms,
            step_count: workflow
                .steps()
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            average_step_duration_ms,
            handoff_count: workflow.ledger().handoff_count(),
            total_retries: workflow.steps().iter().map(|s| s.retry_count).sum(),
            rounds: workflow.rounds(),
        }
    }
}
