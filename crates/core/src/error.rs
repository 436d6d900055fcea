//! Error taxonomy for workflow construction and execution.

use crate::types::{StepId, WorkflowId};

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors raised while building, submitting or running a workflow.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    /// A workflow must contain at least one step.
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    /// Two steps share an id.
    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    /// A step lists itself as a dependency.
    #[error("Step {0} depends on itself")]
    SelfDependency(StepId),

    /// A dependency references a step that is not part of the workflow.
    #[error("Dependency {dependency} not found for step {step_id}")]
    UnknownDependency { step_id: StepId, dependency: StepId },

    /// The dependency graph is not acyclic.
    #[error("Workflow contains circular dependencies between steps {steps:?}")]
    CycleDetected { steps: Vec<StepId> },

    /// A step is bound to an executor that was never registered.
    #[error("Step {step_id} is bound to unknown executor '{executor}'")]
    UnknownExecutor { step_id: StepId, executor: String },

    /// A handoff targets a step that is not part of the workflow.
    #[error("Handoff from {producer} targets unknown step {consumer}")]
    UnknownHandoffStep { producer: StepId, consumer: StepId },

    /// A handoff names a custom check or transformation that is not registered.
    #[error("Handoff from {producer} uses unknown rule '{rule}'")]
    UnknownRule { producer: StepId, rule: String },

    /// A step definition is malformed.
    #[error("Invalid step {step_id}: {reason}")]
    InvalidStep { step_id: StepId, reason: String },

    /// No active or archived workflow has this id.
    #[error("Workflow {0} not found")]
    NotFound(WorkflowId),

    /// The workflow was already submitted.
    #[error("Workflow {0} is already registered")]
    AlreadyRegistered(WorkflowId),

    /// The workflow is running or terminal and cannot be (re)started.
    #[error("Workflow {workflow_id} cannot be run: {reason}")]
    NotResumable { workflow_id: WorkflowId, reason: String },

    /// A step exhausted its retry budget; the workflow was aborted.
    #[error("Workflow {workflow_id} failed: step {step_id} failed: {error}")]
    StepFailed {
        workflow_id: WorkflowId,
        step_id: StepId,
        error: String,
    },

    /// No step could be dispatched although some remain unfinished.
    #[error("Workflow {workflow_id} is blocked; unfinished steps: {steps:?}")]
    Blocked {
        workflow_id: WorkflowId,
        steps: Vec<StepId>,
    },
}

impl WorkflowError {
    /// Whether the error was raised before any round ran.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyWorkflow
                | Self::DuplicateStep(_)
                | Self::SelfDependency(_)
                | Self::UnknownDependency { .. }
                | Self::CycleDetected { .. }
                | Self::UnknownExecutor { .. }
                | Self::UnknownHandoffStep { .. }
                | Self::UnknownRule { .. }
                | Self::InvalidStep { .. }
        )
    }
}
