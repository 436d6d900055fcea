use crate::types::{StepId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in a workflow's execution ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

/// Lifecycle events recorded while a workflow runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Workflow lifecycle events
    WorkflowStarted {
        workflow_id: WorkflowId,
        step_count: usize,
    },
    WorkflowPaused {
        workflow_id: WorkflowId,
        round: u32,
    },
    WorkflowResumed {
        workflow_id: WorkflowId,
        round: u32,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        duration_ms: u64,
        rounds: u32,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        step_id: Option<StepId>,
        error: String,
        duration_ms: u64,
    },

    // Step lifecycle events
    StepStarted {
        step_id: StepId,
        attempt: u32,
        round: u32,
    },
    StepCompleted {
        step_id: StepId,
        attempt: u32,
        duration_ms: u64,
    },
    StepRetry {
        step_id: StepId,
        retry_count: u32,
        max_retries: u32,
        error: String,
    },
    StepFailed {
        step_id: StepId,
        attempts: u32,
        error: String,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },

    // Handoff events
    HandoffProcessed {
        producer: StepId,
        consumer: String,
        key: String,
        fields: Vec<String>,
    },
    HandoffRejected {
        producer: StepId,
        consumer: String,
        key: String,
        failed_checks: Vec<String>,
    },
}

impl EventType {
    /// Step the event refers to, if any
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepRetry { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepSkipped { step_id, .. } => Some(step_id),
            Self::HandoffProcessed { producer, .. } | Self::HandoffRejected { producer, .. } => {
                Some(producer)
            }
            Self::WorkflowFailed { step_id, .. } => step_id.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowPaused { .. } => "workflow_paused",
            Self::WorkflowResumed { .. } => "workflow_resumed",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepRetry { .. } => "step_retry",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::HandoffProcessed { .. } => "handoff_processed",
            Self::HandoffRejected { .. } => "handoff_rejected",
        }
    }
}

/// Append-only ordered event log. Only the scheduler appends to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    events: Vec<LedgerEvent>,
}

impl Ledger {
    pub(crate) fn append(&mut self, event_type: EventType) {
        tracing::debug!(event = event_type.name(), "ledger: {:?}", event_type);
        self.events.push(LedgerEvent {
            sequence: self.events.len() as u64,
            timestamp: Utc::now(),
            event_type,
        });
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events that refer to a given step, in order
    pub fn for_step<'a>(&'a self, step_id: &'a StepId) -> impl Iterator<Item = &'a LedgerEvent> {
        self.events
            .iter()
            .filter(move |e| e.event_type.step_id() == Some(step_id))
    }

    /// Number of events with the given name (e.g. `"step_retry"`)
    pub fn count(&self, name: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type.name() == name)
            .count()
    }

    pub fn handoff_count(&self) -> usize {
        self.count("handoff_processed")
    }

    pub fn last(&self) -> Option<&LedgerEvent> {
        self.events.last()
    }
}
