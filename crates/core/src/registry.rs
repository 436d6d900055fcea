use crate::error::{Result, WorkflowError};
use crate::metrics::WorkflowMetrics;
use crate::types::{StepId, StepStatus, Workflow, WorkflowId, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-step line of a status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub id: StepId,
    pub executor: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
}

/// Consistent snapshot answered by a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub current_step: Option<StepId>,
    pub rounds: u32,
    pub steps: Vec<StepReport>,
    pub handoff_count: usize,
    pub failed_step: Option<StepId>,
    pub error: Option<String>,
    /// Only set once the workflow has completed
    pub metrics: Option<WorkflowMetrics>,
}

impl WorkflowStatusReport {
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id.as_str() == id)
    }
}

impl From<&Workflow> for WorkflowStatusReport {
    fn from(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id(),
            name: workflow.name().to_string(),
            status: workflow.status(),
            current_step: workflow.current_step().cloned(),
            rounds: workflow.rounds(),
            steps: workflow
                .steps()
                .iter()
                .map(|s| StepReport {
                    id: s.id.clone(),
                    executor: s.executor.clone(),
                    status: s.status,
                    retry_count: s.retry_count,
                    max_retries: s.max_retries,
                    error: s.error.clone(),
                })
                .collect(),
            handoff_count: workflow.ledger().handoff_count(),
            failed_step: workflow.failed_step().cloned(),
            error: workflow.error().map(str::to_string),
            metrics: workflow.metrics().cloned(),
        }
    }
}

struct ActiveWorkflow {
    snapshot: Workflow,
    running: bool,
    pause_requested: bool,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<WorkflowId, ActiveWorkflow>,
    history: VecDeque<Workflow>,
}

/// Active workflows keyed by id plus a bounded history of terminal ones.
/// One lock guards everything; each workflow's internal state is only
/// written by its own coordinating loop, which publishes snapshots here.
pub struct WorkflowRegistry {
    state: Mutex<RegistryState>,
    history_limit: usize,
}

impl WorkflowRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Entries are replaced wholesale, so a poisoned lock still holds consistent data
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a workflow that has not started yet
    pub fn insert(&self, workflow: Workflow) -> Result<WorkflowId> {
        let id = workflow.id();
        let mut state = self.lock();
        if state.active.contains_key(&id) || state.history.iter().any(|w| w.id() == id) {
            return Err(WorkflowError::AlreadyRegistered(id));
        }
        state.active.insert(
            id,
            ActiveWorkflow {
                snapshot: workflow,
                running: false,
                pause_requested: false,
            },
        );
        Ok(id)
    }

    /// Hand the workflow to a coordinating loop. Fails if it is already
    /// being driven or is not pending/paused. The returned claim must live
    /// as long as the loop does.
    pub(crate) fn checkout(&self, id: &WorkflowId) -> Result<(Workflow, Checkout<'_>)> {
        let mut state = self.lock();
        let finished = state.history.iter().any(|w| w.id() == *id);
        let Some(entry) = state.active.get_mut(id) else {
            return Err(if finished {
                WorkflowError::NotResumable {
                    workflow_id: *id,
                    reason: "workflow already finished".to_string(),
                }
            } else {
                WorkflowError::NotFound(*id)
            });
        };
        if entry.running {
            return Err(WorkflowError::NotResumable {
                workflow_id: *id,
                reason: "workflow is already running".to_string(),
            });
        }
        match entry.snapshot.status() {
            WorkflowStatus::Pending | WorkflowStatus::Paused => {
                entry.running = true;
                let claim = Checkout {
                    registry: self,
                    id: *id,
                };
                Ok((entry.snapshot.clone(), claim))
            }
            status => Err(WorkflowError::NotResumable {
                workflow_id: *id,
                reason: format!("workflow is {:?}", status),
            }),
        }
    }

    /// Replace the visible snapshot of a running workflow
    pub(crate) fn publish(&self, workflow: &Workflow) {
        if let Some(entry) = self.lock().active.get_mut(&workflow.id()) {
            entry.snapshot = workflow.clone();
        }
    }

    /// Ask a workflow to pause before its next round
    pub fn request_pause(&self, id: &WorkflowId) -> Result<()> {
        let mut state = self.lock();
        let entry = state.active.get_mut(id).ok_or(WorkflowError::NotFound(*id))?;
        entry.pause_requested = true;
        tracing::warn!(workflow_id = %id, "pause requested");
        Ok(())
    }

    /// Consume a pending pause request
    pub(crate) fn take_pause_request(&self, id: &WorkflowId) -> bool {
        self.lock()
            .active
            .get_mut(id)
            .map(|entry| std::mem::take(&mut entry.pause_requested))
            .unwrap_or(false)
    }

    /// Return a paused workflow to the registry; it stays active
    pub(crate) fn park(&self, workflow: Workflow) {
        if let Some(entry) = self.lock().active.get_mut(&workflow.id()) {
            entry.snapshot = workflow;
            entry.running = false;
        }
    }

    /// Drop a claim that was neither parked nor archived. The last
    /// published snapshot becomes a paused workflow that can be resumed.
    fn release(&self, id: &WorkflowId) {
        if let Some(entry) = self.lock().active.get_mut(id) {
            if entry.running {
                entry.running = false;
                entry.pause_requested = false;
                entry.snapshot.interrupt();
                tracing::warn!(workflow_id = %id, "run abandoned, workflow parked as paused");
            }
        }
    }

    /// Move a terminal workflow into history, evicting the oldest entries
    pub(crate) fn archive(&self, workflow: Workflow) {
        let mut state = self.lock();
        state.active.remove(&workflow.id());
        state.history.push_back(workflow);
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
    }

    /// Full copy of a workflow, active or archived
    pub fn get(&self, id: &WorkflowId) -> Option<Workflow> {
        let state = self.lock();
        state
            .active
            .get(id)
            .map(|entry| entry.snapshot.clone())
            .or_else(|| state.history.iter().find(|w| w.id() == *id).cloned())
    }

    pub fn status(&self, id: &WorkflowId) -> Option<WorkflowStatusReport> {
        let state = self.lock();
        state
            .active
            .get(id)
            .map(|entry| WorkflowStatusReport::from(&entry.snapshot))
            .or_else(|| {
                state
                    .history
                    .iter()
                    .find(|w| w.id() == *id)
                    .map(WorkflowStatusReport::from)
            })
    }

    pub fn active_ids(&self) -> Vec<WorkflowId> {
        self.lock().active.keys().copied().collect()
    }

}

/// Exclusive claim on an active workflow held by its coordinating loop
pub(crate) struct Checkout<'a> {
    registry: &'a WorkflowRegistry,
    id: WorkflowId,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}
