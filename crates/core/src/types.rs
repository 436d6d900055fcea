use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::events::{EventType, Ledger};
use crate::metrics::WorkflowMetrics;
use crate::workflow::dag::WorkflowDag;

/// Opaque key/value bag used for step input, step output and shared context
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Retry budget applied when a step does not declare one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique identifier for a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Status of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Advisory step priority. Scheduling order never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Receiver of a handoff: a specific step, or every step bound to an executor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffTarget {
    Step(StepId),
    Executor(String),
}

impl HandoffTarget {
    /// Name used in the `"{producer}_to_{consumer}"` key
    pub fn name(&self) -> &str {
        match self {
            Self::Step(id) => id.as_str(),
            Self::Executor(name) => name,
        }
    }

    pub fn matches(&self, step: &Step) -> bool {
        match self {
            Self::Step(id) => *id == step.id,
            Self::Executor(name) => *name == step.executor,
        }
    }
}

/// Named predicate run against a projected handoff payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ValidationCheck {
    /// Field exists (any value, including null)
    Present { field: String },
    /// Field exists and is not null, "", [] or {}
    NonEmpty { field: String },
    IsNumber { field: String },
    /// Field is a number within `[min, max]`
    InRange { field: String, min: f64, max: f64 },
    /// Predicate registered on `HandoffRules`
    Custom { name: String },
}

impl std::fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present { field } => write!(f, "present({})", field),
            Self::NonEmpty { field } => write!(f, "non_empty({})", field),
            Self::IsNumber { field } => write!(f, "is_number({})", field),
            Self::InRange { field, min, max } => write!(f, "in_range({}, {}, {})", field, min, max),
            Self::Custom { name } => write!(f, "custom({})", name),
        }
    }
}

/// Named pure rewrite applied to a projected handoff payload before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TransformRule {
    /// Sort an array of objects by a sub-field
    SortBy {
        field: String,
        key: String,
        #[serde(default = "default_descending")]
        descending: bool,
    },
    /// Split an array of objects into two new fields on `obj[key] == value`.
    /// The source field is removed.
    Partition {
        field: String,
        key: String,
        value: serde_json::Value,
        matched_into: String,
        rest_into: String,
    },
    Rename { from: String, to: String },
    /// Transformation registered on `HandoffRules`
    Custom { name: String },
}

fn default_descending() -> bool {
    true
}

/// Declared transfer of a producer's output fields into a consumer's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffSpec {
    /// Filled in from the owning step when left empty
    #[serde(default)]
    pub producer: StepId,
    pub consumer: HandoffTarget,
    /// Producer output field -> consumer input field
    pub field_mapping: HashMap<String, String>,
    #[serde(default)]
    pub validations: Vec<ValidationCheck>,
    #[serde(default)]
    pub transformations: Vec<TransformRule>,
}

impl HandoffSpec {
    pub fn to_step(consumer: impl Into<String>) -> Self {
        Self::new(HandoffTarget::Step(StepId::new(consumer)))
    }

    pub fn to_executor(executor: impl Into<String>) -> Self {
        Self::new(HandoffTarget::Executor(executor.into()))
    }

    fn new(consumer: HandoffTarget) -> Self {
        Self {
            producer: StepId::default(),
            consumer,
            field_mapping: HashMap::new(),
            validations: Vec::new(),
            transformations: Vec::new(),
        }
    }

    pub fn map(mut self, output_field: impl Into<String>, input_field: impl Into<String>) -> Self {
        self.field_mapping
            .insert(output_field.into(), input_field.into());
        self
    }

    pub fn validate(mut self, check: ValidationCheck) -> Self {
        self.validations.push(check);
        self
    }

    pub fn transform(mut self, rule: TransformRule) -> Self {
        self.transformations.push(rule);
        self
    }

    /// Key under which the processed payload is stored
    pub fn key(&self) -> String {
        format!("{}_to_{}", self.producer, self.consumer.name())
    }
}

/// A single named unit of work bound to one task executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub executor: String,
    pub task_kind: String,
    #[serde(default)]
    pub description: String,
    /// Static input; handoff payloads are overlaid on top at dispatch
    #[serde(default)]
    pub input: Payload,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub priority: Priority,
    /// Per-attempt budget in milliseconds. Falls back to the engine's
    /// default timeout when unset; zero is rejected.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub handoffs: Vec<HandoffSpec>,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        executor: impl Into<String>,
        task_kind: impl Into<String>,
    ) -> Self {
        Self {
            id: StepId::new(id),
            executor: executor.into(),
            task_kind: task_kind.into(),
            description: String::new(),
            input: Payload::new(),
            dependencies: Vec::new(),
            priority: Priority::default(),
            timeout_ms: None,
            max_retries: DEFAULT_MAX_RETRIES,
            handoffs: Vec::new(),
            retry_count: 0,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(StepId::new(step_id));
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sub-millisecond remainders round up, so only a zero duration
    /// produces a zero budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_micros().div_ceil(1000);
        self.timeout_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_handoff(mut self, mut handoff: HandoffSpec) -> Self {
        handoff.producer = self.id.clone();
        self.handoffs.push(handoff);
        self
    }

    fn reset(&mut self) {
        self.retry_count = 0;
        self.status = StepStatus::Pending;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Terminal output of a completed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub output: Payload,
    pub metadata: Payload,
    pub attempts: u32,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// State transition applied to one step by the scheduler.
/// Every step mutation goes through `Workflow::apply`.
#[derive(Debug, Clone)]
pub(crate) enum StepUpdate {
    Ready,
    Started { round: u32 },
    Completed { output: StepOutput },
    Failed { error: String },
    Skipped { reason: String },
    /// Attempt abandoned without a result; the step runs again
    Interrupted,
}

/// What a recorded failure did to the step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureDisposition {
    Retry,
    Permanent,
}

/// An ordered DAG of steps sharing one context, status and ledger
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    steps: Vec<Step>,
    #[serde(skip)]
    step_indices: HashMap<StepId, usize>,
    context: Payload,
    status: WorkflowStatus,
    current_step: Option<StepId>,
    results: HashMap<StepId, StepOutput>,
    handoff_data: HashMap<String, Payload>,
    ledger: Ledger,
    metrics: Option<WorkflowMetrics>,
    rounds: u32,
    failed_step: Option<StepId>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Build and validate a workflow. Rejects duplicate ids, dangling or
    /// self-referencing dependencies, cycles and malformed handoffs.
    pub fn new(name: impl Into<String>, mut steps: Vec<Step>, context: Payload) -> Result<Self> {
        for step in &mut steps {
            step.reset();
            if step.executor.trim().is_empty() {
                return Err(WorkflowError::InvalidStep {
                    step_id: step.id.clone(),
                    reason: "no executor bound".to_string(),
                });
            }
            if step.timeout_ms == Some(0) {
                return Err(WorkflowError::InvalidStep {
                    step_id: step.id.clone(),
                    reason: "timeout must be positive".to_string(),
                });
            }
            for handoff in &mut step.handoffs {
                if handoff.producer.as_str().is_empty() {
                    handoff.producer = step.id.clone();
                } else if handoff.producer != step.id {
                    return Err(WorkflowError::InvalidStep {
                        step_id: step.id.clone(),
                        reason: format!(
                            "handoff declares producer {} but is attached to {}",
                            handoff.producer, step.id
                        ),
                    });
                }
            }
        }

        let dag = WorkflowDag::build(&steps)?;
        Self::check_handoffs(&steps, &dag)?;

        let step_indices = steps
            .iter()
            .enumerate()
            .map(|(idx, step)| (step.id.clone(), idx))
            .collect();

        Ok(Self {
            id: WorkflowId::new(),
            name: name.into(),
            steps,
            step_indices,
            context,
            status: WorkflowStatus::Pending,
            current_step: None,
            results: HashMap::new(),
            handoff_data: HashMap::new(),
            ledger: Ledger::default(),
            metrics: None,
            rounds: 0,
            failed_step: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    fn check_handoffs(steps: &[Step], dag: &WorkflowDag) -> Result<()> {
        // Stored payloads are addressed by key, so two pairs may not share one
        let mut keys: HashMap<String, (&StepId, &HandoffTarget)> = HashMap::new();

        for step in steps {
            for handoff in &step.handoffs {
                let key = handoff.key();
                let previous = keys.insert(key.clone(), (&step.id, &handoff.consumer));
                if let Some((producer, consumer)) = previous {
                    let reason = if *producer == step.id && *consumer == handoff.consumer {
                        format!("duplicate handoff to {}", handoff.consumer.name())
                    } else {
                        format!(
                            "handoff key {} collides with the handoff from {} to {}",
                            key,
                            producer,
                            consumer.name()
                        )
                    };
                    return Err(WorkflowError::InvalidStep {
                        step_id: step.id.clone(),
                        reason,
                    });
                }

                if let HandoffTarget::Step(consumer) = &handoff.consumer {
                    if !dag.contains(consumer) {
                        return Err(WorkflowError::UnknownHandoffStep {
                            producer: step.id.clone(),
                            consumer: consumer.clone(),
                        });
                    }
                }

                let consumers: Vec<&Step> = steps
                    .iter()
                    .filter(|s| s.id != step.id && handoff.consumer.matches(s))
                    .collect();
                if consumers.is_empty() {
                    return Err(WorkflowError::InvalidStep {
                        step_id: step.id.clone(),
                        reason: format!(
                            "handoff to {} reaches no other step",
                            handoff.consumer.name()
                        ),
                    });
                }

                // Handoff data is written when the producer completes, so every
                // consumer must be ordered after it.
                for consumer in consumers {
                    if !dag.depends_on_transitively(&consumer.id, &step.id) {
                        return Err(WorkflowError::InvalidStep {
                            step_id: consumer.id.clone(),
                            reason: format!(
                                "receives a handoff from {} but does not depend on it",
                                step.id
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.step_indices.get(id).map(|&idx| &self.steps[idx])
    }

    pub fn context(&self) -> &Payload {
        &self.context
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<&StepId> {
        self.current_step.as_ref()
    }

    pub fn results(&self) -> &HashMap<StepId, StepOutput> {
        &self.results
    }

    pub fn handoff_data(&self) -> &HashMap<String, Payload> {
        &self.handoff_data
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn metrics(&self) -> Option<&WorkflowMetrics> {
        self.metrics.as_ref()
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn failed_step(&self) -> Option<&StepId> {
        self.failed_step.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Ids of steps in terminal-success status
    pub fn completed_ids(&self) -> HashSet<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Steps that are not yet terminal
    pub fn unfinished_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Input bag for a step: its static input overlaid with every stored
    /// handoff payload addressed to it, in producer declaration order.
    pub fn assemble_input(&self, idx: usize) -> Payload {
        let step = &self.steps[idx];
        let mut input = step.input.clone();
        for producer in self.steps.iter().filter(|p| p.id != step.id) {
            for handoff in producer.handoffs.iter().filter(|h| h.consumer.matches(step)) {
                if let Some(payload) = self.handoff_data.get(&handoff.key()) {
                    input.extend(payload.clone());
                }
            }
        }
        input
    }

    pub(crate) fn start(&mut self) {
        self.status = WorkflowStatus::Running;
        self.started_at = Some(Utc::now());
        self.ledger.append(EventType::WorkflowStarted {
            workflow_id: self.id,
            step_count: self.steps.len(),
        });
    }

    pub(crate) fn resume(&mut self) {
        self.status = WorkflowStatus::Running;
        self.ledger.append(EventType::WorkflowResumed {
            workflow_id: self.id,
            round: self.rounds,
        });
    }

    pub(crate) fn pause(&mut self) {
        self.status = WorkflowStatus::Paused;
        self.ledger.append(EventType::WorkflowPaused {
            workflow_id: self.id,
            round: self.rounds,
        });
    }

    /// Park a workflow whose coordinating loop went away mid-run. Steps
    /// that were dispatched go back to pending with their retry budget
    /// untouched.
    pub(crate) fn interrupt(&mut self) {
        if self.status != WorkflowStatus::Running {
            return;
        }
        for idx in 0..self.steps.len() {
            if matches!(self.steps[idx].status, StepStatus::Ready | StepStatus::InProgress) {
                self.apply(idx, StepUpdate::Interrupted);
            }
        }
        self.current_step = None;
        self.pause();
    }

    /// Advance the round counter and return the new round number
    pub(crate) fn begin_round(&mut self) -> u32 {
        self.rounds += 1;
        self.rounds
    }

    pub(crate) fn apply(&mut self, idx: usize, update: StepUpdate) {
        let step = &mut self.steps[idx];
        match update {
            StepUpdate::Ready => {
                step.status = StepStatus::Ready;
            }
            StepUpdate::Started { round } => {
                step.status = StepStatus::InProgress;
                step.started_at = Some(Utc::now());
                self.current_step = Some(step.id.clone());
                self.ledger.append(EventType::StepStarted {
                    step_id: step.id.clone(),
                    attempt: step.retry_count + 1,
                    round,
                });
            }
            StepUpdate::Completed { output } => {
                step.status = StepStatus::Completed;
                step.error = None;
                step.completed_at = Some(output.completed_at);
                self.ledger.append(EventType::StepCompleted {
                    step_id: step.id.clone(),
                    attempt: output.attempts,
                    duration_ms: output.duration_ms,
                });
                self.results.insert(step.id.clone(), output);
            }
            StepUpdate::Failed { error } => {
                step.retry_count += 1;
                step.error = Some(error.clone());
                if step.retry_count <= step.max_retries {
                    step.status = StepStatus::Pending;
                    self.ledger.append(EventType::StepRetry {
                        step_id: step.id.clone(),
                        retry_count: step.retry_count,
                        max_retries: step.max_retries,
                        error,
                    });
                } else {
                    step.status = StepStatus::Failed;
                    step.completed_at = Some(Utc::now());
                    self.ledger.append(EventType::StepFailed {
                        step_id: step.id.clone(),
                        attempts: step.retry_count,
                        error,
                    });
                }
            }
            StepUpdate::Interrupted => {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
            StepUpdate::Skipped { reason } => {
                step.status = StepStatus::Skipped;
                self.ledger.append(EventType::StepSkipped {
                    step_id: step.id.clone(),
                    reason,
                });
            }
        }
    }

    /// Record a failed attempt and report whether the step may run again
    pub(crate) fn record_failure(&mut self, idx: usize, error: String) -> FailureDisposition {
        self.apply(idx, StepUpdate::Failed { error });
        if self.steps[idx].status == StepStatus::Failed {
            FailureDisposition::Permanent
        } else {
            FailureDisposition::Retry
        }
    }

    /// Store a validated handoff payload. A pair is written at most once.
    pub(crate) fn store_handoff(&mut self, spec: &HandoffSpec, payload: Payload) {
        let key = spec.key();
        if self.handoff_data.contains_key(&key) {
            return;
        }
        let mut fields: Vec<String> = payload.keys().cloned().collect();
        fields.sort();
        self.handoff_data.insert(key.clone(), payload);
        self.ledger.append(EventType::HandoffProcessed {
            producer: spec.producer.clone(),
            consumer: spec.consumer.name().to_string(),
            key,
            fields,
        });
    }

    pub(crate) fn reject_handoff(&mut self, spec: &HandoffSpec, failed_checks: Vec<String>) {
        self.ledger.append(EventType::HandoffRejected {
            producer: spec.producer.clone(),
            consumer: spec.consumer.name().to_string(),
            key: spec.key(),
            failed_checks,
        });
    }

    pub(crate) fn complete(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.current_step = None;
        let completed_at = Utc::now();
        self.completed_at = Some(completed_at);
        let metrics = WorkflowMetrics::compute(self, completed_at);
        self.ledger.append(EventType::WorkflowCompleted {
            workflow_id: self.id,
            duration_ms: metrics.total_duration_ms,
            rounds: self.rounds,
        });
        self.metrics = Some(metrics);
    }

    /// Mark the workflow failed. Every step that never ran to a terminal
    /// status is marked skipped so none is left pending.
    pub(crate) fn fail(&mut self, failed_step: Option<StepId>, error: String) {
        let reason = match &failed_step {
            Some(step_id) => format!("workflow aborted after step {} failed", step_id),
            None => "workflow aborted".to_string(),
        };
        for idx in 0..self.steps.len() {
            if !self.steps[idx].status.is_terminal() {
                self.apply(idx, StepUpdate::Skipped { reason: reason.clone() });
            }
        }

        self.status = WorkflowStatus::Failed;
        let completed_at = Utc::now();
        self.completed_at = Some(completed_at);
        let duration_ms = self
            .started_at
            .map(|started| (completed_at - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.ledger.append(EventType::WorkflowFailed {
            workflow_id: self.id,
            step_id: failed_step.clone(),
            error: error.clone(),
            duration_ms,
        });
        self.failed_step = failed_step;
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> Vec<Step> {
        vec![
            Step::new("a", "echo", "noop"),
            Step::new("b", "echo", "noop").depends_on("a"),
        ]
    }

    #[test]
    fn test_step_defaults() {
        let step = Step::new("a", "echo", "noop");
        assert_eq!(step.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.priority, Priority::Normal);
        assert!(step.timeout_ms.is_none());
    }

    #[test]
    fn test_handoff_key_uses_producer_and_consumer() {
        let step = Step::new("match", "scorer", "score")
            .with_handoff(HandoffSpec::to_step("tailor").map("score", "match_score"));
        assert_eq!(step.handoffs[0].producer, StepId::new("match"));
        assert_eq!(step.handoffs[0].key(), "match_to_tailor");

        let by_executor = HandoffSpec {
            producer: StepId::new("match"),
            ..HandoffSpec::to_executor("writer")
        };
        assert_eq!(by_executor.key(), "match_to_writer");
    }

    #[test]
    fn test_new_resets_runtime_state() {
        let mut step = Step::new("a", "echo", "noop");
        step.status = StepStatus::Completed;
        step.retry_count = 2;
        let workflow = Workflow::new("wf", vec![step], Payload::new()).unwrap();
        assert_eq!(workflow.steps()[0].status, StepStatus::Pending);
        assert_eq!(workflow.steps()[0].retry_count, 0);
        assert_eq!(workflow.status(), WorkflowStatus::Pending);
    }

    #[test]
    fn test_handoff_consumer_must_exist() {
        let steps = vec![Step::new("a", "echo", "noop")
            .with_handoff(HandoffSpec::to_step("ghost").map("x", "y"))];
        let err = Workflow::new("wf", steps, Payload::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownHandoffStep { .. }));
    }

    #[test]
    fn test_handoff_consumer_must_depend_on_producer() {
        let steps = vec![
            Step::new("a", "echo", "noop").with_handoff(HandoffSpec::to_step("b").map("x", "y")),
            Step::new("b", "echo", "noop"),
        ];
        let err = Workflow::new("wf", steps, Payload::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStep { .. }));
    }

    #[test]
    fn test_mismatched_producer_rejected() {
        let mut handoff = HandoffSpec::to_step("b").map("x", "y");
        handoff.producer = StepId::new("elsewhere");
        let mut a = Step::new("a", "echo", "noop");
        a.handoffs.push(handoff);
        let steps = vec![a, Step::new("b", "echo", "noop").depends_on("a")];
        assert!(Workflow::new("wf", steps, Payload::new()).is_err());
    }

    #[test]
    fn test_colliding_handoff_keys_rejected() {
        // a -> b_to_c and a_to_b -> c both render as "a_to_b_to_c"
        let steps = vec![
            Step::new("a", "echo", "noop")
                .with_handoff(HandoffSpec::to_step("b_to_c").map("x", "from_a")),
            Step::new("a_to_b", "echo", "noop")
                .with_handoff(HandoffSpec::to_step("c").map("x", "from_atob")),
            Step::new("b_to_c", "echo", "noop").depends_on("a"),
            Step::new("c", "echo", "noop").depends_on("a_to_b"),
        ];
        let err = Workflow::new("wf", steps, Payload::new()).unwrap_err();
        match err {
            WorkflowError::InvalidStep { step_id, reason } => {
                assert_eq!(step_id, StepId::new("a_to_b"));
                assert!(reason.contains("a_to_b_to_c"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_step_and_executor_target_with_same_name_rejected() {
        let steps = vec![
            Step::new("a", "echo", "noop")
                .with_handoff(HandoffSpec::to_step("writer").map("x", "x"))
                .with_handoff(HandoffSpec::to_executor("writer").map("y", "y")),
            Step::new("writer", "writer", "noop").depends_on("a"),
        ];
        let err = Workflow::new("wf", steps, Payload::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStep { .. }));
    }

    #[test]
    fn test_executor_target_must_be_ordered_after_producer() {
        let steps = vec![
            Step::new("a", "echo", "noop")
                .with_handoff(HandoffSpec::to_executor("writer").map("x", "y")),
            Step::new("b", "writer", "noop"),
        ];
        let err = Workflow::new("wf", steps, Payload::new()).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::InvalidStep {
                step_id: StepId::new("b"),
                reason: "receives a handoff from a but does not depend on it".into(),
            }
        );

        let steps = vec![
            Step::new("a", "echo", "noop")
                .with_handoff(HandoffSpec::to_executor("writer").map("x", "y")),
            Step::new("b", "writer", "noop").depends_on("a"),
            Step::new("c", "writer", "noop").depends_on("b"),
        ];
        assert!(Workflow::new("wf", steps, Payload::new()).is_ok());
    }

    #[test]
    fn test_executor_target_must_reach_another_step() {
        let steps = vec![
            Step::new("a", "writer", "noop")
                .with_handoff(HandoffSpec::to_executor("writer").map("x", "y")),
            Step::new("b", "echo", "noop").depends_on("a"),
        ];
        let err = Workflow::new("wf", steps, Payload::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStep { ref step_id, .. } if step_id.as_str() == "a"));
    }

    #[test]
    fn test_sub_second_timeout_kept_in_millis() {
        let step = Step::new("a", "echo", "noop").with_timeout(Duration::from_millis(500));
        assert_eq!(step.timeout_ms, Some(500));

        let step = Step::new("a", "echo", "noop").with_timeout(Duration::from_micros(1));
        assert_eq!(step.timeout_ms, Some(1));

        let zero = Step::new("a", "echo", "noop").with_timeout(Duration::ZERO);
        let err = Workflow::new("wf", vec![zero], Payload::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStep { .. }));
    }

    #[test]
    fn test_retry_then_permanent_failure() {
        let mut steps = linear();
        steps[0].max_retries = 1;
        let mut workflow = Workflow::new("wf", steps, Payload::new()).unwrap();

        assert_eq!(
            workflow.record_failure(0, "boom".into()),
            FailureDisposition::Retry
        );
        assert_eq!(workflow.steps()[0].status, StepStatus::Pending);
        assert_eq!(
            workflow.record_failure(0, "boom".into()),
            FailureDisposition::Permanent
        );
        assert_eq!(workflow.steps()[0].status, StepStatus::Failed);
        assert_eq!(workflow.steps()[0].retry_count, 2);
    }

    #[test]
    fn test_fail_skips_unfinished_steps() {
        let mut workflow = Workflow::new("wf", linear(), Payload::new()).unwrap();
        workflow.start();
        workflow.record_failure(0, "x".into());
        workflow.fail(Some(StepId::new("a")), "x".into());

        assert_eq!(workflow.status(), WorkflowStatus::Failed);
        assert!(workflow.unfinished_steps().is_empty());
        assert_eq!(workflow.steps()[1].status, StepStatus::Skipped);
        assert_eq!(workflow.failed_step(), Some(&StepId::new("a")));
    }

    #[test]
    fn test_assemble_input_overlays_handoffs() {
        let steps = vec![
            Step::new("a", "echo", "noop").with_handoff(HandoffSpec::to_step("b").map("score", "match_score")),
            Step::new("b", "echo", "noop")
                .depends_on("a")
                .with_input("job", json!("rust dev")),
        ];
        let mut workflow = Workflow::new("wf", steps, Payload::new()).unwrap();
        let spec = workflow.steps()[0].handoffs[0].clone();
        let mut payload = Payload::new();
        payload.insert("match_score".into(), json!(87));
        workflow.store_handoff(&spec, payload);

        let input = workflow.assemble_input(1);
        assert_eq!(input.get("match_score"), Some(&json!(87)));
        assert_eq!(input.get("job"), Some(&json!("rust dev")));
        assert_eq!(input.len(), 2);
    }

    #[test]
    fn test_handoff_written_at_most_once() {
        let steps = vec![
            Step::new("a", "echo", "noop").with_handoff(HandoffSpec::to_step("b").map("x", "x")),
            Step::new("b", "echo", "noop").depends_on("a"),
        ];
        let mut workflow = Workflow::new("wf", steps, Payload::new()).unwrap();
        let spec = workflow.steps()[0].handoffs[0].clone();

        let mut first = Payload::new();
        first.insert("x".into(), json!(1));
        let mut second = Payload::new();
        second.insert("x".into(), json!(2));
        workflow.store_handoff(&spec, first);
        workflow.store_handoff(&spec, second);

        assert_eq!(workflow.handoff_data()["a_to_b"]["x"], json!(1));
        assert_eq!(workflow.ledger().handoff_count(), 1);
    }

    #[test]
    fn test_step_deserializes_with_defaults() {
        let step: Step = serde_json::from_value(json!({
            "id": "extract",
            "executor": "parser",
            "task_kind": "parse_resume",
            "handoffs": [{
                "consumer": {"step": "match"},
                "field_mapping": {"skills": "candidate_skills"},
                "validations": [{"check": "non_empty", "field": "candidate_skills"}]
            }]
        }))
        .unwrap();

        assert_eq!(step.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(step.handoffs[0].consumer, HandoffTarget::Step(StepId::new("match")));
        assert_eq!(
            step.handoffs[0].validations[0],
            ValidationCheck::NonEmpty {
                field: "candidate_skills".into()
            }
        );
    }
}
