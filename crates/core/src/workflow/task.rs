// Task executor contract and the name-keyed executor table

use crate::types::{Payload, Priority, StepId, WorkflowId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Work handed to an executor for one attempt of one step
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub task_kind: String,
    pub input: Payload,
    /// 1-based attempt number
    pub attempt: u32,
    pub priority: Priority,
    /// Point in time after which the engine stops waiting for the call
    pub deadline: Option<Instant>,
}

/// What an executor reports back
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    /// Only meaningful on success
    #[serde(default)]
    pub output: Payload,
    /// Only meaningful on failure
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Payload,
}

impl TaskOutcome {
    pub fn success(output: Payload) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: Payload::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Payload::new(),
            error: Some(error.into()),
            metadata: Payload::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Pluggable implementation of a step's business logic
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt. Returning `Err` or an unsuccessful outcome both
    /// count as a step execution failure.
    async fn run(&self, task: TaskRequest, context: &Payload) -> Result<TaskOutcome>;
}

/// Read-only map from executor name to implementation, filled once at startup
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under a name, replacing any previous binding
    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(name, executor);
        self
    }

    /// Get an executor by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}
