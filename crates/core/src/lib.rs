// Core types and execution engine for Stepwise workflow pipelines

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod registry;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, HandoffPolicy};
pub use error::{Result, WorkflowError};
pub use events::{EventType, Ledger, LedgerEvent};
pub use metrics::WorkflowMetrics;
pub use registry::{StepReport, WorkflowRegistry, WorkflowStatusReport};
pub use types::*;
pub use workflow::{
    ExecutorRegistry, HandoffRules, TaskExecutor, TaskOutcome, TaskRequest, WorkflowEngine,
};
