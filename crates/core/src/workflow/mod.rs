// DAG-based workflow execution engine

pub mod dag;
pub mod executor;
pub mod handoff;
pub mod step_executor;
pub mod task;

pub use dag::WorkflowDag;
pub use executor::WorkflowEngine;
pub use handoff::{CheckFn, HandoffOutcome, HandoffProcessor, HandoffRules, TransformFn};
pub use step_executor::StepExecutor;
pub use task::{ExecutorRegistry, TaskExecutor, TaskOutcome, TaskRequest};
