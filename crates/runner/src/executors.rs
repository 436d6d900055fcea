// Built-in dry-run executors for exercising a pipeline's shape without real
// content generation or browser automation behind it

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{ExecutorRegistry, Payload, TaskExecutor, TaskOutcome, TaskRequest};

/// Returns its input bag unchanged, plus the task kind
pub struct EchoExecutor;

#[async_trait::async_trait]
impl TaskExecutor for EchoExecutor {
    async fn run(&self, task: TaskRequest, _context: &Payload) -> Result<TaskOutcome> {
        let mut output = task.input;
        output.insert("task_kind".to_string(), Value::String(task.task_kind));
        Ok(TaskOutcome::success(output))
    }
}

/// Replays a canned result declared in the step input:
///
/// - `fixture`: object returned as output
/// - `fail_attempts`: number of leading attempts that fail
/// - `delay_ms`: simulated latency
pub struct FixtureExecutor;

#[async_trait::async_trait]
impl TaskExecutor for FixtureExecutor {
    async fn run(&self, task: TaskRequest, _context: &Payload) -> Result<TaskOutcome> {
        if let Some(delay) = task.input.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let fail_attempts = task
            .input
            .get("fail_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if u64::from(task.attempt) <= fail_attempts {
            return Ok(TaskOutcome::failure(format!(
                "fixture failure {} of {}",
                task.attempt, fail_attempts
            )));
        }

        let output = match task.input.get("fixture") {
            Some(Value::Object(fixture)) => fixture.clone(),
            Some(other) => anyhow::bail!("fixture for step {} must be an object, got {}", task.step_id, other),
            None => Payload::new(),
        };

        Ok(TaskOutcome::success(output).with_metadata("attempt", json!(task.attempt)))
    }
}

/// Executor table with the built-ins registered as `echo` and `fixture`.
/// With `stub_all`, every other name in `executor_names` is bound to the
/// fixture executor too.
pub fn builtin_registry(executor_names: &[String], stub_all: bool) -> ExecutorRegistry {
    let echo: Arc<dyn TaskExecutor> = Arc::new(EchoExecutor);
    let fixture: Arc<dyn TaskExecutor> = Arc::new(FixtureExecutor);

    let mut registry = ExecutorRegistry::new()
        .with("echo", echo)
        .with("fixture", fixture.clone());

    if stub_all {
        for name in executor_names {
            if !registry.contains(name) {
                tracing::info!(executor = %name, "binding executor to fixture stub");
                registry.register(name.clone(), fixture.clone());
            }
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::{Priority, StepId, WorkflowId};

    fn request(input: Value, attempt: u32) -> TaskRequest {
        let Value::Object(input) = input else {
            panic!("input must be an object")
        };
        TaskRequest {
            workflow_id: WorkflowId::new(),
            step_id: StepId::new("s"),
            task_kind: "parse_resume".into(),
            input,
            attempt,
            priority: Priority::Normal,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_input() {
        let outcome = EchoExecutor
            .run(request(json!({"name": "Ada"}), 1), &Payload::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output["name"], "Ada");
        assert_eq!(outcome.output["task_kind"], "parse_resume");
    }

    #[tokio::test]
    async fn test_fixture_fails_then_replays() {
        let input = json!({"fail_attempts": 1, "fixture": {"score": 87}});

        let first = FixtureExecutor
            .run(request(input.clone(), 1), &Payload::new())
            .await
            .unwrap();
        assert!(!first.success);

        let second = FixtureExecutor
            .run(request(input, 2), &Payload::new())
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.output["score"], 87);
    }

    #[tokio::test]
    async fn test_fixture_rejects_non_object() {
        let result = FixtureExecutor
            .run(request(json!({"fixture": [1, 2]}), 1), &Payload::new())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_stub_all_binds_every_name() {
        let names = vec!["analyzer".to_string(), "echo".to_string()];
        assert!(!builtin_registry(&names, false).contains("analyzer"));

        let registry = builtin_registry(&names, true);
        assert_eq!(registry.names(), vec!["analyzer", "echo", "fixture"]);
    }
}
