use super::task::{TaskExecutor, TaskOutcome, TaskRequest};
use crate::types::{Payload, StepId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// One step attempt ready to hand to its executor
pub struct Dispatch {
    /// Position of the step in the workflow
    pub index: usize,
    pub executor: Arc<dyn TaskExecutor>,
    pub request: TaskRequest,
    pub timeout: Duration,
}

/// Result of one attempt, already normalised: `Err` carries the failure message
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub index: usize,
    pub step_id: StepId,
    pub attempt: u32,
    pub outcome: std::result::Result<TaskOutcome, String>,
    pub duration: Duration,
}

/// Runs attempts concurrently and waits for all of them
pub struct StepExecutor {
    enforce_timeouts: bool,
}

impl StepExecutor {
    pub fn new(enforce_timeouts: bool) -> Self {
        Self { enforce_timeouts }
    }

    /// Fan out every dispatch of a round and return once all have resolved.
    /// Results come back in dispatch order.
    pub async fn run_round(&self, context: Arc<Payload>, dispatches: Vec<Dispatch>) -> Vec<AttemptResult> {
        let mut handles = Vec::with_capacity(dispatches.len());

        for dispatch in dispatches {
            let index = dispatch.index;
            let step_id = dispatch.request.step_id.clone();
            let attempt = dispatch.request.attempt;
            let context = context.clone();
            let enforce_timeouts = self.enforce_timeouts;

            let handle = tokio::spawn(async move {
                Self::execute_attempt(dispatch, &context, enforce_timeouts).await
            });
            handles.push((index, step_id, attempt, Instant::now(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (index, step_id, attempt, spawned_at, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(step_id = %step_id, attempt, "executor task aborted: {}", e);
                    AttemptResult {
                        index,
                        step_id,
                        attempt,
                        outcome: Err(format!("executor panicked: {}", e)),
                        duration: spawned_at.elapsed(),
                    }
                }
            };
            results.push(result);
        }

        results
    }

    /// Execute one attempt with deadline enforcement
    async fn execute_attempt(dispatch: Dispatch, context: &Payload, enforce_timeouts: bool) -> AttemptResult {
        let Dispatch {
            index,
            executor,
            request,
            timeout: budget,
        } = dispatch;
        let step_id = request.step_id.clone();
        let attempt = request.attempt;

        tracing::info!(step_id = %step_id, attempt, task_kind = %request.task_kind, "executing step");

        let start = Instant::now();
        let result = if enforce_timeouts {
            match timeout(budget, executor.run(request, context)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(step_id = %step_id, "step timed out after {:?}", budget);
                    Err(anyhow::anyhow!("Step timed out after {} seconds", budget.as_secs_f64()))
                }
            }
        } else {
            executor.run(request, context).await
        };
        let duration = start.elapsed();

        let outcome = match result {
            Ok(outcome) if outcome.success => Ok(outcome),
            Ok(outcome) => Err(outcome
                .error
                .unwrap_or_else(|| "executor reported failure".to_string())),
            Err(e) => Err(format!("{:#}", e)),
        };

        AttemptResult {
            index,
            step_id,
            attempt,
            outcome,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, WorkflowId};
    use anyhow::Result;

    struct Sleepy(Duration);

    #[async_trait::async_trait]
    impl TaskExecutor for Sleepy {
        async fn run(&self, task: TaskRequest, _context: &Payload) -> Result<TaskOutcome> {
            tokio::time::sleep(self.0).await;
            let mut output = Payload::new();
            output.insert("step".into(), task.step_id.as_str().into());
            Ok(TaskOutcome::success(output))
        }
    }

    struct Refuses;

    #[async_trait::async_trait]
    impl TaskExecutor for Refuses {
        async fn run(&self, _task: TaskRequest, _context: &Payload) -> Result<TaskOutcome> {
            Ok(TaskOutcome::failure("rate limited"))
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl TaskExecutor for Panics {
        async fn run(&self, _task: TaskRequest, _context: &Payload) -> Result<TaskOutcome> {
            panic!("executor bug")
        }
    }

    fn dispatch(index: usize, executor: Arc<dyn TaskExecutor>, timeout: Duration) -> Dispatch {
        Dispatch {
            index,
            executor,
            request: TaskRequest {
                workflow_id: WorkflowId::new(),
                step_id: StepId::new(format!("s{}", index)),
                task_kind: "test".into(),
                input: Payload::new(),
                attempt: 1,
                priority: Priority::Normal,
                deadline: None,
            },
            timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_runs_concurrently() {
        let executor = StepExecutor::new(true);
        let slow: Arc<dyn TaskExecutor> = Arc::new(Sleepy(Duration::from_secs(10)));
        let started = Instant::now();

        let results = executor
            .run_round(
                Arc::new(Payload::new()),
                (0..3).map(|i| dispatch(i, slow.clone(), Duration::from_secs(60))).collect(),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        // Three 10s sleeps overlapped rather than running back to back
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failure() {
        let executor = StepExecutor::new(true);
        let results = executor
            .run_round(
                Arc::new(Payload::new()),
                vec![dispatch(0, Arc::new(Sleepy(Duration::from_secs(30))), Duration::from_secs(1))],
            )
            .await;

        let error = results[0].outcome.as_ref().unwrap_err();
        assert!(error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisory_timeout_waits_for_executor() {
        let executor = StepExecutor::new(false);
        let results = executor
            .run_round(
                Arc::new(Payload::new()),
                vec![dispatch(0, Arc::new(Sleepy(Duration::from_secs(30))), Duration::from_secs(1))],
            )
            .await;

        assert!(results[0].outcome.is_ok());
    }

    #[tokio::test]
    async fn test_unsuccessful_outcome_and_panic_are_failures() {
        let executor = StepExecutor::new(true);
        let results = executor
            .run_round(
                Arc::new(Payload::new()),
                vec![
                    dispatch(0, Arc::new(Refuses), Duration::from_secs(5)),
                    dispatch(1, Arc::new(Panics), Duration::from_secs(5)),
                ],
            )
            .await;

        assert_eq!(results[0].outcome.as_ref().unwrap_err(), "rate limited");
        assert!(results[1].outcome.as_ref().unwrap_err().contains("panicked"));
        assert_eq!(results[1].step_id, StepId::new("s1"));
    }
}
