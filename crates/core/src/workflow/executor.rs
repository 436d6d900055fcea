use super::dag::WorkflowDag;
use super::handoff::{HandoffOutcome, HandoffProcessor, HandoffRules};
use super::step_executor::{AttemptResult, Dispatch, StepExecutor};
use super::task::{ExecutorRegistry, TaskRequest};
use crate::config::{EngineConfig, HandoffPolicy};
use crate::error::{Result, WorkflowError};
use crate::registry::{WorkflowRegistry, WorkflowStatusReport};
use crate::types::{
    FailureDisposition, StepId, StepOutput, StepUpdate, Workflow, WorkflowId, WorkflowStatus,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Workflow engine that coordinates round-based DAG execution
pub struct WorkflowEngine {
    executors: Arc<ExecutorRegistry>,
    rules: Arc<HandoffRules>,
    registry: Arc<WorkflowRegistry>,
    handoffs: HandoffProcessor,
    step_executor: StepExecutor,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(executors: ExecutorRegistry, config: EngineConfig) -> Self {
        Self::with_parts(
            Arc::new(executors),
            Arc::new(HandoffRules::default()),
            Arc::new(WorkflowRegistry::new(config.history_limit)),
            config,
        )
    }

    /// Build an engine around existing shared parts, e.g. a registry that
    /// several engines report into
    pub fn with_parts(
        executors: Arc<ExecutorRegistry>,
        rules: Arc<HandoffRules>,
        registry: Arc<WorkflowRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            handoffs: HandoffProcessor::new(rules.clone()),
            step_executor: StepExecutor::new(config.enforce_timeouts),
            executors,
            rules,
            registry,
            config,
        }
    }

    /// Replace the custom handoff rules
    pub fn with_rules(self, rules: HandoffRules) -> Self {
        Self::with_parts(self.executors, Arc::new(rules), self.registry, self.config)
    }

    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate executor and rule bindings and register the workflow.
    /// Nothing runs until `run` is called.
    pub fn submit(&self, workflow: Workflow) -> Result<WorkflowId> {
        for step in workflow.steps() {
            if !self.executors.contains(&step.executor) {
                return Err(WorkflowError::UnknownExecutor {
                    step_id: step.id.clone(),
                    executor: step.executor.clone(),
                });
            }
            self.rules.check_step(step)?;
        }

        let id = self.registry.insert(workflow)?;
        tracing::info!(workflow_id = %id, "workflow submitted");
        Ok(id)
    }

    /// Submit and run to a terminal (or paused) status
    pub async fn execute(&self, workflow: Workflow) -> Result<WorkflowStatusReport> {
        let id = self.submit(workflow)?;
        self.run(&id).await
    }

    /// Drive a submitted workflow. Returns the final report on completion or
    /// pause; a permanently failed step or a blocked graph is returned as an
    /// error after the workflow has been archived as FAILED.
    pub async fn run(&self, id: &WorkflowId) -> Result<WorkflowStatusReport> {
        // Dropping the claim without parking or archiving (the future was
        // cancelled) leaves the workflow paused and resumable.
        let (workflow, _claim) = self.registry.checkout(id)?;
        self.drive(workflow).await
    }

    /// Continue a paused workflow
    pub async fn resume(&self, id: &WorkflowId) -> Result<WorkflowStatusReport> {
        match self.registry.status(id).map(|r| r.status) {
            Some(WorkflowStatus::Paused) => self.run(id).await,
            Some(status) => Err(WorkflowError::NotResumable {
                workflow_id: *id,
                reason: format!("workflow is {:?}, not paused", status),
            }),
            None => Err(WorkflowError::NotFound(*id)),
        }
    }

    /// Request a pause; honored between rounds, never mid-round
    pub fn pause(&self, id: &WorkflowId) -> Result<()> {
        self.registry.request_pause(id)
    }

    pub fn status(&self, id: &WorkflowId) -> Option<WorkflowStatusReport> {
        self.registry.status(id)
    }

    /// Main loop: ready set -> concurrent dispatch -> barrier -> apply results
    async fn drive(&self, mut workflow: Workflow) -> Result<WorkflowStatusReport> {
        let id = workflow.id();
        let dag = match WorkflowDag::build(workflow.steps()) {
            Ok(dag) => dag,
            Err(e) => return self.abort(workflow, None, e),
        };

        if workflow.status() == WorkflowStatus::Paused {
            tracing::info!(workflow_id = %id, round = workflow.rounds(), "resuming workflow");
            workflow.resume();
        } else {
            tracing::info!(workflow_id = %id, name = %workflow.name(), "starting workflow execution");
            workflow.start();
        }
        self.registry.publish(&workflow);

        let context = Arc::new(workflow.context().clone());

        loop {
            if workflow.all_completed() {
                workflow.complete();
                tracing::info!(
                    workflow_id = %id,
                    rounds = workflow.rounds(),
                    "workflow execution completed"
                );
                let report = WorkflowStatusReport::from(&workflow);
                self.registry.archive(workflow);
                return Ok(report);
            }

            if self.registry.take_pause_request(&id) {
                workflow.pause();
                tracing::warn!(workflow_id = %id, round = workflow.rounds(), "workflow paused");
                let report = WorkflowStatusReport::from(&workflow);
                self.registry.park(workflow);
                return Ok(report);
            }

            let mut ready = dag.ready_steps(workflow.steps(), &workflow.completed_ids());
            if self.config.max_concurrency > 0 {
                ready.truncate(self.config.max_concurrency);
            }

            if ready.is_empty() {
                let steps = workflow.unfinished_steps();
                tracing::error!(workflow_id = %id, blocking = ?steps, "no step can be dispatched");
                let error = WorkflowError::Blocked {
                    workflow_id: id,
                    steps,
                };
                return self.abort(workflow, None, error);
            }

            let round = workflow.begin_round();
            tracing::info!(workflow_id = %id, round, steps = ready.len(), "dispatching round");

            let mut dispatches = Vec::with_capacity(ready.len());
            let mut undispatched = Vec::new();
            for &idx in &ready {
                workflow.apply(idx, StepUpdate::Ready);
                workflow.apply(idx, StepUpdate::Started { round });
                match self.dispatch_for(&workflow, idx) {
                    Ok(dispatch) => dispatches.push(dispatch),
                    Err(failed) => undispatched.push(failed),
                }
            }
            self.registry.publish(&workflow);

            let mut results = self.step_executor.run_round(context.clone(), dispatches).await;
            results.extend(undispatched);

            let mut fatal: Option<(StepId, String)> = None;
            for result in results {
                if let Err(error) = self.apply_result(&mut workflow, result) {
                    fatal.get_or_insert(error);
                }
            }
            self.registry.publish(&workflow);

            if let Some((step_id, error)) = fatal {
                let err = WorkflowError::StepFailed {
                    workflow_id: id,
                    step_id: step_id.clone(),
                    error,
                };
                return self.abort(workflow, Some(step_id), err);
            }
        }
    }

    /// Build the executor call for a step. The executor table is read-only
    /// and checked at submit, so a missing binding only surfaces as a failed
    /// attempt.
    fn dispatch_for(&self, workflow: &Workflow, idx: usize) -> std::result::Result<Dispatch, AttemptResult> {
        let step = &workflow.steps()[idx];
        let timeout = self.config.step_timeout(step.timeout_ms);
        let attempt = step.retry_count + 1;

        let Some(executor) = self.executors.get(&step.executor) else {
            return Err(AttemptResult {
                index: idx,
                step_id: step.id.clone(),
                attempt,
                outcome: Err(format!("executor '{}' is not registered", step.executor)),
                duration: Duration::ZERO,
            });
        };

        Ok(Dispatch {
            index: idx,
            executor,
            request: TaskRequest {
                workflow_id: workflow.id(),
                step_id: step.id.clone(),
                task_kind: step.task_kind.clone(),
                input: workflow.assemble_input(idx),
                attempt,
                priority: step.priority,
                deadline: Some(Instant::now() + timeout),
            },
            timeout,
        })
    }

    /// Apply one attempt's result. `Err` carries a permanent step failure.
    fn apply_result(
        &self,
        workflow: &mut Workflow,
        result: AttemptResult,
    ) -> std::result::Result<(), (StepId, String)> {
        let AttemptResult {
            index,
            step_id,
            attempt,
            outcome,
            duration,
        } = result;

        let error = match outcome {
            Ok(outcome) => {
                let handoffs = workflow.steps()[index].handoffs.clone();
                let prepared: Vec<HandoffOutcome> = handoffs
                    .iter()
                    .map(|spec| self.handoffs.prepare(spec, &outcome.output))
                    .collect();

                let rejected: Vec<String> = handoffs
                    .iter()
                    .zip(&prepared)
                    .filter_map(|(spec, prepared)| match prepared {
                        HandoffOutcome::Rejected { failed_checks } => {
                            Some(format!("{} [{}]", spec.key(), failed_checks.join(", ")))
                        }
                        HandoffOutcome::Accepted(_) => None,
                    })
                    .collect();

                for (spec, prepared) in handoffs.iter().zip(prepared) {
                    match prepared {
                        HandoffOutcome::Accepted(payload)
                            if rejected.is_empty()
                                || self.config.handoff_policy == HandoffPolicy::FailOpen =>
                        {
                            workflow.store_handoff(spec, payload);
                        }
                        HandoffOutcome::Accepted(_) => {}
                        HandoffOutcome::Rejected { failed_checks } => {
                            tracing::warn!(
                                step_id = %step_id,
                                handoff = %spec.key(),
                                failed = ?failed_checks,
                                "handoff validation failed, payload dropped"
                            );
                            workflow.reject_handoff(spec, failed_checks);
                        }
                    }
                }

                if rejected.is_empty() || self.config.handoff_policy == HandoffPolicy::FailOpen {
                    let retry_count = workflow.steps()[index].retry_count;
                    let output = StepOutput {
                        output: outcome.output,
                        metadata: outcome.metadata,
                        attempts: attempt,
                        retry_count,
                        duration_ms: duration.as_millis() as u64,
                        completed_at: Utc::now(),
                    };
                    workflow.apply(index, StepUpdate::Completed { output });
                    tracing::info!(
                        step_id = %step_id,
                        attempt,
                        duration_ms = duration.as_millis() as u64,
                        "step completed"
                    );
                    return Ok(());
                }

                format!("handoff validation failed: {}", rejected.join("; "))
            }
            Err(error) => error,
        };

        match workflow.record_failure(index, error.clone()) {
            FailureDisposition::Retry => {
                tracing::warn!(step_id = %step_id, attempt, "step failed, will retry: {}", error);
                Ok(())
            }
            FailureDisposition::Permanent => {
                tracing::error!(step_id = %step_id, attempt, "step failed permanently: {}", error);
                Err((step_id, error))
            }
        }
    }

    fn abort(
        &self,
        mut workflow: Workflow,
        failed_step: Option<StepId>,
        error: WorkflowError,
    ) -> Result<WorkflowStatusReport> {
        tracing::error!(workflow_id = %workflow.id(), "workflow execution failed: {}", error);
        workflow.fail(failed_step, error.to_string());
        self.registry.archive(workflow);
        Err(error)
    }
}
