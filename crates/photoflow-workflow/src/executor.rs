//! Workflow executor
//!
//! Drives a configured pipeline one step at a time. Every step is gated by a
//! ledger reservation: credits are earmarked before the external call,
//! committed on success, and released on failure, so a failed step never
//! charges the user and an unfunded step never reaches the processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use photoflow_entitlements::storage::keys;
use photoflow_entitlements::{load_value, store_value, CreditLedger, StateStore};

use crate::error::{Result, WorkflowError};
use crate::processor::ImageProcessor;
use crate::step::{
    ArtifactRef, WorkflowConfig, WorkflowExecution, WorkflowStatus, WorkflowStepResult,
};

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on one external processing call; elapsing is a retryable
    /// failure, not a fatal ledger error
    pub step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            step_timeout: Duration::from_secs(120),
        }
    }
}

/// Cooperative cancellation flag, checked between steps only.
///
/// An in-flight external call is allowed to finish and its result is still
/// committed; no further steps start.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes one workflow pipeline against the ledger and the external
/// processing capability
pub struct WorkflowExecutor {
    config: WorkflowConfig,
    executor_config: ExecutorConfig,
    ledger: Arc<CreditLedger>,
    processor: Arc<dyn ImageProcessor>,
    execution: WorkflowExecution,
    input: ArtifactRef,
    cancel: CancelHandle,
}

impl WorkflowExecutor {
    /// Start a new execution of `config` on `input`
    pub fn new(
        config: WorkflowConfig,
        input: ArtifactRef,
        ledger: Arc<CreditLedger>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        Self::with_execution(WorkflowExecution::new(), config, input, ledger, processor)
    }

    /// Re-enter a persisted execution (crash or app-restart recovery)
    pub fn resume(
        execution: WorkflowExecution,
        config: WorkflowConfig,
        input: ArtifactRef,
        ledger: Arc<CreditLedger>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Result<Self> {
        if execution.current_step_index > config.steps.len() {
            return Err(WorkflowError::InvalidConfig(format!(
                "execution index {} beyond {} steps",
                execution.current_step_index,
                config.steps.len()
            )));
        }
        Ok(Self::with_execution(execution, config, input, ledger, processor))
    }

    fn with_execution(
        execution: WorkflowExecution,
        config: WorkflowConfig,
        input: ArtifactRef,
        ledger: Arc<CreditLedger>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        WorkflowExecutor {
            config,
            executor_config: ExecutorConfig::default(),
            ledger,
            processor,
            execution,
            input,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_executor_config(mut self, executor_config: ExecutorConfig) -> Self {
        self.executor_config = executor_config;
        self
    }

    /// Handle for requesting cancellation from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Run steps until the pipeline completes, a step fails, or
    /// cancellation is observed between steps.
    ///
    /// On a processing failure the status is `StepFailed` and the caller
    /// picks [`retry_step`](Self::retry_step),
    /// [`save_partial`](Self::save_partial), or [`abort`](Self::abort).
    /// `InsufficientCredits` is returned as an error, raised before the
    /// external capability is ever invoked for that step.
    pub async fn run(&mut self) -> Result<WorkflowStatus> {
        match self.execution.status {
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
            status => {
                return Err(WorkflowError::InvalidState {
                    action: "run",
                    status,
                })
            }
        }
        self.execution.status = WorkflowStatus::Running;

        while self.execution.current_step_index < self.config.steps.len() {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    workflow = %self.execution.workflow_id,
                    completed = self.execution.current_step_index,
                    "cancellation requested; stopping between steps"
                );
                self.execution.status = WorkflowStatus::Aborted;
                return Ok(WorkflowStatus::Aborted);
            }
            self.run_current_step().await?;
            if self.execution.status == WorkflowStatus::StepFailed {
                return Ok(WorkflowStatus::StepFailed);
            }
        }

        self.execution.status = WorkflowStatus::Complete;
        tracing::info!(
            workflow = %self.execution.workflow_id,
            steps = self.execution.step_results.len(),
            "workflow complete"
        );
        Ok(WorkflowStatus::Complete)
    }

    /// Re-run only the failed step; earlier results are retained.
    ///
    /// On success the workflow is `Running` again and [`run`](Self::run)
    /// continues with the remaining steps.
    pub async fn retry_step(&mut self) -> Result<WorkflowStatus> {
        if self.execution.status != WorkflowStatus::StepFailed {
            return Err(WorkflowError::InvalidState {
                action: "retry",
                status: self.execution.status,
            });
        }
        self.execution.status = WorkflowStatus::Running;
        self.execution.last_error = None;
        self.run_current_step().await?;
        Ok(self.execution.status)
    }

    /// Terminate after a failure, keeping the last successful output as the
    /// final artifact. Appends the abandoned step's failure result.
    pub fn save_partial(&mut self) -> Result<Option<ArtifactRef>> {
        if self.execution.status != WorkflowStatus::StepFailed {
            return Err(WorkflowError::InvalidState {
                action: "save partial",
                status: self.execution.status,
            });
        }
        self.record_abandoned_step();
        self.execution.status = WorkflowStatus::Abandoned;
        let output = self.execution.last_output().cloned();
        tracing::info!(
            workflow = %self.execution.workflow_id,
            has_output = output.is_some(),
            "workflow abandoned with partial result"
        );
        Ok(output)
    }

    /// Discard the remaining steps. Spend already committed for completed
    /// steps is not refunded.
    pub fn abort(&mut self) -> Result<()> {
        match self.execution.status {
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
            WorkflowStatus::StepFailed => self.record_abandoned_step(),
            status => {
                return Err(WorkflowError::InvalidState {
                    action: "abort",
                    status,
                })
            }
        }
        self.execution.status = WorkflowStatus::Aborted;
        tracing::info!(workflow = %self.execution.workflow_id, "workflow aborted");
        Ok(())
    }

    /// Persist the execution state for later [`resume`](Self::resume)
    pub async fn persist(&self, store: &dyn StateStore) -> Result<()> {
        store_value(store, keys::WORKFLOW_EXECUTION, &self.execution)
            .await
            .map_err(Into::into)
    }

    /// Load a previously persisted execution
    pub async fn load_execution(store: &dyn StateStore) -> Result<Option<WorkflowExecution>> {
        load_value(store, keys::WORKFLOW_EXECUTION)
            .await
            .map_err(Into::into)
    }

    async fn run_current_step(&mut self) -> Result<()> {
        let step = self.config.steps[self.execution.current_step_index].clone();

        // Reserve first: an unfunded step must never reach the processor
        let reservation = match self.ledger.reserve(step.estimated_cost) {
            Ok(reservation) => reservation,
            Err(err) => {
                tracing::warn!(
                    workflow = %self.execution.workflow_id,
                    step = %step.id,
                    %err,
                    "cannot fund step; halting before processing"
                );
                self.execution.status = WorkflowStatus::StepFailed;
                self.execution.last_error = Some(err.to_string());
                return Err(err.into());
            }
        };

        let input = self
            .execution
            .last_output()
            .cloned()
            .unwrap_or_else(|| self.input.clone());
        let started = Instant::now();
        let outcome = timeout(
            self.executor_config.step_timeout,
            self.processor.process(&input, &step.mode),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                self.ledger.commit(&reservation.id)?;
                self.execution.step_results.push(WorkflowStepResult {
                    step_id: step.id.clone(),
                    output_uri: Some(output),
                    success: true,
                    processing_time_ms: elapsed_ms,
                    error: None,
                });
                self.execution.current_step_index += 1;
                self.execution.last_error = None;
                tracing::info!(
                    workflow = %self.execution.workflow_id,
                    step = %step.id,
                    elapsed_ms,
                    "step complete"
                );
            }
            Ok(Err(err)) => {
                self.ledger.release(&reservation.id)?;
                tracing::warn!(
                    workflow = %self.execution.workflow_id,
                    step = %step.id,
                    %err,
                    "step failed; reservation released"
                );
                self.execution.status = WorkflowStatus::StepFailed;
                self.execution.last_error = Some(err.to_string());
            }
            Err(_) => {
                self.ledger.release(&reservation.id)?;
                let err = WorkflowError::Timeout;
                tracing::warn!(
                    workflow = %self.execution.workflow_id,
                    step = %step.id,
                    timeout_ms = self.executor_config.step_timeout.as_millis() as u64,
                    "step timed out; reservation released"
                );
                self.execution.status = WorkflowStatus::StepFailed;
                self.execution.last_error = Some(err.to_string());
            }
        }
        Ok(())
    }

    /// Append the failure row for the step being abandoned
    fn record_abandoned_step(&mut self) {
        let step = &self.config.steps[self.execution.current_step_index];
        self.execution.step_results.push(WorkflowStepResult {
            step_id: step.id.clone(),
            output_uri: None,
            success: false,
            processing_time_ms: 0,
            error: self.execution.last_error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::ScriptedProcessor;
    use crate::step::{ProcessingMode, WorkflowStep};
    use photoflow_entitlements::MemoryStore;

    fn pipeline(costs: &[u64]) -> WorkflowConfig {
        let steps = costs
            .iter()
            .enumerate()
            .map(|(i, cost)| {
                WorkflowStep::new(format!("step-{i}"), ProcessingMode::Colorize, *cost)
            })
            .collect();
        WorkflowConfig::new("test", steps).unwrap()
    }

    fn ledger_with(credits: u64) -> Arc<CreditLedger> {
        let ledger = Arc::new(CreditLedger::new());
        ledger.grant_purchased_credits(credits, "seed").unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_happy_path_chains_outputs() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        let mut executor = WorkflowExecutor::new(
            pipeline(&[2, 3]),
            "photo.raw".into(),
            Arc::clone(&ledger),
            processor.clone(),
        );

        let status = executor.run().await.unwrap();
        assert_eq!(status, WorkflowStatus::Complete);
        assert_eq!(ledger.snapshot().credits_remaining(), 5);
        assert_eq!(processor.calls(), 2);

        let execution = executor.execution();
        // Each step consumed the previous step's output
        assert_eq!(
            execution.last_output(),
            Some(&"photo.raw|colorize|colorize".to_string())
        );
        assert!(execution.step_results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_failed_step_releases_reservation() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        processor.fail_next(1);
        let mut executor = WorkflowExecutor::new(
            pipeline(&[4]),
            "in".into(),
            Arc::clone(&ledger),
            processor.clone(),
        );

        let status = executor.run().await.unwrap();
        assert_eq!(status, WorkflowStatus::StepFailed);
        // Credits are not spent for failed work
        assert_eq!(ledger.snapshot().credits_remaining(), 10);
        assert_eq!(ledger.stats().earmarked, 0);
        assert!(executor.execution().last_error.is_some());
    }

    #[tokio::test]
    async fn test_retry_then_continue() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        processor.fail_next(1);
        let mut executor = WorkflowExecutor::new(
            pipeline(&[2, 2]),
            "in".into(),
            Arc::clone(&ledger),
            processor.clone(),
        );

        assert_eq!(executor.run().await.unwrap(), WorkflowStatus::StepFailed);
        assert_eq!(executor.retry_step().await.unwrap(), WorkflowStatus::Running);
        assert_eq!(executor.run().await.unwrap(), WorkflowStatus::Complete);
        assert_eq!(ledger.snapshot().credits_remaining(), 6);
    }

    #[tokio::test]
    async fn test_timeout_is_step_failure() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        processor.delay(Duration::from_millis(50));
        let mut executor = WorkflowExecutor::new(
            pipeline(&[2]),
            "in".into(),
            Arc::clone(&ledger),
            processor.clone(),
        )
        .with_executor_config(ExecutorConfig {
            step_timeout: Duration::from_millis(5),
        });

        let status = executor.run().await.unwrap();
        assert_eq!(status, WorkflowStatus::StepFailed);
        assert_eq!(ledger.snapshot().credits_remaining(), 10);
        assert_eq!(ledger.stats().earmarked, 0);
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        processor.fail_next(1);
        let mut executor = WorkflowExecutor::new(
            pipeline(&[1, 1, 1]),
            "in".into(),
            Arc::clone(&ledger),
            processor.clone(),
        );

        // Fail step 0, then request cancel before retrying
        executor.run().await.unwrap();
        executor.cancel_handle().cancel();
        assert_eq!(executor.retry_step().await.unwrap(), WorkflowStatus::Running);
        // The retried step still committed; no further steps start
        assert_eq!(executor.run().await.unwrap(), WorkflowStatus::Aborted);
        assert_eq!(processor.calls(), 2);
        assert_eq!(ledger.snapshot().credits_remaining(), 9);
    }

    #[tokio::test]
    async fn test_abort_keeps_committed_spend() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        processor.fail_next(2);
        let mut executor = WorkflowExecutor::new(
            pipeline(&[3, 3]),
            "in".into(),
            Arc::clone(&ledger),
            processor.clone(),
        );

        executor.run().await.unwrap();
        executor.retry_step().await.unwrap();
        assert_eq!(executor.execution().status, WorkflowStatus::StepFailed);

        executor.abort().unwrap();
        assert_eq!(executor.execution().status, WorkflowStatus::Aborted);
        // Nothing committed, nothing charged
        assert_eq!(ledger.snapshot().credits_remaining(), 10);
        let failed: Vec<_> = executor
            .execution()
            .step_results
            .iter()
            .filter(|r| !r.success)
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_and_resume() {
        let ledger = ledger_with(10);
        let processor = Arc::new(ScriptedProcessor::new());
        processor.fail_next(1);
        let store = MemoryStore::new();

        let config = pipeline(&[2, 2]);
        let mut executor = WorkflowExecutor::new(
            config.clone(),
            "in".into(),
            Arc::clone(&ledger),
            processor.clone(),
        );
        executor.run().await.unwrap();
        executor.retry_step().await.unwrap();
        executor.persist(&store).await.unwrap();

        // Simulate app restart
        let execution = WorkflowExecutor::load_execution(&store).await.unwrap().unwrap();
        assert_eq!(execution.current_step_index, 1);
        let mut revived =
            WorkflowExecutor::resume(execution, config, "in".into(), ledger, processor).unwrap();
        assert_eq!(revived.run().await.unwrap(), WorkflowStatus::Complete);
    }
}
