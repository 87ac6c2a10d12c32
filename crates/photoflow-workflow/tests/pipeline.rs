//! End-to-end pipeline behavior: credit gating, retry, partial save, and
//! crash recovery.

use std::sync::Arc;

use photoflow_entitlements::{CreditLedger, EntitlementError, MemoryStore};
use photoflow_workflow::processor::testing::ScriptedProcessor;
use photoflow_workflow::{
    ProcessingMode, UpscaleFactor, WorkflowConfig, WorkflowError, WorkflowExecutor, WorkflowStatus,
    WorkflowStep,
};

fn three_step_config() -> WorkflowConfig {
    WorkflowConfig::new(
        "restore-and-upscale",
        vec![
            WorkflowStep::new("colorize", ProcessingMode::Colorize, 2),
            WorkflowStep::new("enhance", ProcessingMode::Enhance { strength: 70 }, 2),
            WorkflowStep::new(
                "upscale",
                ProcessingMode::Upscale {
                    factor: UpscaleFactor::X2,
                },
                2,
            ),
        ],
    )
    .unwrap()
}

fn ledger_with(credits: u64) -> Arc<CreditLedger> {
    let ledger = Arc::new(CreditLedger::new());
    ledger.grant_purchased_credits(credits, "seed").unwrap();
    ledger
}

/// Five credits cannot fund three 2-credit steps. The pipeline must charge
/// only for successful work, keep a failed step retryable at no cost, halt
/// the unfunded third step before the processor sees it, and still hand
/// back the partial result.
#[tokio::test]
async fn test_underfunded_pipeline_charges_only_successful_steps() {
    let ledger = ledger_with(5);
    let processor = Arc::new(ScriptedProcessor::new());
    let mut executor = WorkflowExecutor::new(
        three_step_config(),
        "scan.tiff".into(),
        Arc::clone(&ledger),
        processor.clone(),
    );

    // Step 1 succeeds and commits its 2 credits; step 2 fails
    processor.fail_on_call(2);
    let status = executor.run().await.unwrap();
    assert_eq!(status, WorkflowStatus::StepFailed);
    assert_eq!(ledger.snapshot().credits_remaining(), 3);
    assert_eq!(ledger.stats().earmarked, 0);
    assert_eq!(processor.calls(), 2);

    // Retry the failed step; it now succeeds and commits
    assert_eq!(
        executor.retry_step().await.unwrap(),
        WorkflowStatus::Running
    );
    assert_eq!(ledger.snapshot().credits_remaining(), 1);
    assert_eq!(processor.calls(), 3);

    // One credit cannot fund the third step; the ledger refuses before the
    // processor is invoked
    let err = executor.run().await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Entitlement(EntitlementError::InsufficientCredits {
            required: 2,
            available: 1,
        })
    ));
    assert_eq!(processor.calls(), 3);
    assert_eq!(ledger.snapshot().credits_remaining(), 1);

    // The two completed results survive as a partial artifact
    let output = executor.save_partial().unwrap();
    assert_eq!(output, Some("scan.tiff|colorize|enhance".to_string()));
    assert_eq!(executor.execution().status, WorkflowStatus::Abandoned);
    let successes = executor
        .execution()
        .step_results
        .iter()
        .filter(|r| r.success)
        .count();
    assert_eq!(successes, 2);
}

#[tokio::test]
async fn test_fully_funded_pipeline_completes() {
    let ledger = ledger_with(6);
    let processor = Arc::new(ScriptedProcessor::new());
    let mut executor = WorkflowExecutor::new(
        three_step_config(),
        "scan.tiff".into(),
        Arc::clone(&ledger),
        processor.clone(),
    );

    assert_eq!(executor.run().await.unwrap(), WorkflowStatus::Complete);
    assert_eq!(ledger.snapshot().credits_remaining(), 0);
    assert_eq!(
        executor.execution().last_output(),
        Some(&"scan.tiff|colorize|enhance|upscale".to_string())
    );
}

#[tokio::test]
async fn test_cancellation_preserves_committed_spend_only() {
    let ledger = ledger_with(6);
    let processor = Arc::new(ScriptedProcessor::new());
    let mut executor = WorkflowExecutor::new(
        three_step_config(),
        "scan.tiff".into(),
        Arc::clone(&ledger),
        processor.clone(),
    );
    let handle = executor.cancel_handle();

    // Fail step 2 so control returns to us with one step committed
    processor.fail_on_call(2);
    assert_eq!(executor.run().await.unwrap(), WorkflowStatus::StepFailed);
    assert_eq!(ledger.snapshot().credits_remaining(), 4);

    handle.cancel();
    executor.abort().unwrap();
    assert_eq!(executor.execution().status, WorkflowStatus::Aborted);
    // Step 1's committed spend stands; the failed step never charged
    assert_eq!(ledger.snapshot().credits_remaining(), 4);
    assert_eq!(ledger.stats().earmarked, 0);
}

#[tokio::test]
async fn test_persisted_execution_resumes_after_restart() {
    let ledger = ledger_with(6);
    let processor = Arc::new(ScriptedProcessor::new());
    let store = MemoryStore::new();
    let config = three_step_config();

    let mut executor = WorkflowExecutor::new(
        config.clone(),
        "scan.tiff".into(),
        Arc::clone(&ledger),
        processor.clone(),
    );
    processor.fail_on_call(2);
    executor.run().await.unwrap();
    executor.retry_step().await.unwrap();
    executor.persist(&store).await.unwrap();
    assert_eq!(ledger.snapshot().credits_remaining(), 2);

    // App restart: reload the execution and finish the remaining step
    let execution = WorkflowExecutor::load_execution(&store)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.current_step_index, 2);
    let mut revived = WorkflowExecutor::resume(
        execution,
        config,
        "scan.tiff".into(),
        Arc::clone(&ledger),
        processor,
    )
    .unwrap();
    assert_eq!(revived.run().await.unwrap(), WorkflowStatus::Complete);
    assert_eq!(ledger.snapshot().credits_remaining(), 0);
    assert_eq!(
        revived.execution().last_output(),
        Some(&"scan.tiff|colorize|enhance|upscale".to_string())
    );
}
