//! # PhotoFlow Workflow
//!
//! Multi-step AI-processing pipelines gated by the entitlement ledger.
//!
//! A [`WorkflowConfig`] is a validated, ordered list of processing steps.
//! The [`WorkflowExecutor`] runs them one at a time against an
//! [`ImageProcessor`], reserving credits before each external call and
//! committing them only on success. Execution state is serializable so an
//! interrupted pipeline can be persisted and resumed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use photoflow_entitlements::CreditLedger;
//! use photoflow_workflow::{
//!     ImageProcessor, ProcessingMode, WorkflowConfig, WorkflowExecutor, WorkflowStep,
//! };
//!
//! # async fn run(processor: Arc<dyn ImageProcessor>) -> photoflow_workflow::Result<()> {
//! let ledger = Arc::new(CreditLedger::new());
//! let config = WorkflowConfig::new(
//!     "restore",
//!     vec![
//!         WorkflowStep::new("colorize", ProcessingMode::Colorize, 2),
//!         WorkflowStep::new("enhance", ProcessingMode::Enhance { strength: 60 }, 2),
//!     ],
//! )?;
//! let mut executor = WorkflowExecutor::new(config, "photo.raw".into(), ledger, processor);
//! let status = executor.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod processor;
pub mod step;

pub use error::{Result, WorkflowError};
pub use executor::{CancelHandle, ExecutorConfig, WorkflowExecutor};
pub use processor::ImageProcessor;
pub use step::{
    ArtifactRef, ProcessingMode, UpscaleFactor, WorkflowConfig, WorkflowExecution, WorkflowStatus,
    WorkflowStep, WorkflowStepResult,
};
