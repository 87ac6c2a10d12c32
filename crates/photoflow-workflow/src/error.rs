//! Error types for workflow execution

use thiserror::Error;

use photoflow_entitlements::EntitlementError;

use crate::step::WorkflowStatus;

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Workflow execution errors
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Ledger-side failure; `InsufficientCredits` halts the pipeline before
    /// any external call
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    #[error("invalid workflow: {0}")]
    InvalidConfig(String),

    /// The external processing capability reported a failure for one step
    #[error("processing failed: {0}")]
    Processing(String),

    /// The external call exceeded its bounded timeout; retryable
    #[error("processing timed out")]
    Timeout,

    #[error("cannot {action} while workflow is {status:?}")]
    InvalidState {
        action: &'static str,
        status: WorkflowStatus,
    },
}

impl WorkflowError {
    /// Whether the failed step may be retried in place
    pub fn is_step_retryable(&self) -> bool {
        match self {
            WorkflowError::Processing(_) | WorkflowError::Timeout => true,
            WorkflowError::Entitlement(err) => err.is_retryable(),
            _ => false,
        }
    }
}
