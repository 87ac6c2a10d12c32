//! Error types for the entitlement system

use thiserror::Error;

use crate::types::Credits;

/// Result type for entitlement operations
pub type Result<T> = std::result::Result<T, EntitlementError>;

/// Entitlement system errors
#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: Credits, available: Credits },

    #[error("receipt validation failed for {product_id}: {reason}")]
    ReceiptValidationFailed { product_id: String, reason: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("purchase record not found: {0}")]
    PurchaseNotFound(String),

    #[error("unknown product: {0}")]
    UnknownProduct(String),

    #[error("no active subscription")]
    NoActiveSubscription,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EntitlementError {
    /// Whether the operation may be retried after a backoff.
    ///
    /// Only transport failures are retryable; precondition failures such as
    /// `InsufficientCredits` are final until the balance changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EntitlementError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EntitlementError::InsufficientCredits {
            required: 2,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient credits: required 2, available 1"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EntitlementError::Network("timeout".into()).is_retryable());
        assert!(!EntitlementError::InsufficientCredits {
            required: 1,
            available: 0
        }
        .is_retryable());
        // A rejected receipt is final; retrying won't change the verdict
        assert!(!EntitlementError::ReceiptValidationFailed {
            product_id: "photoflow.pack.small".into(),
            reason: "receipt reused".into()
        }
        .is_retryable());
    }
}
