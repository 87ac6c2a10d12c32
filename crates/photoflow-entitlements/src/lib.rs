//! # PhotoFlow Entitlements
//!
//! Credit ledger, subscription state machine, and purchase reconciliation
//! for the PhotoFlow editing client.
//!
//! ## Features
//!
//! - **Credit Ledger**: authoritative local balance with atomic
//!   reserve/commit/release primitives
//! - **Subscriptions**: tiered allocation with renewal, cancellation, and
//!   carry-over semantics
//! - **Purchases**: write-ahead records, optimistic grants, compensating
//!   debits on failed receipt validation
//! - **Sync**: additive transaction-replay reconciliation with the backend;
//!   the local ledger stays authoritative while offline
//!
//! ## Example
//!
//! ```rust
//! use photoflow_entitlements::CreditLedger;
//!
//! let ledger = CreditLedger::new();
//! ledger.grant_purchased_credits(10, "purchase_1").unwrap();
//!
//! let reservation = ledger.reserve(2).unwrap();
//! ledger.commit(&reservation.id).unwrap();
//! assert_eq!(ledger.snapshot().credits_remaining(), 8);
//! ```

pub mod engine;
pub mod error;
pub mod ledger;
pub mod purchase;
pub mod storage;
pub mod subscription;
pub mod sync;
pub mod transactions;
pub mod types;

pub use engine::{
    CreditPackProduct, EngineConfig, EntitlementEngine, PurchaseStore, StoreReceipt,
    SubscriptionProduct,
};
pub use error::{EntitlementError, Result};
pub use ledger::{CreditBalance, CreditLedger, LedgerStats, MergeOutcome, Reservation};
pub use purchase::{PurchaseRecord, PurchaseRecorder, PurchaseType, ValidationState};
pub use storage::{load_value, store_value, MemoryStore, StateStore};
pub use subscription::{
    BillingPeriod, SubscriptionState, SubscriptionStateMachine, Tier,
};
pub use sync::{BackendClient, LedgerSyncAgent, ReceiptVerdict, SyncConfig, SyncReport};
pub use transactions::{LedgerTransaction, TransactionKind};
pub use types::{generate_id, Credits, Platform, ProductId, PurchaseId, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
