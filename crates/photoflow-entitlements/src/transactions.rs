//! Append-only ledger transaction log
//!
//! Every balance mutation is recorded as a [`LedgerTransaction`]. The log is
//! the merge unit for sync: local and remote sides exchange transactions and
//! converge by replaying the deduplicated union, never by overwriting balance
//! fields.

use serde::{Deserialize, Serialize};

use crate::ledger::CreditBalance;
use crate::types::{Credits, PurchaseId, Timestamp};

/// The kind of balance mutation a transaction records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransactionKind {
    /// Credits granted from a validated (or optimistically trusted) purchase
    PurchaseGrant {
        purchase_id: PurchaseId,
        amount: Credits,
    },
    /// Reversing debit applied when an optimistic grant fails validation
    CompensatingDebit {
        purchase_id: PurchaseId,
        amount: Credits,
    },
    /// Period renewal: reset the subscription allocation
    Renewal {
        allocation: Credits,
        /// Move unspent subscription credits into the carry-over bucket
        /// (cancelled-pending-expiry path) instead of forfeiting them
        carry_over: bool,
        /// Identity of the logical renewal event: `period:{millis}` and
        /// `expiry:{millis}` for boundary-driven renewals (same on every
        /// device replaying that boundary), `activate:{id}` / `revoke:{id}`
        /// for purchase-driven ones. Two renewals in the same instant stay
        /// distinct transactions.
        event: String,
    },
    /// Credits spent by a committed workflow step reservation
    StepSpend {
        reservation_id: String,
        amount: Credits,
    },
}

/// One entry in the append-only ledger log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Unique, deterministic id; replaying the same id twice is a no-op
    pub id: String,
    pub kind: TransactionKind,
    pub created_at: Timestamp,
}

impl LedgerTransaction {
    /// Create a transaction with the deterministic id for its kind.
    ///
    /// Ids are derived from the operation identity (purchase id, reservation
    /// id, renewal event) so the same logical event produced on two devices
    /// deduplicates during sync. The timestamp records when the event was
    /// applied and never feeds the id.
    pub fn new(kind: TransactionKind, created_at: Timestamp) -> Self {
        let id = match &kind {
            TransactionKind::PurchaseGrant { purchase_id, .. } => {
                format!("grant:{purchase_id}")
            }
            TransactionKind::CompensatingDebit { purchase_id, .. } => {
                format!("debit:{purchase_id}")
            }
            TransactionKind::Renewal { event, .. } => {
                format!("renewal:{event}")
            }
            TransactionKind::StepSpend { reservation_id, .. } => {
                format!("spend:{reservation_id}")
            }
        };
        LedgerTransaction {
            id,
            kind,
            created_at,
        }
    }
}

/// Outcome of replaying a transaction set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub balance: CreditBalance,
    /// Debits that could not be applied without a negative balance
    pub reconciliation_debt: Credits,
}

/// Rebuild a balance by replaying transactions in deterministic order.
///
/// The input may arrive in any order; entries are sorted by `(created_at, id)`
/// before application, so replaying the same set always yields the same
/// balance regardless of how the set was assembled.
pub fn replay(transactions: &[LedgerTransaction]) -> ReplayOutcome {
    let mut ordered: Vec<&LedgerTransaction> = transactions.iter().collect();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut balance = CreditBalance::default();
    let mut debt: Credits = 0;
    for tx in ordered {
        debt = debt.saturating_add(balance.apply(&tx.kind, &tx.created_at));
    }
    ReplayOutcome {
        balance,
        reconciliation_debt: debt,
    }
}
