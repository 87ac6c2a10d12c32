//! Credit ledger: the authoritative local balance
//!
//! The ledger owns the [`CreditBalance`] and the reservation table. Every
//! mutating operation runs inside a single mutex so a foreground purchase
//! grant, a background sync merge, and an in-flight workflow reservation can
//! never double-count earmarks or spend.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EntitlementError, Result};
use crate::transactions::{replay, LedgerTransaction, TransactionKind};
use crate::types::{generate_id, Credits, PurchaseId, Timestamp};

/// Credit balance, split by origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// Credits allocated by the subscription for the current period
    pub subscription_credits: Credits,
    /// Subscription credits consumed this period
    pub subscription_credits_used: Credits,
    /// Purchased credits; never expire and are never forfeited
    pub purchased_credits: Credits,
    /// Subscription credits carried past a cancellation until the paid
    /// period truly ends
    pub unused_subscription_credits: Credits,
    /// When the subscription allocation was last reset
    pub last_renewal: Option<Timestamp>,
}

impl CreditBalance {
    /// Spendable credits across all buckets.
    ///
    /// Open reservations are not part of this figure; they only earmark
    /// against further reservations.
    pub fn credits_remaining(&self) -> Credits {
        self.subscription_credits
            .saturating_sub(self.subscription_credits_used)
            .saturating_add(self.unused_subscription_credits)
            .saturating_add(self.purchased_credits)
    }

    /// Apply one transaction to the balance, returning any debit shortfall
    /// that could not be taken without driving the balance negative.
    pub(crate) fn apply(&mut self, kind: &TransactionKind, at: &Timestamp) -> Credits {
        match kind {
            TransactionKind::PurchaseGrant { amount, .. } => {
                self.purchased_credits = self.purchased_credits.saturating_add(*amount);
                0
            }
            TransactionKind::CompensatingDebit { amount, .. } => {
                // A reversed grant only ever claws back purchased credits;
                // anything already spent becomes reconciliation debt.
                let taken = (*amount).min(self.purchased_credits);
                self.purchased_credits -= taken;
                *amount - taken
            }
            TransactionKind::Renewal {
                allocation,
                carry_over,
                ..
            } => {
                if *carry_over {
                    let unspent = self
                        .subscription_credits
                        .saturating_sub(self.subscription_credits_used);
                    self.unused_subscription_credits =
                        self.unused_subscription_credits.saturating_add(unspent);
                }
                self.subscription_credits = *allocation;
                self.subscription_credits_used = 0;
                self.last_renewal = Some(at.clone());
                0
            }
            TransactionKind::StepSpend { amount, .. } => self.spend(*amount),
        }
    }

    /// Deduct credits in priority order: expiring subscription credits first,
    /// then carry-over, then purchased. Returns the unspendable remainder.
    fn spend(&mut self, amount: Credits) -> Credits {
        let mut left = amount;

        let from_subscription = left.min(
            self.subscription_credits
                .saturating_sub(self.subscription_credits_used),
        );
        self.subscription_credits_used += from_subscription;
        left -= from_subscription;

        let from_carry_over = left.min(self.unused_subscription_credits);
        self.unused_subscription_credits -= from_carry_over;
        left -= from_carry_over;

        let from_purchased = left.min(self.purchased_credits);
        self.purchased_credits -= from_purchased;
        left -= from_purchased;

        left
    }
}

/// Ephemeral earmark held between `reserve` and `commit`/`release`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub amount: Credits,
    pub created_at: Timestamp,
}

/// Ledger statistics for diagnostics and support tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub credits_remaining: Credits,
    pub earmarked: Credits,
    pub open_reservations: usize,
    pub transactions: usize,
    /// Known but not yet recovered negative adjustments (never forced onto
    /// the user balance)
    pub reconciliation_debt: Credits,
}

/// Outcome of merging a remote transaction set into the ledger
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Remote transactions the local ledger had not seen
    pub applied_remote: usize,
    /// Local transactions the remote set was missing, for upload
    pub local_only: Vec<LedgerTransaction>,
    pub balance_after: Credits,
}

struct LedgerInner {
    balance: CreditBalance,
    reservations: HashMap<String, Reservation>,
    earmarked: Credits,
    granted_purchases: HashSet<PurchaseId>,
    applied: HashSet<String>,
    log: Vec<LedgerTransaction>,
    /// Latest stamp in the log; new entries are clamped strictly past it so
    /// the canonical `(created_at, id)` replay order always matches the
    /// order transactions were applied live
    latest: Option<Timestamp>,
    reconciliation_debt: Credits,
}

impl LedgerInner {
    /// Apply and record a transaction; no-op if its id was already applied.
    fn record(&mut self, kind: TransactionKind, mut at: Timestamp) -> bool {
        if let Some(latest) = &self.latest {
            if at <= *latest {
                at = latest.just_after();
            }
        }
        let tx = LedgerTransaction::new(kind, at);
        if !self.applied.insert(tx.id.clone()) {
            return false;
        }
        self.latest = Some(tx.created_at.clone());
        let debt = self.balance.apply(&tx.kind, &tx.created_at);
        if debt > 0 {
            self.reconciliation_debt = self.reconciliation_debt.saturating_add(debt);
            tracing::warn!(
                tx = %tx.id,
                shortfall = debt,
                total_debt = self.reconciliation_debt,
                "debit exceeded balance; recording reconciliation debt"
            );
        }
        if let TransactionKind::PurchaseGrant { purchase_id, .. } = &tx.kind {
            self.granted_purchases.insert(purchase_id.clone());
        }
        self.log.push(tx);
        true
    }
}

/// Thread-safe credit ledger with reserve/commit/release primitives
pub struct CreditLedger {
    inner: Mutex<LedgerInner>,
}

impl CreditLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::from_transactions(Vec::new())
    }

    /// Rebuild a ledger from a persisted transaction log
    pub fn from_transactions(log: Vec<LedgerTransaction>) -> Self {
        let outcome = replay(&log);
        let applied: HashSet<String> = log.iter().map(|tx| tx.id.clone()).collect();
        let granted_purchases = log
            .iter()
            .filter_map(|tx| match &tx.kind {
                TransactionKind::PurchaseGrant { purchase_id, .. } => Some(purchase_id.clone()),
                _ => None,
            })
            .collect();
        let latest = log.iter().map(|tx| tx.created_at.clone()).max();
        CreditLedger {
            inner: Mutex::new(LedgerInner {
                balance: outcome.balance,
                reservations: HashMap::new(),
                earmarked: 0,
                granted_purchases,
                applied,
                log,
                latest,
                reconciliation_debt: outcome.reconciliation_debt,
            }),
        }
    }

    /// Earmark `amount` credits for an in-flight workflow step.
    ///
    /// Fails with [`EntitlementError::InsufficientCredits`] before any side
    /// effect if the unearmarked balance cannot cover the amount. Atomic with
    /// respect to concurrent reservations: two reserves can never jointly
    /// earmark more than the remaining balance.
    pub fn reserve(&self, amount: Credits) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        let available = inner
            .balance
            .credits_remaining()
            .saturating_sub(inner.earmarked);
        if available < amount {
            return Err(EntitlementError::InsufficientCredits {
                required: amount,
                available,
            });
        }
        let reservation = Reservation {
            id: generate_id(),
            amount,
            created_at: Timestamp::now(),
        };
        inner.earmarked += amount;
        inner
            .reservations
            .insert(reservation.id.clone(), reservation.clone());
        tracing::debug!(reservation = %reservation.id, amount, "reserved credits");
        Ok(reservation)
    }

    /// Spend a reservation. Idempotent: committing an unknown or already
    /// settled id has no further effect.
    pub fn commit(&self, reservation_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(reservation) = inner.reservations.remove(reservation_id) else {
            return Ok(());
        };
        inner.earmarked = inner.earmarked.saturating_sub(reservation.amount);
        inner.record(
            TransactionKind::StepSpend {
                reservation_id: reservation.id.clone(),
                amount: reservation.amount,
            },
            Timestamp::now(),
        );
        tracing::debug!(reservation = %reservation.id, amount = reservation.amount, "committed reservation");
        Ok(())
    }

    /// Return an earmark to availability without touching the balance.
    /// Idempotent.
    pub fn release(&self, reservation_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(reservation) = inner.reservations.remove(reservation_id) {
            inner.earmarked = inner.earmarked.saturating_sub(reservation.amount);
            tracing::debug!(reservation = %reservation.id, amount = reservation.amount, "released reservation");
        }
        Ok(())
    }

    /// Grant purchased credits. Idempotent per purchase id: replaying the
    /// same purchase (e.g. during a restore) never double-grants.
    ///
    /// Returns `true` if the grant was newly applied.
    pub fn grant_purchased_credits(&self, amount: Credits, purchase_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.granted_purchases.contains(purchase_id) {
            tracing::debug!(purchase = purchase_id, "grant replayed; ignoring");
            return Ok(false);
        }
        inner.record(
            TransactionKind::PurchaseGrant {
                purchase_id: purchase_id.to_string(),
                amount,
            },
            Timestamp::now(),
        );
        tracing::info!(purchase = purchase_id, amount, "granted purchased credits");
        Ok(true)
    }

    /// Reset the subscription allocation for a new period.
    ///
    /// With `carry_over` set (cancelled-pending-expiry path) unspent
    /// subscription credits move into the carry-over bucket; otherwise they
    /// are forfeited. Purchased credits are untouched either way.
    ///
    /// `event` is the renewal's logical identity (dedup key across devices);
    /// the transaction itself is stamped with the application time so the
    /// log replays in the order the ledger actually moved.
    pub fn apply_renewal(&self, allocation: Credits, carry_over: bool, event: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let applied = inner.record(
            TransactionKind::Renewal {
                allocation,
                carry_over,
                event: event.to_string(),
            },
            Timestamp::now(),
        );
        if applied {
            tracing::info!(allocation, carry_over, event, "applied renewal");
        }
        Ok(())
    }

    /// Apply the reversing debit for an invalidated purchase grant.
    ///
    /// The original grant transaction is never mutated; the debit is a new
    /// log entry. Any portion the user already spent is surfaced as
    /// reconciliation debt instead of a negative balance.
    pub fn apply_compensating_debit(&self, amount: Credits, purchase_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let applied = inner.record(
            TransactionKind::CompensatingDebit {
                purchase_id: purchase_id.to_string(),
                amount,
            },
            Timestamp::now(),
        );
        if applied {
            tracing::warn!(purchase = purchase_id, amount, "applied compensating debit");
        }
        Ok(())
    }

    /// Merge a remote transaction set.
    ///
    /// The union of local and remote logs (deduplicated by id) is replayed in
    /// deterministic order and the rebuilt balance replaces the local one.
    /// Open reservations are untouched; a merge that undercuts an open
    /// earmark settles as reconciliation debt when that reservation commits.
    pub fn merge_remote(&self, remote: Vec<LedgerTransaction>) -> MergeOutcome {
        let mut inner = self.inner.lock();

        let remote_ids: HashSet<&str> = remote.iter().map(|tx| tx.id.as_str()).collect();
        let local_only: Vec<LedgerTransaction> = inner
            .log
            .iter()
            .filter(|tx| !remote_ids.contains(tx.id.as_str()))
            .cloned()
            .collect();

        let mut applied_remote = 0;
        for tx in remote {
            if inner.applied.insert(tx.id.clone()) {
                if let TransactionKind::PurchaseGrant { purchase_id, .. } = &tx.kind {
                    inner.granted_purchases.insert(purchase_id.clone());
                }
                if inner.latest.as_ref() < Some(&tx.created_at) {
                    inner.latest = Some(tx.created_at.clone());
                }
                inner.log.push(tx);
                applied_remote += 1;
            }
        }

        let outcome = replay(&inner.log);
        inner.balance = outcome.balance;
        inner.reconciliation_debt = outcome.reconciliation_debt;

        tracing::info!(
            applied_remote,
            local_only = local_only.len(),
            balance = inner.balance.credits_remaining(),
            "merged remote transactions"
        );
        MergeOutcome {
            applied_remote,
            local_only,
            balance_after: inner.balance.credits_remaining(),
        }
    }

    /// Current balance snapshot
    pub fn snapshot(&self) -> CreditBalance {
        self.inner.lock().balance.clone()
    }

    /// Spendable credits not claimed by an open reservation
    pub fn available(&self) -> Credits {
        let inner = self.inner.lock();
        inner
            .balance
            .credits_remaining()
            .saturating_sub(inner.earmarked)
    }

    /// Copy of the full transaction log
    pub fn transactions(&self) -> Vec<LedgerTransaction> {
        self.inner.lock().log.clone()
    }

    /// Ledger statistics
    pub fn stats(&self) -> LedgerStats {
        let inner = self.inner.lock();
        LedgerStats {
            credits_remaining: inner.balance.credits_remaining(),
            earmarked: inner.earmarked,
            open_reservations: inner.reservations.len(),
            transactions: inner.log.len(),
            reconciliation_debt: inner.reconciliation_debt,
        }
    }
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new()
    }
}
