//! Subscription state machine
//!
//! Owns tier, billing period, cancellation, and expiry, and drives ledger
//! renewal events. The ledger never calls back into this module.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{EntitlementError, Result};
use crate::ledger::CreditLedger;
use crate::types::{generate_id, Credits, Timestamp};

/// Entitlement tier determining the periodic credit allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Premium,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Free
    }
}

impl Tier {
    /// Credit allocation for one billing period
    pub fn period_allocation(&self, period: BillingPeriod) -> Credits {
        match (self, period) {
            (Tier::Free, _) => 0,
            (Tier::Basic, BillingPeriod::Weekly) => 15,
            (Tier::Basic, BillingPeriod::Monthly) => 50,
            (Tier::Basic, BillingPeriod::Quarterly) => 150,
            (Tier::Pro, BillingPeriod::Weekly) => 40,
            (Tier::Pro, BillingPeriod::Monthly) => 150,
            (Tier::Pro, BillingPeriod::Quarterly) => 450,
            (Tier::Premium, BillingPeriod::Weekly) => 110,
            (Tier::Premium, BillingPeriod::Monthly) => 400,
            (Tier::Premium, BillingPeriod::Quarterly) => 1200,
        }
    }
}

/// Billing period length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Weekly,
    Monthly,
    Quarterly,
}

impl BillingPeriod {
    pub fn days(&self) -> i64 {
        match self {
            BillingPeriod::Weekly => 7,
            BillingPeriod::Monthly => 30,
            BillingPeriod::Quarterly => 90,
        }
    }

    fn millis(&self) -> i64 {
        self.days() * 24 * 3600 * 1000
    }
}

/// Subscription lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SubscriptionState {
    /// No subscription (initial, or after expiry)
    Free,
    /// Paid subscription renewing each period
    Active {
        tier: Tier,
        billing_period: BillingPeriod,
        started_at: Timestamp,
        period_end: Timestamp,
    },
    /// Cancelled but paid through `end_date`; credits remain spendable and
    /// no further renewal occurs
    CancelledPendingExpiry {
        tier: Tier,
        billing_period: BillingPeriod,
        end_date: Timestamp,
    },
}

impl Default for SubscriptionState {
    fn default() -> Self {
        SubscriptionState::Free
    }
}

impl SubscriptionState {
    /// Tier whose privileges currently apply
    pub fn tier(&self) -> Tier {
        match self {
            SubscriptionState::Free => Tier::Free,
            SubscriptionState::Active { tier, .. }
            | SubscriptionState::CancelledPendingExpiry { tier, .. } => *tier,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubscriptionState::CancelledPendingExpiry { .. })
    }
}

/// Drives subscription transitions and the resulting ledger renewals
pub struct SubscriptionStateMachine {
    ledger: Arc<CreditLedger>,
    state: RwLock<SubscriptionState>,
}

impl SubscriptionStateMachine {
    pub fn new(ledger: Arc<CreditLedger>) -> Self {
        Self::from_state(SubscriptionState::Free, ledger)
    }

    /// Restore from a persisted state
    pub fn from_state(state: SubscriptionState, ledger: Arc<CreditLedger>) -> Self {
        SubscriptionStateMachine {
            ledger,
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.read().clone()
    }

    /// Activate a tier from a successful purchase (initial subscribe,
    /// resubscribe after expiry, or plan change).
    ///
    /// The new period's allocation replaces whatever subscription credits
    /// were left; it never sums with stale leftovers.
    pub fn activate(&self, tier: Tier, billing_period: BillingPeriod, now: Timestamp) -> Result<()> {
        let period_end = Timestamp::from_unix_millis(now.unix_millis() + billing_period.millis());
        let event = format!("activate:{}", generate_id());
        self.ledger
            .apply_renewal(tier.period_allocation(billing_period), false, &event)?;
        *self.state.write() = SubscriptionState::Active {
            tier,
            billing_period,
            started_at: now,
            period_end,
        };
        tracing::info!(?tier, ?billing_period, "subscription activated");
        Ok(())
    }

    /// Cancel the subscription.
    ///
    /// Credits and tier privileges are untouched; only future renewal stops.
    /// Errors with [`EntitlementError::NoActiveSubscription`] unless
    /// currently active.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.state.write();
        let SubscriptionState::Active {
            tier,
            billing_period,
            period_end,
            ..
        } = &*state
        else {
            return Err(EntitlementError::NoActiveSubscription);
        };
        tracing::info!(?tier, "subscription cancelled, paid through period end");
        *state = SubscriptionState::CancelledPendingExpiry {
            tier: *tier,
            billing_period: *billing_period,
            end_date: period_end.clone(),
        };
        Ok(())
    }

    /// Revoke an activation whose receipt failed validation.
    ///
    /// The compensating move for a subscription purchase: the unvalidated
    /// allocation is forfeited (no carry-over) and the state returns to
    /// `Free`. A no-op when already free.
    pub fn revoke(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state != SubscriptionState::Free {
            tracing::warn!("revoking unvalidated subscription activation");
            let event = format!("revoke:{}", generate_id());
            self.ledger.apply_renewal(0, false, &event)?;
            *state = SubscriptionState::Free;
        }
        Ok(())
    }

    /// Advance period boundaries that `now` has passed.
    ///
    /// Active subscriptions renew (fresh allocation, unspent credits
    /// forfeited); cancelled ones expire at `end_date` with their unspent
    /// credits carried over and no new allocation.
    pub fn on_clock_tick(&self, now: Timestamp) -> Result<()> {
        let mut state = self.state.write();
        loop {
            match &*state {
                SubscriptionState::Active {
                    tier,
                    billing_period,
                    started_at,
                    period_end,
                } if *period_end <= now => {
                    let allocation = tier.period_allocation(*billing_period);
                    // Keyed on the boundary so every device replaying this
                    // period derives the same transaction; stamped with
                    // application time by the ledger.
                    let event = format!("period:{}", period_end.unix_millis());
                    let next_end = Timestamp::from_unix_millis(
                        period_end.unix_millis() + billing_period.millis(),
                    );
                    self.ledger.apply_renewal(allocation, false, &event)?;
                    tracing::info!(?tier, allocation, "subscription renewed");
                    *state = SubscriptionState::Active {
                        tier: *tier,
                        billing_period: *billing_period,
                        started_at: started_at.clone(),
                        period_end: next_end,
                    };
                }
                SubscriptionState::CancelledPendingExpiry { tier, end_date, .. }
                    if *end_date <= now =>
                {
                    // Paid period truly over: carry unspent subscription
                    // credits into the carry-over bucket, allocate nothing.
                    let event = format!("expiry:{}", end_date.unix_millis());
                    self.ledger.apply_renewal(0, true, &event)?;
                    tracing::info!(?tier, "subscription expired");
                    *state = SubscriptionState::Free;
                }
                _ => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (Arc<CreditLedger>, SubscriptionStateMachine) {
        let ledger = Arc::new(CreditLedger::new());
        let machine = SubscriptionStateMachine::new(Arc::clone(&ledger));
        (ledger, machine)
    }

    fn ts(millis: i64) -> Timestamp {
        Timestamp::from_unix_millis(millis)
    }

    const DAY: i64 = 24 * 3600 * 1000;

    #[test]
    fn test_activate_allocates_credits() {
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Pro, BillingPeriod::Monthly, ts(0))
            .unwrap();

        assert_eq!(machine.state().tier(), Tier::Pro);
        assert_eq!(ledger.snapshot().credits_remaining(), 150);
    }

    #[test]
    fn test_renewal_resets_allocation() {
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Basic, BillingPeriod::Monthly, ts(0))
            .unwrap();
        let r = ledger.reserve(10).unwrap();
        ledger.commit(&r.id).unwrap();
        assert_eq!(ledger.snapshot().credits_remaining(), 40);

        machine.on_clock_tick(ts(31 * DAY)).unwrap();
        // Fresh 50, the 40 unspent forfeited
        assert_eq!(ledger.snapshot().credits_remaining(), 50);
        assert!(matches!(machine.state(), SubscriptionState::Active { .. }));
    }

    #[test]
    fn test_cancel_preserves_credits_and_blocks_renewal() {
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Basic, BillingPeriod::Monthly, ts(0))
            .unwrap();
        machine.cancel().unwrap();

        assert_eq!(ledger.snapshot().credits_remaining(), 50);
        assert!(machine.state().is_cancelled());
        // Tier privileges persist until expiry
        assert_eq!(machine.state().tier(), Tier::Basic);

        // Period boundary passes while cancelled: no new allocation,
        // unspent credits carried over
        machine.on_clock_tick(ts(31 * DAY)).unwrap();
        assert_eq!(machine.state(), SubscriptionState::Free);
        let balance = ledger.snapshot();
        assert_eq!(balance.subscription_credits, 0);
        assert_eq!(balance.unused_subscription_credits, 50);
        assert_eq!(balance.credits_remaining(), 50);
    }

    #[test]
    fn test_resubscribe_sets_not_sums() {
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Basic, BillingPeriod::Monthly, ts(0))
            .unwrap();
        machine.cancel().unwrap();
        machine.on_clock_tick(ts(31 * DAY)).unwrap();
        assert_eq!(ledger.snapshot().unused_subscription_credits, 50);

        machine
            .activate(Tier::Pro, BillingPeriod::Monthly, ts(40 * DAY))
            .unwrap();
        let balance = ledger.snapshot();
        // New allocation replaces subscription credits; earlier carry-over
        // remains its own bucket
        assert_eq!(balance.subscription_credits, 150);
        assert_eq!(balance.unused_subscription_credits, 50);
        assert_eq!(balance.credits_remaining(), 200);
    }

    #[test]
    fn test_immediate_revoke_forfeits_allocation() {
        // Activation and revocation can land within the same instant (e.g.
        // the receipt is rejected right after the optimistic activation);
        // the revoke must still take effect.
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Pro, BillingPeriod::Monthly, ts(1000))
            .unwrap();
        machine.revoke().unwrap();

        assert_eq!(machine.state(), SubscriptionState::Free);
        assert_eq!(ledger.snapshot().credits_remaining(), 0);
        // Both the activation and the revocation are in the log
        assert_eq!(ledger.transactions().len(), 2);
    }

    #[test]
    fn test_cancel_without_active_subscription_errors() {
        let (_, machine) = machine();
        assert!(matches!(
            machine.cancel().unwrap_err(),
            EntitlementError::NoActiveSubscription
        ));

        machine
            .activate(Tier::Basic, BillingPeriod::Monthly, ts(0))
            .unwrap();
        machine.cancel().unwrap();
        // Already cancelled: nothing active left to cancel
        assert!(matches!(
            machine.cancel().unwrap_err(),
            EntitlementError::NoActiveSubscription
        ));
    }

    #[test]
    fn test_catch_up_replay_matches_live_balance() {
        // Spend before the tick, then catch up a missed boundary: rebuilding
        // from the log must land on the same balance the live ledger holds.
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Basic, BillingPeriod::Monthly, ts(0))
            .unwrap();
        let r = ledger.reserve(5).unwrap();
        ledger.commit(&r.id).unwrap();
        machine.on_clock_tick(ts(31 * DAY)).unwrap();
        assert_eq!(ledger.snapshot().credits_remaining(), 50);

        let rebuilt = CreditLedger::from_transactions(ledger.transactions());
        assert_eq!(rebuilt.snapshot(), ledger.snapshot());
    }

    #[test]
    fn test_missed_boundaries_catch_up() {
        let (ledger, machine) = machine();
        machine
            .activate(Tier::Basic, BillingPeriod::Weekly, ts(0))
            .unwrap();

        // Device offline across three boundaries
        machine.on_clock_tick(ts(22 * DAY)).unwrap();
        match machine.state() {
            SubscriptionState::Active { period_end, .. } => {
                assert_eq!(period_end, ts(28 * DAY));
            }
            other => panic!("unexpected state: {other:?}"),
        }
        // Each boundary reset the allocation; only the latest survives
        assert_eq!(ledger.snapshot().credits_remaining(), 15);
    }
}
