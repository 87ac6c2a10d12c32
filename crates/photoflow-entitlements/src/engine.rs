//! Entitlement engine facade
//!
//! Ties the ledger, subscription state machine, purchase recorder, and sync
//! agent together behind one constructor-injected handle. No hidden global
//! state: every collaborator is passed in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{EntitlementError, Result};
use crate::ledger::{CreditBalance, CreditLedger, LedgerStats};
use crate::purchase::{PurchaseRecord, PurchaseRecorder, PurchaseType, ValidationState};
use crate::storage::{keys, load_value, store_value, StateStore};
use crate::subscription::{BillingPeriod, SubscriptionState, SubscriptionStateMachine, Tier};
use crate::sync::{BackendClient, LedgerSyncAgent, SyncConfig, SyncReport};
use crate::transactions::LedgerTransaction;
use crate::types::{Credits, Platform, ProductId, Timestamp};

/// Receipt returned by the in-app purchase store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub product_id: ProductId,
    /// Store-side transaction id; stable across restores
    pub transaction_id: String,
    pub receipt_data: String,
    pub platform: Platform,
}

/// In-app purchase store boundary
#[async_trait]
pub trait PurchaseStore: Send + Sync {
    fn platform(&self) -> Platform;

    async fn purchase(&self, product_id: &str) -> Result<StoreReceipt>;

    /// Receipts of all prior purchases on this store account
    async fn restore(&self) -> Result<Vec<StoreReceipt>>;
}

/// A purchasable credit pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPackProduct {
    pub product_id: ProductId,
    pub credits: Credits,
    pub price_cents: u64,
}

/// A purchasable subscription plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionProduct {
    pub product_id: ProductId,
    pub tier: Tier,
    pub billing_period: BillingPeriod,
    pub price_cents: u64,
}

/// Engine configuration: product catalog and timeouts
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub credit_packs: Vec<CreditPackProduct>,
    pub subscriptions: Vec<SubscriptionProduct>,
    pub request_timeout: Duration,
    pub sync: SyncConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            credit_packs: vec![
                CreditPackProduct {
                    product_id: "photoflow.pack.small".into(),
                    credits: 20,
                    price_cents: 299,
                },
                CreditPackProduct {
                    product_id: "photoflow.pack.medium".into(),
                    credits: 60,
                    price_cents: 699,
                },
                CreditPackProduct {
                    product_id: "photoflow.pack.large".into(),
                    credits: 150,
                    price_cents: 1499,
                },
            ],
            subscriptions: vec![
                SubscriptionProduct {
                    product_id: "photoflow.sub.basic.monthly".into(),
                    tier: Tier::Basic,
                    billing_period: BillingPeriod::Monthly,
                    price_cents: 499,
                },
                SubscriptionProduct {
                    product_id: "photoflow.sub.pro.monthly".into(),
                    tier: Tier::Pro,
                    billing_period: BillingPeriod::Monthly,
                    price_cents: 999,
                },
                SubscriptionProduct {
                    product_id: "photoflow.sub.pro.quarterly".into(),
                    tier: Tier::Pro,
                    billing_period: BillingPeriod::Quarterly,
                    price_cents: 2499,
                },
                SubscriptionProduct {
                    product_id: "photoflow.sub.premium.monthly".into(),
                    tier: Tier::Premium,
                    billing_period: BillingPeriod::Monthly,
                    price_cents: 1999,
                },
            ],
            request_timeout: Duration::from_secs(30),
            sync: SyncConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn credit_pack(&self, product_id: &str) -> Option<&CreditPackProduct> {
        self.credit_packs
            .iter()
            .find(|p| p.product_id == product_id)
    }

    pub fn subscription(&self, product_id: &str) -> Option<&SubscriptionProduct> {
        self.subscriptions
            .iter()
            .find(|p| p.product_id == product_id)
    }
}

/// Entitlement engine: the single handle the rest of the app talks to
pub struct EntitlementEngine {
    ledger: Arc<CreditLedger>,
    subscriptions: SubscriptionStateMachine,
    recorder: PurchaseRecorder,
    sync_agent: LedgerSyncAgent,
    purchase_store: Arc<dyn PurchaseStore>,
    store: Arc<dyn StateStore>,
    backend: Arc<dyn BackendClient>,
    config: EngineConfig,
}

impl EntitlementEngine {
    /// Create an engine with a fresh ledger
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        backend: Arc<dyn BackendClient>,
        purchase_store: Arc<dyn PurchaseStore>,
    ) -> Self {
        Self::with_ledger(CreditLedger::new(), SubscriptionState::Free, config, store, backend, purchase_store)
    }

    /// Restore an engine from persisted state
    pub async fn restore(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        backend: Arc<dyn BackendClient>,
        purchase_store: Arc<dyn PurchaseStore>,
    ) -> Result<Self> {
        let log: Vec<LedgerTransaction> = load_value(&*store, keys::TRANSACTION_LOG)
            .await?
            .unwrap_or_default();
        let state: SubscriptionState = load_value(&*store, keys::SUBSCRIPTION_STATE)
            .await?
            .unwrap_or_default();
        let engine = Self::with_ledger(
            CreditLedger::from_transactions(log),
            state,
            config,
            store,
            backend,
            purchase_store,
        );
        engine.recorder.load().await?;
        Ok(engine)
    }

    fn with_ledger(
        ledger: CreditLedger,
        state: SubscriptionState,
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        backend: Arc<dyn BackendClient>,
        purchase_store: Arc<dyn PurchaseStore>,
    ) -> Self {
        let ledger = Arc::new(ledger);
        let subscriptions = SubscriptionStateMachine::from_state(state, Arc::clone(&ledger));
        let recorder = PurchaseRecorder::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            Arc::clone(&backend),
            config.request_timeout,
        );
        let sync_agent = LedgerSyncAgent::with_config(
            Arc::clone(&ledger),
            Arc::clone(&backend),
            config.sync.clone(),
        );
        EntitlementEngine {
            ledger,
            subscriptions,
            recorder,
            sync_agent,
            purchase_store,
            store,
            backend,
            config,
        }
    }

    /// Persist ledger log and subscription state
    pub async fn persist(&self) -> Result<()> {
        store_value(&*self.store, keys::TRANSACTION_LOG, &self.ledger.transactions()).await?;
        store_value(&*self.store, keys::CREDIT_BALANCE, &self.ledger.snapshot()).await?;
        store_value(
            &*self.store,
            keys::SUBSCRIPTION_STATE,
            &self.subscriptions.state(),
        )
        .await
    }

    /// Buy a credit pack: write-ahead record, store purchase, optimistic
    /// grant, then asynchronous validation.
    ///
    /// A validation transport failure leaves the record pending for
    /// [`retry_pending_validations`](Self::retry_pending_validations); the
    /// grant stands in the meantime. An explicit rejection surfaces
    /// [`EntitlementError::ReceiptValidationFailed`] after the compensating
    /// debit has landed.
    pub async fn buy_credit_pack(&self, product_id: &str) -> Result<PurchaseRecord> {
        let pack = self
            .config
            .credit_pack(product_id)
            .ok_or_else(|| EntitlementError::UnknownProduct(product_id.to_string()))?
            .clone();

        let record = self
            .recorder
            .record_pending(product_id, PurchaseType::CreditPack, self.purchase_store.platform())
            .await?;
        let receipt = self.store_purchase(product_id).await?;
        let record = self
            .recorder
            .attach_receipt(
                &record.id,
                &receipt.receipt_data,
                Some(receipt.transaction_id),
                pack.credits,
            )
            .await?;

        match self.recorder.validate(&record.id).await {
            Ok(record) => Ok(record),
            Err(err) if err.is_retryable() => {
                tracing::warn!(%err, purchase = %record.id, "validation deferred");
                Ok(record)
            }
            Err(err) => Err(err),
        }
    }

    /// Buy a subscription: write-ahead record, store purchase, optimistic
    /// activation, then validation. An invalid receipt revokes the
    /// activation and surfaces
    /// [`EntitlementError::ReceiptValidationFailed`].
    pub async fn buy_subscription(&self, product_id: &str) -> Result<PurchaseRecord> {
        let plan = self
            .config
            .subscription(product_id)
            .ok_or_else(|| EntitlementError::UnknownProduct(product_id.to_string()))?
            .clone();

        let record = self
            .recorder
            .record_pending(product_id, PurchaseType::Subscription, self.purchase_store.platform())
            .await?;
        let receipt = self.store_purchase(product_id).await?;
        let allocation = plan.tier.period_allocation(plan.billing_period);
        let record = self
            .recorder
            .attach_receipt(
                &record.id,
                &receipt.receipt_data,
                Some(receipt.transaction_id),
                allocation,
            )
            .await?;

        self.subscriptions
            .activate(plan.tier, plan.billing_period, Timestamp::now())?;

        let record = match self.recorder.validate(&record.id).await {
            Ok(record) => record,
            Err(err @ EntitlementError::ReceiptValidationFailed { .. }) => {
                self.subscriptions.revoke()?;
                self.push_subscription_state().await;
                return Err(err);
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(%err, purchase = %record.id, "validation deferred");
                record
            }
            Err(err) => return Err(err),
        };

        self.push_subscription_state().await;
        Ok(record)
    }

    /// Cancel the active subscription. Credits remain spendable through the
    /// paid period.
    pub async fn cancel_subscription(&self) -> Result<()> {
        self.subscriptions.cancel()?;
        self.push_subscription_state().await;
        Ok(())
    }

    /// Advance subscription period boundaries (renewal / expiry)
    pub fn clock_tick(&self, now: Timestamp) -> Result<()> {
        self.subscriptions.on_clock_tick(now)
    }

    /// Replay store receipts; idempotent grants make repeat restores safe.
    ///
    /// Returns how many receipts resulted in a new grant or activation.
    pub async fn restore_purchases(&self) -> Result<usize> {
        let receipts = timeout(self.config.request_timeout, self.purchase_store.restore())
            .await
            .map_err(|_| EntitlementError::Network("restore timed out".to_string()))??;

        let mut restored = 0;
        for receipt in receipts {
            if self
                .recorder
                .find_by_store_transaction(&receipt.transaction_id)
                .is_some()
            {
                continue;
            }
            if let Some(pack) = self.config.credit_pack(&receipt.product_id).cloned() {
                let record = self
                    .recorder
                    .record_pending(&receipt.product_id, PurchaseType::CreditPack, receipt.platform)
                    .await?;
                self.recorder
                    .attach_receipt(
                        &record.id,
                        &receipt.receipt_data,
                        Some(receipt.transaction_id),
                        pack.credits,
                    )
                    .await?;
                restored += 1;
            } else if let Some(plan) = self.config.subscription(&receipt.product_id).cloned() {
                let record = self
                    .recorder
                    .record_pending(&receipt.product_id, PurchaseType::Subscription, receipt.platform)
                    .await?;
                self.recorder
                    .attach_receipt(
                        &record.id,
                        &receipt.receipt_data,
                        Some(receipt.transaction_id),
                        plan.tier.period_allocation(plan.billing_period),
                    )
                    .await?;
                self.subscriptions
                    .activate(plan.tier, plan.billing_period, Timestamp::now())?;
                restored += 1;
            } else {
                tracing::warn!(product = %receipt.product_id, "restored receipt for unknown product");
            }
        }
        Ok(restored)
    }

    /// Retry validation of purchases recorded while offline.
    ///
    /// A subscription that settles invalid on this path is revoked, exactly
    /// as it would have been in the inline purchase flow.
    pub async fn retry_pending_validations(&self) -> Result<usize> {
        let settled = self.recorder.retry_pending().await?;
        let invalid_subscription = settled.iter().any(|record| {
            record.purchase_type == PurchaseType::Subscription
                && record.validation == ValidationState::Invalid
        });
        if invalid_subscription {
            self.subscriptions.revoke()?;
            self.push_subscription_state().await;
        }
        Ok(settled.len())
    }

    /// Reconcile the local ledger with the backend
    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync_agent.sync_with_backoff().await
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn balance(&self) -> CreditBalance {
        self.ledger.snapshot()
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.ledger.stats()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscriptions.state()
    }

    pub fn pending_purchases(&self) -> Vec<PurchaseRecord> {
        self.recorder.pending()
    }

    async fn store_purchase(&self, product_id: &str) -> Result<StoreReceipt> {
        timeout(
            self.config.request_timeout,
            self.purchase_store.purchase(product_id),
        )
        .await
        .map_err(|_| EntitlementError::Network("store purchase timed out".to_string()))?
    }

    /// Best-effort: subscription state mirrors to the backend, but a
    /// transport failure never blocks the local transition.
    async fn push_subscription_state(&self) {
        let state = self.subscriptions.state();
        if let Err(err) = timeout(
            self.config.request_timeout,
            self.backend.upsert_subscription(&state),
        )
        .await
        .map_err(|_| EntitlementError::Network("subscription upsert timed out".to_string()))
        .and_then(|r| r)
        {
            tracing::warn!(%err, "subscription state push deferred");
        }
    }
}

/// Scripted purchase store for tests
pub mod testing {
    use parking_lot::Mutex;

    use super::*;
    use crate::types::generate_id;

    /// Purchase store that fabricates receipts locally
    pub struct ScriptedPurchaseStore {
        platform: Platform,
        restorable: Mutex<Vec<StoreReceipt>>,
        fail_next: Mutex<bool>,
    }

    impl ScriptedPurchaseStore {
        pub fn new(platform: Platform) -> Self {
            ScriptedPurchaseStore {
                platform,
                restorable: Mutex::new(Vec::new()),
                fail_next: Mutex::new(false),
            }
        }

        pub fn fail_next_purchase(&self) {
            *self.fail_next.lock() = true;
        }

        pub fn receipts(&self) -> Vec<StoreReceipt> {
            self.restorable.lock().clone()
        }
    }

    #[async_trait]
    impl PurchaseStore for ScriptedPurchaseStore {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn purchase(&self, product_id: &str) -> Result<StoreReceipt> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Err(EntitlementError::Network("store unreachable".to_string()));
            }
            let receipt = StoreReceipt {
                product_id: product_id.to_string(),
                transaction_id: generate_id(),
                receipt_data: format!("receipt:{product_id}"),
                platform: self.platform,
            };
            self.restorable.lock().push(receipt.clone());
            Ok(receipt)
        }

        async fn restore(&self) -> Result<Vec<StoreReceipt>> {
            Ok(self.restorable.lock().clone())
        }
    }
}
