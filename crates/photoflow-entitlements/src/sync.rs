//! Ledger synchronization with the backend entitlement service
//!
//! Reconciliation is additive and transaction-based: local and remote
//! exchange transaction logs and replay the deduplicated union, so an
//! offline purchase is never lost to a stale remote snapshot and a
//! server-side renewal is never lost to a stale local one. All sync writes
//! funnel through a single writer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{EntitlementError, Result};
use crate::ledger::{CreditBalance, CreditLedger};
use crate::subscription::SubscriptionState;
use crate::transactions::LedgerTransaction;
use crate::types::{Credits, Platform};

/// Backend answer to a receipt validation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptVerdict {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Backend entitlement service boundary
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn validate_receipt(
        &self,
        receipt_data: &str,
        product_id: &str,
        platform: Platform,
    ) -> Result<ReceiptVerdict>;

    async fn upsert_subscription(&self, state: &SubscriptionState) -> Result<()>;

    async fn upsert_credit_balance(&self, balance: &CreditBalance) -> Result<()>;

    async fn fetch_credit_balance(&self) -> Result<Option<CreditBalance>>;

    /// Canonical transaction set stored server-side
    async fn fetch_transactions(&self) -> Result<Vec<LedgerTransaction>>;

    /// Append transactions the server has not seen
    async fn push_transactions(&self, transactions: &[LedgerTransaction]) -> Result<()>;
}

/// Sync agent configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-request timeout; an elapsed timer is a retryable network error
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Result of one sync pass
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub applied_remote: usize,
    pub pushed_local: usize,
    pub balance_after: Credits,
}

/// Reconciles the local ledger with the remote source of truth
pub struct LedgerSyncAgent {
    ledger: Arc<CreditLedger>,
    backend: Arc<dyn BackendClient>,
    config: SyncConfig,
    /// Serializes sync passes; concurrent callers queue rather than
    /// interleave partial updates
    write_gate: tokio::sync::Mutex<()>,
}

impl LedgerSyncAgent {
    pub fn new(ledger: Arc<CreditLedger>, backend: Arc<dyn BackendClient>) -> Self {
        Self::with_config(ledger, backend, SyncConfig::default())
    }

    pub fn with_config(
        ledger: Arc<CreditLedger>,
        backend: Arc<dyn BackendClient>,
        config: SyncConfig,
    ) -> Self {
        LedgerSyncAgent {
            ledger,
            backend,
            config,
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// One sync pass: pull remote transactions, merge, push what the remote
    /// is missing, publish the merged balance.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let _gate = self.write_gate.lock().await;

        let remote = self
            .bounded(self.backend.fetch_transactions(), "fetch transactions")
            .await?;
        let outcome = self.ledger.merge_remote(remote);

        if !outcome.local_only.is_empty() {
            self.bounded(
                self.backend.push_transactions(&outcome.local_only),
                "push transactions",
            )
            .await?;
        }
        self.bounded(
            self.backend.upsert_credit_balance(&self.ledger.snapshot()),
            "upsert balance",
        )
        .await?;

        let report = SyncReport {
            applied_remote: outcome.applied_remote,
            pushed_local: outcome.local_only.len(),
            balance_after: outcome.balance_after,
        };
        tracing::info!(
            applied_remote = report.applied_remote,
            pushed_local = report.pushed_local,
            balance = report.balance_after,
            "ledger sync complete"
        );
        Ok(report)
    }

    /// Sync with bounded exponential backoff.
    ///
    /// Gives up after `max_retries` transport failures; the local ledger
    /// stays authoritative for spend decisions until the next opportunity.
    pub async fn sync_with_backoff(&self) -> Result<SyncReport> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;
        loop {
            match self.sync_once().await {
                Ok(report) => return Ok(report),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(%err, attempt, "sync failed; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    tracing::warn!(%err, "sync abandoned until next opportunity");
                    return Err(err);
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
        what: &str,
    ) -> Result<T> {
        timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| EntitlementError::Network(format!("{what} timed out")))?
    }
}

/// Scripted collaborators for tests
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// In-memory backend with scripted verdicts and a transaction store
    #[derive(Default)]
    pub struct ScriptedBackend {
        verdicts: Mutex<Vec<ReceiptVerdict>>,
        fail_validation: AtomicBool,
        fail_fetch: AtomicBool,
        transactions: Mutex<Vec<LedgerTransaction>>,
        balance: Mutex<Option<CreditBalance>>,
        subscription: Mutex<Option<SubscriptionState>>,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the verdict for the next validation call
        pub fn push_verdict(&self, verdict: ReceiptVerdict) {
            self.verdicts.lock().push(verdict);
        }

        /// Make the next validation call fail with a network error
        pub fn fail_next_validation(&self) {
            self.fail_validation.store(true, Ordering::SeqCst);
        }

        /// Make the next transaction fetch fail with a network error
        pub fn fail_next_fetch(&self) {
            self.fail_fetch.store(true, Ordering::SeqCst);
        }

        /// Seed server-side transactions
        pub fn seed_transactions(&self, transactions: Vec<LedgerTransaction>) {
            self.transactions.lock().extend(transactions);
        }

        pub fn stored_transactions(&self) -> Vec<LedgerTransaction> {
            self.transactions.lock().clone()
        }

        pub fn stored_balance(&self) -> Option<CreditBalance> {
            self.balance.lock().clone()
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedBackend {
        async fn validate_receipt(
            &self,
            _receipt_data: &str,
            product_id: &str,
            _platform: Platform,
        ) -> Result<ReceiptVerdict> {
            if self.fail_validation.swap(false, Ordering::SeqCst) {
                return Err(EntitlementError::Network("connection reset".to_string()));
            }
            let mut verdicts = self.verdicts.lock();
            if verdicts.is_empty() {
                return Err(EntitlementError::Internal(format!(
                    "no scripted verdict for {product_id}"
                )));
            }
            Ok(verdicts.remove(0))
        }

        async fn upsert_subscription(&self, state: &SubscriptionState) -> Result<()> {
            *self.subscription.lock() = Some(state.clone());
            Ok(())
        }

        async fn upsert_credit_balance(&self, balance: &CreditBalance) -> Result<()> {
            *self.balance.lock() = Some(balance.clone());
            Ok(())
        }

        async fn fetch_credit_balance(&self) -> Result<Option<CreditBalance>> {
            Ok(self.balance.lock().clone())
        }

        async fn fetch_transactions(&self) -> Result<Vec<LedgerTransaction>> {
            if self.fail_fetch.swap(false, Ordering::SeqCst) {
                return Err(EntitlementError::Network("connection reset".to_string()));
            }
            Ok(self.transactions.lock().clone())
        }

        async fn push_transactions(&self, transactions: &[LedgerTransaction]) -> Result<()> {
            let mut stored = self.transactions.lock();
            for tx in transactions {
                if !stored.iter().any(|t| t.id == tx.id) {
                    stored.push(tx.clone());
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;
    use crate::transactions::TransactionKind;
    use crate::types::Timestamp;

    fn grant(purchase_id: &str, amount: Credits, millis: i64) -> LedgerTransaction {
        LedgerTransaction::new(
            TransactionKind::PurchaseGrant {
                purchase_id: purchase_id.to_string(),
                amount,
            },
            Timestamp::from_unix_millis(millis),
        )
    }

    #[tokio::test]
    async fn test_offline_purchase_survives_stale_remote() {
        let ledger = Arc::new(CreditLedger::new());
        // Local, offline purchase
        ledger.grant_purchased_credits(20, "local-pack").unwrap();

        // Remote knows about an older server-side renewal instead
        let backend = Arc::new(ScriptedBackend::new());
        backend.seed_transactions(vec![LedgerTransaction::new(
            TransactionKind::Renewal {
                allocation: 50,
                carry_over: false,
                event: "period:1000".into(),
            },
            Timestamp::from_unix_millis(1_000),
        )]);

        let agent = LedgerSyncAgent::new(Arc::clone(&ledger), backend.clone());
        let report = agent.sync_once().await.unwrap();

        assert_eq!(report.applied_remote, 1);
        assert_eq!(report.pushed_local, 1);
        // Both sides kept: renewal + purchase
        assert_eq!(ledger.snapshot().credits_remaining(), 70);
        assert_eq!(backend.stored_transactions().len(), 2);
        assert_eq!(
            backend.stored_balance().unwrap().credits_remaining(),
            70
        );
    }

    #[tokio::test]
    async fn test_merge_converges_in_either_order() {
        let shared = vec![grant("p1", 10, 100), grant("p2", 5, 200)];
        let local_only = grant("p3", 7, 300);
        let remote_only = grant("p4", 3, 400);

        // Device A: local log has shared + p3, remote delivers shared + p4
        let a = CreditLedger::from_transactions(
            shared.iter().cloned().chain([local_only.clone()]).collect(),
        );
        let mut remote_a = shared.clone();
        remote_a.push(remote_only.clone());
        a.merge_remote(remote_a);

        // Device B: mirrored order
        let b = CreditLedger::from_transactions(
            shared.iter().cloned().chain([remote_only.clone()]).collect(),
        );
        let mut remote_b = shared.clone();
        remote_b.push(local_only.clone());
        b.merge_remote(remote_b);

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot().credits_remaining(), 25);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let ledger = Arc::new(CreditLedger::new());
        ledger.grant_purchased_credits(10, "p1").unwrap();
        let backend = Arc::new(ScriptedBackend::new());

        let agent = LedgerSyncAgent::new(Arc::clone(&ledger), backend.clone());
        agent.sync_once().await.unwrap();
        let report = agent.sync_once().await.unwrap();

        assert_eq!(report.applied_remote, 0);
        assert_eq!(report.pushed_local, 0);
        assert_eq!(ledger.snapshot().credits_remaining(), 10);
    }

    #[tokio::test]
    async fn test_backoff_recovers_from_transient_failure() {
        let ledger = Arc::new(CreditLedger::new());
        ledger.grant_purchased_credits(10, "p1").unwrap();

        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_next_fetch();

        let agent = LedgerSyncAgent::with_config(
            Arc::clone(&ledger),
            backend.clone(),
            SyncConfig {
                request_timeout: Duration::from_secs(1),
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
            },
        );
        let report = agent.sync_with_backoff().await.unwrap();
        assert_eq!(report.pushed_local, 1);
    }
}
