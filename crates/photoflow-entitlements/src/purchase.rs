//! Purchase recording and optimistic grants
//!
//! Purchases are written ahead of any credit grant, granted optimistically
//! when the store returns a receipt, and reconciled against asynchronous
//! backend validation. A failed validation is compensated by a new ledger
//! debit entry; the original grant is never mutated.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{EntitlementError, Result};
use crate::ledger::CreditLedger;
use crate::storage::{keys, store_value, StateStore};
use crate::sync::BackendClient;
use crate::types::{generate_id, Credits, Platform, ProductId, PurchaseId, Timestamp};

/// What was bought
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseType {
    Subscription,
    CreditPack,
}

/// Validation lifecycle of a purchase record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Pending,
    Validated,
    Invalid,
}

/// Write-ahead record of a purchase attempt.
///
/// Immutable once validated; an invalidated record is superseded by a
/// compensating ledger entry, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub id: PurchaseId,
    pub product_id: ProductId,
    pub purchase_type: PurchaseType,
    pub receipt_data: Option<String>,
    /// Store-side transaction id; grant idempotency key when present
    pub store_transaction_id: Option<String>,
    pub validation: ValidationState,
    pub credits_granted: Credits,
    pub platform: Platform,
    pub created_at: Timestamp,
}

impl PurchaseRecord {
    /// Key under which the ledger grant for this purchase is deduplicated
    pub fn grant_key(&self) -> &str {
        self.store_transaction_id.as_deref().unwrap_or(&self.id)
    }
}

/// Records purchases write-ahead and reconciles optimistic grants
pub struct PurchaseRecorder {
    ledger: Arc<CreditLedger>,
    store: Arc<dyn StateStore>,
    backend: Arc<dyn BackendClient>,
    records: Mutex<Vec<PurchaseRecord>>,
    request_timeout: Duration,
}

impl PurchaseRecorder {
    pub fn new(
        ledger: Arc<CreditLedger>,
        store: Arc<dyn StateStore>,
        backend: Arc<dyn BackendClient>,
        request_timeout: Duration,
    ) -> Self {
        PurchaseRecorder {
            ledger,
            store,
            backend,
            records: Mutex::new(Vec::new()),
            request_timeout,
        }
    }

    /// Restore records persisted by a previous session
    pub async fn load(&self) -> Result<()> {
        if let Some(records) =
            crate::storage::load_value::<Vec<PurchaseRecord>>(&*self.store, keys::PENDING_PURCHASES)
                .await?
        {
            *self.records.lock() = records;
        }
        Ok(())
    }

    /// Write a pending record before any credit is granted (crash-safe)
    pub async fn record_pending(
        &self,
        product_id: &str,
        purchase_type: PurchaseType,
        platform: Platform,
    ) -> Result<PurchaseRecord> {
        let record = PurchaseRecord {
            id: generate_id(),
            product_id: product_id.to_string(),
            purchase_type,
            receipt_data: None,
            store_transaction_id: None,
            validation: ValidationState::Pending,
            credits_granted: 0,
            platform,
            created_at: Timestamp::now(),
        };
        self.records.lock().push(record.clone());
        self.persist().await?;
        tracing::debug!(purchase = %record.id, product = product_id, "recorded pending purchase");
        Ok(record)
    }

    /// Attach the store receipt and grant credits optimistically.
    ///
    /// For credit packs the grant lands on the ledger immediately so the
    /// user is not blocked on network validation; subscriptions are
    /// activated by the caller and only recorded here.
    pub async fn attach_receipt(
        &self,
        record_id: &str,
        receipt_data: &str,
        store_transaction_id: Option<String>,
        credits: Credits,
    ) -> Result<PurchaseRecord> {
        let record = {
            let mut records = self.records.lock();
            let record = records
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or_else(|| EntitlementError::PurchaseNotFound(record_id.to_string()))?;
            record.receipt_data = Some(receipt_data.to_string());
            record.store_transaction_id = store_transaction_id;
            record.credits_granted = credits;
            record.clone()
        };

        if record.purchase_type == PurchaseType::CreditPack {
            self.ledger
                .grant_purchased_credits(credits, record.grant_key())?;
        }
        self.persist().await?;
        Ok(record)
    }

    /// Validate one record against the backend.
    ///
    /// A transport failure leaves the record pending and is retryable. An
    /// explicit rejection marks the record invalid, applies the compensating
    /// debit for credit-pack grants, and surfaces
    /// [`EntitlementError::ReceiptValidationFailed`] to the caller.
    /// Already settled records are returned unchanged.
    pub async fn validate(&self, record_id: &str) -> Result<PurchaseRecord> {
        let record = self
            .get(record_id)
            .ok_or_else(|| EntitlementError::PurchaseNotFound(record_id.to_string()))?;
        if record.validation != ValidationState::Pending {
            return Ok(record);
        }
        let Some(receipt) = record.receipt_data.clone() else {
            // No receipt yet; nothing to validate
            return Ok(record);
        };

        let verdict = timeout(
            self.request_timeout,
            self.backend
                .validate_receipt(&receipt, &record.product_id, record.platform),
        )
        .await
        .map_err(|_| EntitlementError::Network("receipt validation timed out".to_string()))??;

        if verdict.valid {
            let updated = self.settle(record_id, ValidationState::Validated)?;
            self.persist().await?;
            Ok(updated)
        } else {
            let reason = verdict.reason.unwrap_or_else(|| "rejected".to_string());
            tracing::warn!(
                purchase = record_id,
                product = %record.product_id,
                %reason,
                "receipt validation failed; compensating"
            );
            let updated = self.settle(record_id, ValidationState::Invalid)?;
            if updated.purchase_type == PurchaseType::CreditPack {
                self.ledger
                    .apply_compensating_debit(updated.credits_granted, updated.grant_key())?;
            }
            self.persist().await?;
            Err(EntitlementError::ReceiptValidationFailed {
                product_id: updated.product_id,
                reason,
            })
        }
    }

    /// Retry validation of everything still pending.
    ///
    /// Returns the records that were settled (validated or invalidated) so
    /// the caller can react to newly invalid purchases; transport failures
    /// are logged and left for the next opportunity.
    pub async fn retry_pending(&self) -> Result<Vec<PurchaseRecord>> {
        let pending: Vec<String> = self
            .pending()
            .into_iter()
            .filter(|r| r.receipt_data.is_some())
            .map(|r| r.id)
            .collect();

        let mut settled = Vec::new();
        for id in pending {
            match self.validate(&id).await {
                Ok(record) if record.validation != ValidationState::Pending => {
                    settled.push(record)
                }
                Ok(_) => {}
                Err(EntitlementError::ReceiptValidationFailed { .. }) => {
                    // Compensation already applied inside validate
                    if let Some(record) = self.get(&id) {
                        settled.push(record);
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(purchase = %id, %err, "validation retry deferred");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(settled)
    }

    pub fn get(&self, record_id: &str) -> Option<PurchaseRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.id == record_id)
            .cloned()
    }

    pub fn find_by_store_transaction(&self, store_transaction_id: &str) -> Option<PurchaseRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.store_transaction_id.as_deref() == Some(store_transaction_id))
            .cloned()
    }

    /// Records still awaiting validation
    pub fn pending(&self) -> Vec<PurchaseRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.validation == ValidationState::Pending)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<PurchaseRecord> {
        self.records.lock().clone()
    }

    fn settle(&self, record_id: &str, state: ValidationState) -> Result<PurchaseRecord> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| EntitlementError::PurchaseNotFound(record_id.to_string()))?;
        record.validation = state;
        Ok(record.clone())
    }

    async fn persist(&self) -> Result<()> {
        let records = self.records.lock().clone();
        store_value(&*self.store, keys::PENDING_PURCHASES, &records).await
    }
}
