//! Persisted local state
//!
//! A small key-value abstraction holding the balance, subscription state,
//! the pending purchase queue, and the transaction log. The engine takes the
//! backend as an injected trait object; no storage engine is mandated.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Well-known storage keys
pub mod keys {
    pub const CREDIT_BALANCE: &str = "credit_balance";
    pub const SUBSCRIPTION_STATE: &str = "subscription_state";
    pub const PENDING_PURCHASES: &str = "pending_purchases";
    pub const TRANSACTION_LOG: &str = "transaction_log";
    pub const WORKFLOW_EXECUTION: &str = "workflow_execution";
}

/// Key-value store for local entitlement state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Serialize and store a value under `key`
pub async fn store_value<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<()> {
    store.put(key, serde_json::to_value(value)?).await
}

/// Load and deserialize the value under `key`, if present
pub async fn load_value<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// In-memory store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
