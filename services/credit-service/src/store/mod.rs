//! Persistence for accounts, purchase orders, gated resources, unlocks and
//! transactions.
//!
//! Every method on [`CreditStore`] is a single atomic step against the
//! backing store. Flows that touch more than one table (order completion,
//! unlocking) get their own primitive instead of being composed from
//! smaller ones, so a storage failure never leaves half of them applied.

pub mod memory;
pub mod postgres;

use crate::model::{Account, CreditPurchaseOrder, GatedResource, ResourceUnlock, Transaction};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (duplicate unlock, duplicate gateway order).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Debit refused; the balance was left untouched.
    #[error("insufficient credit: balance {balance}, required {required}")]
    InsufficientCredit { balance: i64, required: i64 },

    /// Backend unreachable, timed out or failed mid-operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of moving an order out of `pending` with its credit applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCompletion {
    /// Status flipped and credits applied in the same atomic step.
    Completed {
        order: CreditPurchaseOrder,
        balance: i64,
    },
    /// Order had already left `pending`; nothing changed.
    AlreadyProcessed { order: CreditPurchaseOrder },
}

/// Outcome of [`CreditStore::unlock`]. Insufficient credit is reported as
/// [`StoreError::InsufficientCredit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Debit and unlock row committed together.
    Unlocked { unlock: ResourceUnlock, balance: i64 },
    /// The pair was already unlocked; the ledger was not touched.
    AlreadyUnlocked { unlock: ResourceUnlock, balance: i64 },
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    // Ledger
    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>>;
    /// Add credits, creating the account on first use. Returns the new balance.
    async fn credit(&self, account_id: &str, amount: i64) -> StoreResult<i64>;
    /// Remove credits only if the balance covers `amount`. Returns the new balance.
    async fn debit(&self, account_id: &str, amount: i64) -> StoreResult<i64>;

    // Purchase orders
    async fn insert_order(&self, order: CreditPurchaseOrder) -> StoreResult<CreditPurchaseOrder>;
    async fn order(&self, order_id: Uuid) -> StoreResult<Option<CreditPurchaseOrder>>;
    /// `pending -> completed` plus the ledger credit and `total_spent` bump,
    /// all or nothing.
    async fn complete_order(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
    ) -> StoreResult<OrderCompletion>;
    /// `pending -> failed`. Returns the order as stored afterwards; orders
    /// that already left `pending` are returned unchanged.
    async fn fail_order(&self, order_id: Uuid, reason: &str) -> StoreResult<CreditPurchaseOrder>;

    // Unlocks
    async fn find_unlock(
        &self,
        resource_id: &str,
        account_id: &str,
    ) -> StoreResult<Option<ResourceUnlock>>;
    /// Existence check, debit of `unlock.credits_spent` and row insert as
    /// one unit. On any error nothing has changed.
    async fn unlock(&self, unlock: ResourceUnlock) -> StoreResult<UnlockOutcome>;
    async fn list_unlocks(&self, account_id: &str) -> StoreResult<Vec<ResourceUnlock>>;

    // Resources (owned elsewhere, read here)
    async fn resource(&self, resource_id: &str) -> StoreResult<Option<GatedResource>>;
    async fn upsert_resource(&self, resource: GatedResource) -> StoreResult<()>;

    // Transactions
    async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<Transaction>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

/// Run a store call under a deadline. On timeout the real outcome is
/// unknown, which callers must treat as retryable.
pub async fn bounded<T, F>(deadline: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "store call exceeded {}ms",
            deadline.as_millis()
        ))),
    }
}
