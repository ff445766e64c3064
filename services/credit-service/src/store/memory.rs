//! In-memory implementation of [`CreditStore`].
//!
//! All tables sit behind one `tokio::sync::RwLock`, so each primitive runs
//! as if serializable. Not durable: state is lost on restart. Meant for
//! local development and tests.

use super::{CreditStore, OrderCompletion, StoreError, StoreResult, UnlockOutcome};
use crate::model::{
    Account, CreditPurchaseOrder, GatedResource, OrderStatus, ResourceUnlock, Transaction,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    orders: HashMap<Uuid, CreditPurchaseOrder>,
    /// gateway_order_id -> order_id
    gateway_orders: HashMap<String, Uuid>,
    resources: HashMap<String, GatedResource>,
    /// (resource_id, account_id) -> unlock
    unlocks: HashMap<(String, String), ResourceUnlock>,
    transactions: HashMap<Uuid, Transaction>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(resources: impl IntoIterator<Item = GatedResource>) -> Self {
        let tables = Tables {
            resources: resources
                .into_iter()
                .map(|resource| (resource.resource_id.clone(), resource))
                .collect(),
            ..Tables::default()
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Number of unlock rows for a pair; only ever 0 or 1.
    pub async fn unlock_count(&self, resource_id: &str, account_id: &str) -> usize {
        let tables = self.tables.read().await;
        usize::from(
            tables
                .unlocks
                .contains_key(&(resource_id.to_string(), account_id.to_string())),
        )
    }
}

fn non_negative(amount: i64) -> StoreResult<()> {
    if amount < 0 {
        return Err(StoreError::Conflict(format!("negative amount {amount}")));
    }
    Ok(())
}

#[async_trait]
impl CreditStore for InMemoryStore {
    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>> {
        Ok(self.tables.read().await.accounts.get(account_id).cloned())
    }

    async fn credit(&self, account_id: &str, amount: i64) -> StoreResult<i64> {
        non_negative(amount)?;
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Account::new(account_id));
        account.credit_balance += amount;
        account.updated_at = Utc::now();
        Ok(account.credit_balance)
    }

    async fn debit(&self, account_id: &str, amount: i64) -> StoreResult<i64> {
        non_negative(amount)?;
        let mut tables = self.tables.write().await;
        let Some(account) = tables.accounts.get_mut(account_id) else {
            return Err(StoreError::InsufficientCredit {
                balance: 0,
                required: amount,
            });
        };
        if account.credit_balance < amount {
            return Err(StoreError::InsufficientCredit {
                balance: account.credit_balance,
                required: amount,
            });
        }
        account.credit_balance -= amount;
        account.updated_at = Utc::now();
        Ok(account.credit_balance)
    }

    async fn insert_order(&self, order: CreditPurchaseOrder) -> StoreResult<CreditPurchaseOrder> {
        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.order_id) {
            return Err(StoreError::Conflict(format!("order {} exists", order.order_id)));
        }
        if tables.gateway_orders.contains_key(&order.gateway_order_id) {
            return Err(StoreError::Conflict(format!(
                "gateway order {} exists",
                order.gateway_order_id
            )));
        }
        tables
            .gateway_orders
            .insert(order.gateway_order_id.clone(), order.order_id);
        tables.orders.insert(order.order_id, order.clone());
        Ok(order)
    }

    async fn order(&self, order_id: Uuid) -> StoreResult<Option<CreditPurchaseOrder>> {
        Ok(self.tables.read().await.orders.get(&order_id).cloned())
    }

    async fn complete_order(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
    ) -> StoreResult<OrderCompletion> {
        let mut tables = self.tables.write().await;
        let order = tables
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;
        if !order.status.is_pending() {
            return Ok(OrderCompletion::AlreadyProcessed { order });
        }

        let now = Utc::now();
        let account = tables
            .accounts
            .entry(order.account_id.clone())
            .or_insert_with(|| Account::new(order.account_id.clone()));
        account.credit_balance += order.credits;
        account.total_spent += order.amount;
        account.updated_at = now;
        let balance = account.credit_balance;

        let stored = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;
        stored.status = OrderStatus::Completed;
        stored.gateway_payment_id = Some(gateway_payment_id.to_string());
        stored.updated_at = now;
        Ok(OrderCompletion::Completed {
            order: stored.clone(),
            balance,
        })
    }

    async fn fail_order(&self, order_id: Uuid, reason: &str) -> StoreResult<CreditPurchaseOrder> {
        let mut tables = self.tables.write().await;
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;
        if order.status.is_pending() {
            order.status = OrderStatus::Failed;
            order.failure_reason = Some(reason.to_string());
            order.updated_at = Utc::now();
        }
        Ok(order.clone())
    }

    async fn find_unlock(
        &self,
        resource_id: &str,
        account_id: &str,
    ) -> StoreResult<Option<ResourceUnlock>> {
        let tables = self.tables.read().await;
        Ok(tables
            .unlocks
            .get(&(resource_id.to_string(), account_id.to_string()))
            .cloned())
    }

    async fn unlock(&self, unlock: ResourceUnlock) -> StoreResult<UnlockOutcome> {
        non_negative(unlock.credits_spent)?;
        let mut tables = self.tables.write().await;
        let balance = tables
            .accounts
            .get(&unlock.account_id)
            .map(|account| account.credit_balance)
            .unwrap_or(0);
        let key = (unlock.resource_id.clone(), unlock.account_id.clone());
        if let Some(existing) = tables.unlocks.get(&key) {
            return Ok(UnlockOutcome::AlreadyUnlocked {
                unlock: existing.clone(),
                balance,
            });
        }
        if balance < unlock.credits_spent {
            return Err(StoreError::InsufficientCredit {
                balance,
                required: unlock.credits_spent,
            });
        }

        let account = tables
            .accounts
            .entry(unlock.account_id.clone())
            .or_insert_with(|| Account::new(unlock.account_id.clone()));
        account.credit_balance -= unlock.credits_spent;
        account.updated_at = Utc::now();
        let balance = account.credit_balance;
        tables.unlocks.insert(key, unlock.clone());
        Ok(UnlockOutcome::Unlocked { unlock, balance })
    }

    async fn list_unlocks(&self, account_id: &str) -> StoreResult<Vec<ResourceUnlock>> {
        let tables = self.tables.read().await;
        let mut unlocks: Vec<ResourceUnlock> = tables
            .unlocks
            .values()
            .filter(|unlock| unlock.account_id == account_id)
            .cloned()
            .collect();
        unlocks.sort_by(|a, b| {
            a.unlocked_at
                .cmp(&b.unlocked_at)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        Ok(unlocks)
    }

    async fn resource(&self, resource_id: &str) -> StoreResult<Option<GatedResource>> {
        Ok(self.tables.read().await.resources.get(resource_id).cloned())
    }

    async fn upsert_resource(&self, resource: GatedResource) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .resources
            .insert(resource.resource_id.clone(), resource);
        Ok(())
    }

    async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<Transaction> {
        let mut tables = self.tables.write().await;
        if tables.transactions.contains_key(&transaction.transaction_id) {
            return Err(StoreError::Conflict(format!(
                "transaction {} exists",
                transaction.transaction_id
            )));
        }
        tables
            .transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(transaction)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
