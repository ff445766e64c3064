//! Postgres-backed implementation of [`CreditStore`] using `sqlx`.
//!
//! # Atomicity
//! - `debit` is one conditional `UPDATE ... WHERE credit_balance >= $2`, so
//!   concurrent debits on one account serialize on the row lock and can
//!   never overdraw. The `CHECK (credit_balance >= 0)` constraint backs it up.
//! - `complete_order` flips the status with `WHERE status = 'pending'` and
//!   credits the account inside one transaction; a lost race sees zero
//!   updated rows and reports `AlreadyProcessed`.
//! - `unlock` locks the account row (`SELECT ... FOR UPDATE`), then checks
//!   for an existing unlock, debits and inserts in one transaction. Racers
//!   on the same account queue on the lock and see the winner's row.
//! - Unique violations (`23505`) surface as `StoreError::Conflict`.
//!
//! Connections identify themselves as [`APPLICATION_NAME`] so idle-backend
//! reclamation only ever touches this service's sessions.
//!
//! Database URLs may contain credentials; never log them.

use super::{CreditStore, OrderCompletion, StoreError, StoreResult, UnlockOutcome};
use crate::health::ConnectionProbe;
use crate::model::{
    Account, CreditPurchaseOrder, GatedResource, OrderStatus, ResourceUnlock, Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// `application_name` reported to the server for every pooled connection.
pub const APPLICATION_NAME: &str = "credit-service";

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run embedded migrations before serving anything.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(&config.url)?.application_name(APPLICATION_NAME);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migrations failed: {e}")))?;
        info!(
            "[store] postgres ready (max_connections={})",
            config.max_connections
        );
        Ok(Self { pool })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            ref db if is_unique_violation(db) => StoreError::Conflict(db.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

// ── Row types ─────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct DbAccount {
    account_id: String,
    credit_balance: i64,
    total_spent: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbAccount> for Account {
    fn from(row: DbAccount) -> Self {
        Account {
            account_id: row.account_id,
            credit_balance: row.credit_balance,
            total_spent: row.total_spent,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DbOrder {
    order_id: Uuid,
    gateway_order_id: String,
    account_id: String,
    package_id: String,
    credits: i64,
    amount: i64,
    currency: String,
    status: String,
    gateway_payment_id: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbOrder> for CreditPurchaseOrder {
    type Error = StoreError;

    fn try_from(row: DbOrder) -> StoreResult<Self> {
        let status = OrderStatus::from_str(&row.status).map_err(StoreError::Unavailable)?;
        Ok(CreditPurchaseOrder {
            order_id: row.order_id,
            gateway_order_id: row.gateway_order_id,
            account_id: row.account_id,
            package_id: row.package_id,
            credits: row.credits,
            amount: row.amount,
            currency: row.currency,
            status,
            gateway_payment_id: row.gateway_payment_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DbResource {
    resource_id: String,
    title: String,
    summary: String,
    contact_name: Option<String>,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    is_publicly_visible: bool,
}

impl From<DbResource> for GatedResource {
    fn from(row: DbResource) -> Self {
        GatedResource {
            resource_id: row.resource_id,
            title: row.title,
            summary: row.summary,
            contact_name: row.contact_name,
            contact_email: row.contact_email,
            contact_phone: row.contact_phone,
            is_publicly_visible: row.is_publicly_visible,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DbUnlock {
    resource_id: String,
    account_id: String,
    credits_spent: i64,
    unlocked_at: DateTime<Utc>,
}

impl From<DbUnlock> for ResourceUnlock {
    fn from(row: DbUnlock) -> Self {
        ResourceUnlock {
            resource_id: row.resource_id,
            account_id: row.account_id,
            credits_spent: row.credits_spent,
            unlocked_at: row.unlocked_at,
        }
    }
}

const UNLOCK_COLUMNS: &str = "resource_id, account_id, credits_spent, unlocked_at";

const ORDER_COLUMNS: &str = "order_id, gateway_order_id, account_id, package_id, credits, amount, \
     currency, status, gateway_payment_id, failure_reason, created_at, updated_at";

#[async_trait]
impl CreditStore for PostgresStore {
    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query_as::<_, DbAccount>(
            "SELECT account_id, credit_balance, total_spent, created_at, updated_at \
             FROM accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }

    async fn credit(&self, account_id: &str, amount: i64) -> StoreResult<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            "INSERT INTO accounts (account_id, credit_balance) VALUES ($1, $2) \
             ON CONFLICT (account_id) DO UPDATE \
             SET credit_balance = accounts.credit_balance + EXCLUDED.credit_balance, \
                 updated_at = now() \
             RETURNING credit_balance",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn debit(&self, account_id: &str, amount: i64) -> StoreResult<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            "UPDATE accounts SET credit_balance = credit_balance - $2, updated_at = now() \
             WHERE account_id = $1 AND credit_balance >= $2 \
             RETURNING credit_balance",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(balance) = balance {
            return Ok(balance);
        }
        let current = sqlx::query_scalar::<_, i64>(
            "SELECT credit_balance FROM accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);
        Err(StoreError::InsufficientCredit {
            balance: current,
            required: amount,
        })
    }

    async fn insert_order(&self, order: CreditPurchaseOrder) -> StoreResult<CreditPurchaseOrder> {
        sqlx::query(
            "INSERT INTO credit_purchase_orders \
             (order_id, gateway_order_id, account_id, package_id, credits, amount, currency, \
              status, gateway_payment_id, failure_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(order.order_id)
        .bind(&order.gateway_order_id)
        .bind(&order.account_id)
        .bind(&order.package_id)
        .bind(order.credits)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(&order.gateway_payment_id)
        .bind(&order.failure_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(order)
    }

    async fn order(&self, order_id: Uuid) -> StoreResult<Option<CreditPurchaseOrder>> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM credit_purchase_orders WHERE order_id = $1");
        sqlx::query_as::<_, DbOrder>(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .map(CreditPurchaseOrder::try_from)
            .transpose()
    }

    async fn complete_order(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
    ) -> StoreResult<OrderCompletion> {
        let mut tx = self.pool.begin().await?;

        let flip = format!(
            "UPDATE credit_purchase_orders \
             SET status = 'completed', gateway_payment_id = $2, updated_at = now() \
             WHERE order_id = $1 AND status = 'pending' \
             RETURNING {ORDER_COLUMNS}"
        );
        let flipped = sqlx::query_as::<_, DbOrder>(&flip)
            .bind(order_id)
            .bind(gateway_payment_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = flipped else {
            tx.rollback().await?;
            return match self.order(order_id).await? {
                Some(order) => Ok(OrderCompletion::AlreadyProcessed { order }),
                None => Err(StoreError::NotFound(format!("order {order_id}"))),
            };
        };
        let order = CreditPurchaseOrder::try_from(row)?;

        let balance = sqlx::query_scalar::<_, i64>(
            "INSERT INTO accounts (account_id, credit_balance, total_spent) VALUES ($1, $2, $3) \
             ON CONFLICT (account_id) DO UPDATE \
             SET credit_balance = accounts.credit_balance + EXCLUDED.credit_balance, \
                 total_spent = accounts.total_spent + EXCLUDED.total_spent, \
                 updated_at = now() \
             RETURNING credit_balance",
        )
        .bind(&order.account_id)
        .bind(order.credits)
        .bind(order.amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OrderCompletion::Completed { order, balance })
    }

    async fn fail_order(&self, order_id: Uuid, reason: &str) -> StoreResult<CreditPurchaseOrder> {
        let query = format!(
            "UPDATE credit_purchase_orders \
             SET status = 'failed', failure_reason = $2, updated_at = now() \
             WHERE order_id = $1 AND status = 'pending' \
             RETURNING {ORDER_COLUMNS}"
        );
        let failed = sqlx::query_as::<_, DbOrder>(&query)
            .bind(order_id)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;
        match failed {
            Some(row) => CreditPurchaseOrder::try_from(row),
            None => self
                .order(order_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("order {order_id}"))),
        }
    }

    async fn find_unlock(
        &self,
        resource_id: &str,
        account_id: &str,
    ) -> StoreResult<Option<ResourceUnlock>> {
        let query = format!(
            "SELECT {UNLOCK_COLUMNS} FROM resource_unlocks WHERE resource_id = $1 AND account_id = $2"
        );
        let row = sqlx::query_as::<_, DbUnlock>(&query)
            .bind(resource_id)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ResourceUnlock::from))
    }

    async fn unlock(&self, unlock: ResourceUnlock) -> StoreResult<UnlockOutcome> {
        let mut tx = self.pool.begin().await?;

        // Held until commit/rollback; every unlock and debit on this account queues here.
        let locked = sqlx::query_scalar::<_, i64>(
            "SELECT credit_balance FROM accounts WHERE account_id = $1 FOR UPDATE",
        )
        .bind(&unlock.account_id)
        .fetch_optional(&mut *tx)
        .await?;
        let balance = locked.unwrap_or(0);

        let find = format!(
            "SELECT {UNLOCK_COLUMNS} FROM resource_unlocks WHERE resource_id = $1 AND account_id = $2"
        );
        let existing = sqlx::query_as::<_, DbUnlock>(&find)
            .bind(&unlock.resource_id)
            .bind(&unlock.account_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            tx.rollback().await?;
            return Ok(UnlockOutcome::AlreadyUnlocked {
                unlock: ResourceUnlock::from(row),
                balance,
            });
        }

        let debited = sqlx::query_scalar::<_, i64>(
            "UPDATE accounts SET credit_balance = credit_balance - $2, updated_at = now() \
             WHERE account_id = $1 AND credit_balance >= $2 \
             RETURNING credit_balance",
        )
        .bind(&unlock.account_id)
        .bind(unlock.credits_spent)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(balance) = debited else {
            tx.rollback().await?;
            return Err(StoreError::InsufficientCredit {
                balance,
                required: unlock.credits_spent,
            });
        };

        let inserted = sqlx::query(
            "INSERT INTO resource_unlocks (resource_id, account_id, credits_spent, unlocked_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (resource_id, account_id) DO NOTHING",
        )
        .bind(&unlock.resource_id)
        .bind(&unlock.account_id)
        .bind(unlock.credits_spent)
        .bind(unlock.unlocked_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            // A row written outside the account lock; the rollback returns the debit.
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "{} already unlocked by {}",
                unlock.resource_id, unlock.account_id
            )));
        }

        tx.commit().await?;
        Ok(UnlockOutcome::Unlocked { unlock, balance })
    }

    async fn list_unlocks(&self, account_id: &str) -> StoreResult<Vec<ResourceUnlock>> {
        let query = format!(
            "SELECT {UNLOCK_COLUMNS} FROM resource_unlocks WHERE account_id = $1 \
             ORDER BY unlocked_at, resource_id"
        );
        let rows = sqlx::query_as::<_, DbUnlock>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ResourceUnlock::from).collect())
    }

    async fn resource(&self, resource_id: &str) -> StoreResult<Option<GatedResource>> {
        let row = sqlx::query_as::<_, DbResource>(
            "SELECT resource_id, title, summary, contact_name, contact_email, contact_phone, \
                    is_publicly_visible \
             FROM gated_resources WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GatedResource::from))
    }

    async fn upsert_resource(&self, resource: GatedResource) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO gated_resources \
             (resource_id, title, summary, contact_name, contact_email, contact_phone, \
              is_publicly_visible) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (resource_id) DO UPDATE SET \
               title = EXCLUDED.title, summary = EXCLUDED.summary, \
               contact_name = EXCLUDED.contact_name, contact_email = EXCLUDED.contact_email, \
               contact_phone = EXCLUDED.contact_phone, \
               is_publicly_visible = EXCLUDED.is_publicly_visible",
        )
        .bind(&resource.resource_id)
        .bind(&resource.title)
        .bind(&resource.summary)
        .bind(&resource.contact_name)
        .bind(&resource.contact_email)
        .bind(&resource.contact_phone)
        .bind(resource.is_publicly_visible)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<Transaction> {
        sqlx::query(
            "INSERT INTO transactions \
             (transaction_id, account_id, amount, currency, kind, description, status, \
              escrow_required, escrow_enabled, escrow_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(transaction.transaction_id)
        .bind(&transaction.account_id)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.kind)
        .bind(&transaction.description)
        .bind(transaction.status.as_str())
        .bind(transaction.escrow_required)
        .bind(transaction.escrow_enabled)
        .bind(&transaction.escrow_id)
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await?;
        Ok(transaction)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl ConnectionProbe for PostgresStore {
    /// Open connections held by this process's pool.
    async fn active_connections(&self) -> StoreResult<u32> {
        Ok(self.pool.size())
    }

    /// Terminate this service's server backends that have sat idle for
    /// longer than `idle_for`. Sessions of other applications sharing the
    /// database and the backend running the query are never targeted.
    async fn terminate_idle(&self, idle_for: Duration) -> StoreResult<u64> {
        let seconds = idle_for.as_secs_f64();
        let terminated = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM ( \
               SELECT pg_terminate_backend(pid) AS terminated \
               FROM pg_stat_activity \
               WHERE datname = current_database() \
                 AND application_name = $2 \
                 AND pid <> pg_backend_pid() \
                 AND state = 'idle' \
                 AND state_change < now() - make_interval(secs => $1) \
             ) killed WHERE killed.terminated",
        )
        .bind(seconds)
        .bind(APPLICATION_NAME)
        .fetch_one(&self.pool)
        .await?;
        if terminated > 0 {
            warn!("[db-health] terminated {terminated} idle backends");
        }
        Ok(u64::try_from(terminated).unwrap_or(0))
    }
}
