//! Domain records shared by the ledger, order, unlock and transaction layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ── Accounts ──────────────────────────────────────────────────

/// Credit balance of one consumer account.
///
/// `credit_balance` never goes below zero; it is only changed through the
/// store's `credit` / `debit` / `complete_order` primitives.
/// `total_spent` counts minor currency units of completed purchases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    pub credit_balance: i64,
    pub total_spent: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(account_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            credit_balance: 0,
            total_spent: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Purchase orders ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown order status `{other}`")),
        }
    }
}

/// A credit package purchase attempt.
///
/// Status only ever moves `pending -> completed` or `pending -> failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPurchaseOrder {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub account_id: String,
    pub package_id: String,
    pub credits: i64,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub gateway_payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Gated resources ───────────────────────────────────────────

/// A sales lead whose contact fields stay hidden until unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatedResource {
    pub resource_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub is_publicly_visible: bool,
}

impl GatedResource {
    /// Copy with every contact field blanked.
    pub fn redacted(&self) -> Self {
        Self {
            contact_name: None,
            contact_email: None,
            contact_phone: None,
            ..self.clone()
        }
    }
}

/// Proof that `account_id` paid to reveal `resource_id`.
/// At most one exists per `(resource_id, account_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUnlock {
    pub resource_id: String,
    pub account_id: String,
    pub credits_spent: i64,
    pub unlocked_at: DateTime<Utc>,
}

// ── Transactions ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    EscrowPending,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::EscrowPending => "escrow_pending",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "escrow_pending" => Ok(Self::EscrowPending),
            other => Err(format!("unknown transaction status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub account_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub kind: String,
    pub description: String,
    pub status: TransactionStatus,
    pub escrow_required: bool,
    pub escrow_enabled: bool,
    pub escrow_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
