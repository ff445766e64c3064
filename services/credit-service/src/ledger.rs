//! Per-account credit balance.
//!
//! Thin layer over the store's atomic `credit` / `debit` primitives: input
//! validation, deadlines and logging. Nothing here reads a balance and then
//! writes it back.

use crate::error::{Result, ServiceError};
use crate::model::Account;
use crate::store::{bounded, CreditStore};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub account_id: String,
    pub credit_balance: i64,
    pub total_spent: i64,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    deadline: Duration,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    pub async fn credit(&self, account_id: &str, amount: i64) -> Result<i64> {
        validate(account_id, amount)?;
        let balance = bounded(self.deadline, self.store.credit(account_id, amount)).await?;
        info!("[ledger] +{amount} to {account_id} (balance {balance})");
        Ok(balance)
    }

    /// Fails closed with `InsufficientCredit` and leaves the balance as is.
    pub async fn debit(&self, account_id: &str, amount: i64) -> Result<i64> {
        validate(account_id, amount)?;
        match bounded(self.deadline, self.store.debit(account_id, amount)).await {
            Ok(balance) => {
                info!("[ledger] -{amount} from {account_id} (balance {balance})");
                Ok(balance)
            }
            Err(err) => {
                debug!("[ledger] debit of {amount} from {account_id} refused: {err}");
                Err(err.into())
            }
        }
    }

    /// Zero for accounts that have never purchased.
    pub async fn balance(&self, account_id: &str) -> Result<Balance> {
        let account = self.account(account_id).await?;
        Ok(match account {
            Some(account) => Balance {
                account_id: account.account_id,
                credit_balance: account.credit_balance,
                total_spent: account.total_spent,
            },
            None => Balance {
                account_id: account_id.to_string(),
                credit_balance: 0,
                total_spent: 0,
            },
        })
    }

    pub async fn account(&self, account_id: &str) -> Result<Option<Account>> {
        if account_id.trim().is_empty() {
            return Err(ServiceError::Validation("accountId is required".into()));
        }
        Ok(bounded(self.deadline, self.store.account(account_id)).await?)
    }
}

fn validate(account_id: &str, amount: i64) -> Result<()> {
    if account_id.trim().is_empty() {
        return Err(ServiceError::Validation("accountId is required".into()));
    }
    if amount <= 0 {
        return Err(ServiceError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}
