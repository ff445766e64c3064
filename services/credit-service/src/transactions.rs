//! Escrow-aware transaction creation.

use crate::error::{Result, ServiceError};
use crate::escrow::EscrowPolicy;
use crate::model::{Transaction, TransactionStatus};
use crate::store::{bounded, CreditStore};
use chrono::Utc;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub kind: String,
    pub description: String,
}

pub struct TransactionService {
    store: Arc<dyn CreditStore>,
    policy: EscrowPolicy,
    escrow_enabled: bool,
    deadline: Duration,
}

impl TransactionService {
    pub fn new(
        store: Arc<dyn CreditStore>,
        policy: EscrowPolicy,
        escrow_enabled: bool,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            escrow_enabled,
            deadline,
        }
    }

    pub async fn create(&self, request: NewTransaction) -> Result<Transaction> {
        if request.amount <= 0 {
            return Err(ServiceError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        let currency = request.currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ServiceError::Validation(format!(
                "currency must be a three-letter code, got `{}`",
                request.currency
            )));
        }
        let kind = request.kind.trim();
        if kind.is_empty() {
            return Err(ServiceError::Validation("type is required".into()));
        }

        let decision = self.policy.decide(request.amount, &currency, self.escrow_enabled);
        let transaction_id = Uuid::new_v4();
        let escrow_id = decision
            .holds_funds()
            .then(|| format!("esc_{}", transaction_id.simple()));

        let transaction = Transaction {
            transaction_id,
            account_id: request.account_id,
            amount: request.amount,
            currency,
            kind: kind.to_string(),
            description: request.description,
            status: decision.status,
            escrow_required: decision.escrow_required,
            escrow_enabled: decision.escrow_enabled,
            escrow_id,
            created_at: Utc::now(),
        };
        let transaction = bounded(self.deadline, self.store.insert_transaction(transaction)).await?;

        if transaction.status == TransactionStatus::EscrowPending {
            info!(
                "[transactions] {} held in escrow ({} {} >= {})",
                transaction.transaction_id,
                transaction.amount,
                transaction.currency,
                self.policy.threshold()
            );
        } else {
            info!(
                "[transactions] {} created ({} {})",
                transaction.transaction_id, transaction.amount, transaction.currency
            );
        }
        Ok(transaction)
    }
}
