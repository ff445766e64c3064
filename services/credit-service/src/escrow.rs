//! Escrow threshold policy.
//!
//! A pure decision: transactions at or above the threshold require escrow,
//! and when the deployment toggle is on they start in `escrow_pending`.
//! The amount is compared in raw minor units; currency is not converted.

use crate::model::TransactionStatus;
use serde::Serialize;

/// Observed platform threshold in minor units of the base currency.
pub const DEFAULT_ESCROW_THRESHOLD: i64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowDecision {
    pub escrow_required: bool,
    pub escrow_enabled: bool,
    pub status: TransactionStatus,
}

impl EscrowDecision {
    /// Whether an escrow identifier should be attached.
    pub fn holds_funds(&self) -> bool {
        matches!(self.status, TransactionStatus::EscrowPending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowPolicy {
    threshold: i64,
}

impl Default for EscrowPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ESCROW_THRESHOLD)
    }
}

impl EscrowPolicy {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn decide(&self, amount: i64, _currency: &str, escrow_enabled: bool) -> EscrowDecision {
        let escrow_required = amount > 0 && amount >= self.threshold;
        let status = if escrow_required && escrow_enabled {
            TransactionStatus::EscrowPending
        } else {
            TransactionStatus::Pending
        };
        EscrowDecision {
            escrow_required,
            escrow_enabled,
            status,
        }
    }
}

/// `decide` under the default threshold.
pub fn decide(amount: i64, currency: &str, escrow_enabled: bool) -> EscrowDecision {
    EscrowPolicy::default().decide(amount, currency, escrow_enabled)
}
