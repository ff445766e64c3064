//! Credit purchases: order creation against the gateway and signature-checked
//! completion.
//!
//! ```text
//! create_order ──► gateway order minted ──► CreditPurchaseOrder { pending }
//!                                                   │
//!          verify_payment (valid signature) ────────┤──► completed + credits applied
//!          cancel_order ────────────────────────────┘──► failed
//! ```
//!
//! `verify_payment` is safe to repeat: only the call that moves the order
//! out of `pending` applies credits, so webhook redelivery and client
//! retries are no-ops.

use crate::cache::CacheManager;
use crate::error::{Result, ServiceError};
use crate::gateway::{PaymentGateway, PaymentSigner, RemoteOrderRequest};
use crate::metrics::Metrics;
use crate::model::{CreditPurchaseOrder, OrderStatus};
use crate::store::{bounded, CreditStore, OrderCompletion, StoreError};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ── Price list ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPackage {
    pub id: String,
    pub credits: i64,
    /// Minor currency units.
    pub amount: i64,
}

/// Closed set of purchasable packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCatalog {
    packages: Vec<CreditPackage>,
}

impl PackageCatalog {
    pub fn new(packages: Vec<CreditPackage>) -> std::result::Result<Self, String> {
        if packages.is_empty() {
            return Err("at least one package is required".to_string());
        }
        for (i, package) in packages.iter().enumerate() {
            if packages[..i].iter().any(|other| other.id == package.id) {
                return Err(format!("duplicate package `{}`", package.id));
            }
        }
        Ok(Self { packages })
    }

    pub fn get(&self, id: &str) -> Option<&CreditPackage> {
        self.packages.iter().find(|package| package.id == id)
    }

    pub fn all(&self) -> &[CreditPackage] {
        &self.packages
    }
}

// ── Service ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub gateway_order_id: String,
    pub local_order_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub credits: i64,
}

#[derive(Debug, Clone)]
pub struct PaymentVerification {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
    pub local_order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Credited {
        account_id: String,
        credits_added: i64,
        balance: i64,
    },
    /// Order had already left `pending`; nothing was credited.
    AlreadyProcessed { status: OrderStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(CreditPurchaseOrder),
    /// Order had already left `pending` and was not touched.
    AlreadyProcessed(CreditPurchaseOrder),
}

pub struct PaymentOrderService {
    store: Arc<dyn CreditStore>,
    gateway: Arc<dyn PaymentGateway>,
    signer: PaymentSigner,
    catalog: PackageCatalog,
    currency: String,
    deadline: Duration,
    cache: Option<Arc<CacheManager>>,
    metrics: Option<Metrics>,
}

impl PaymentOrderService {
    pub fn new(
        store: Arc<dyn CreditStore>,
        gateway: Arc<dyn PaymentGateway>,
        signer: PaymentSigner,
        catalog: PackageCatalog,
        currency: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            signer,
            catalog,
            currency: currency.into(),
            deadline,
            cache: None,
            metrics: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn catalog(&self) -> &PackageCatalog {
        &self.catalog
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub async fn create_order(&self, account_id: &str, package_id: &str) -> Result<CreatedOrder> {
        if account_id.trim().is_empty() {
            return Err(ServiceError::Validation("accountId is required".into()));
        }
        let package = self
            .catalog
            .get(package_id)
            .ok_or_else(|| ServiceError::InvalidPackage(package_id.to_string()))?
            .clone();

        let order_id = Uuid::new_v4();
        let request = RemoteOrderRequest {
            amount: package.amount,
            currency: self.currency.clone(),
            receipt: format!("rcpt_{}", order_id.simple()),
        };
        let remote = self.gateway.create_remote_order(&request).await.map_err(|e| {
            warn!("[orders] gateway {} failed for {account_id}: {e}", self.gateway.name());
            ServiceError::from(e)
        })?;

        let now = Utc::now();
        let order = CreditPurchaseOrder {
            order_id,
            gateway_order_id: remote.gateway_order_id,
            account_id: account_id.to_string(),
            package_id: package.id.clone(),
            credits: package.credits,
            amount: package.amount,
            currency: self.currency.clone(),
            status: OrderStatus::Pending,
            gateway_payment_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let order = bounded(self.deadline, self.store.insert_order(order)).await?;

        if let Some(metrics) = &self.metrics {
            metrics.orders_created.inc();
        }
        info!(
            "[orders] {} created order {} ({}) for package {} ({} credits, {} {})",
            order.account_id,
            order.order_id,
            order.gateway_order_id,
            order.package_id,
            order.credits,
            order.amount,
            order.currency
        );

        Ok(CreatedOrder {
            gateway_order_id: order.gateway_order_id,
            local_order_id: order.order_id,
            amount: order.amount,
            currency: order.currency,
            credits: order.credits,
        })
    }

    pub async fn verify_payment(&self, request: &PaymentVerification) -> Result<VerificationOutcome> {
        if !self.signer.verify(
            &request.gateway_order_id,
            &request.gateway_payment_id,
            &request.signature,
        ) {
            warn!(
                "[orders] signature mismatch for gateway order {} payment {} (possible tampering)",
                request.gateway_order_id, request.gateway_payment_id
            );
            self.record("invalid_signature");
            return Err(ServiceError::InvalidSignature);
        }

        let order = bounded(self.deadline, self.store.order(request.local_order_id))
            .await?
            .ok_or_else(|| {
                self.record("not_found");
                ServiceError::OrderNotFound(request.local_order_id.to_string())
            })?;

        if order.gateway_order_id != request.gateway_order_id {
            warn!(
                "[orders] order {} belongs to {} but payment names {}",
                order.order_id, order.gateway_order_id, request.gateway_order_id
            );
            self.record("mismatch");
            return Err(ServiceError::Validation(
                "gatewayOrderId does not match the local order".into(),
            ));
        }

        if !order.status.is_pending() {
            info!("[orders] order {} already {}", order.order_id, order.status);
            self.record("already_processed");
            return Ok(VerificationOutcome::AlreadyProcessed {
                status: order.status,
            });
        }

        let completion = bounded(
            self.deadline,
            self.store
                .complete_order(order.order_id, &request.gateway_payment_id),
        )
        .await
        .map_err(|e| {
            if !matches!(e, StoreError::NotFound(_)) {
                error!("[orders] completing {} failed: {e}", order.order_id);
                self.record("error");
            }
            match e {
                StoreError::NotFound(_) => ServiceError::OrderNotFound(order.order_id.to_string()),
                other => ServiceError::from(other),
            }
        })?;

        match completion {
            OrderCompletion::Completed { order, balance } => {
                info!(
                    "[orders] {} credited {} for order {} (balance {balance})",
                    order.account_id, order.credits, order.order_id
                );
                self.record("credited");
                if let Some(cache) = &self.cache {
                    cache.invalidate_pattern(&format!("account:{}:*", order.account_id));
                }
                Ok(VerificationOutcome::Credited {
                    account_id: order.account_id,
                    credits_added: order.credits,
                    balance,
                })
            }
            // Lost a race with a concurrent verification of the same order.
            OrderCompletion::AlreadyProcessed { order } => {
                self.record("already_processed");
                Ok(VerificationOutcome::AlreadyProcessed {
                    status: order.status,
                })
            }
        }
    }

    /// `pending -> failed` for an abandoned checkout or a gateway-reported
    /// failure.
    pub async fn cancel_order(
        &self,
        account_id: &str,
        order_id: Uuid,
        reason: &str,
    ) -> Result<CancelOutcome> {
        let order = bounded(self.deadline, self.store.order(order_id))
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;
        if order.account_id != account_id {
            return Err(ServiceError::Forbidden(format!(
                "order {order_id} belongs to another account"
            )));
        }
        if !order.status.is_pending() {
            return Ok(CancelOutcome::AlreadyProcessed(order));
        }
        let order = bounded(self.deadline, self.store.fail_order(order_id, reason)).await?;
        if order.status != OrderStatus::Failed {
            // Completed by a concurrent verification between the read and the write.
            return Ok(CancelOutcome::AlreadyProcessed(order));
        }
        info!("[orders] {account_id} cancelled order {order_id}: {reason}");
        Ok(CancelOutcome::Cancelled(order))
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.payment_outcome(outcome);
        }
    }
}
