//! HTTP surface: shared state and route table.

pub mod error;
pub mod handlers;
pub mod types;

use crate::auth::Authenticator;
use crate::cache::CacheManager;
use crate::config::{RateLimits, ServiceConfig};
use crate::error::ServiceError;
use crate::escrow::EscrowPolicy;
use crate::gateway::{PaymentGateway, PaymentSigner};
use crate::health::ConnectionHealthMonitor;
use crate::ledger::CreditLedger;
use crate::metrics::Metrics;
use crate::orders::PaymentOrderService;
use crate::rate_limit::RateLimiter;
use crate::store::CreditStore;
use crate::transactions::TransactionService;
use crate::unlock::ResourceUnlockGate;
use actix_web::web;
use std::sync::Arc;

// ── Application State ─────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn CreditStore>,
    pub ledger: CreditLedger,
    pub orders: PaymentOrderService,
    pub unlocks: ResourceUnlockGate,
    pub transactions: TransactionService,
    pub cache: Arc<CacheManager>,
    pub limiter: Arc<RateLimiter>,
    pub limits: RateLimits,
    pub auth: Authenticator,
    pub metrics: Metrics,
    pub monitor: Option<Arc<ConnectionHealthMonitor>>,
}

/// Long-lived collaborators the state is assembled from.
pub struct Collaborators {
    pub store: Arc<dyn CreditStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub signer: PaymentSigner,
    pub cache: Arc<CacheManager>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &ServiceConfig, parts: Collaborators) -> Self {
        let Collaborators {
            store,
            gateway,
            signer,
            cache,
            limiter,
            metrics,
        } = parts;
        let deadline = config.store_timeout;

        let orders = PaymentOrderService::new(
            Arc::clone(&store),
            gateway,
            signer,
            config.packages.clone(),
            config.gateway.currency.clone(),
            deadline,
        )
        .with_cache(Arc::clone(&cache))
        .with_metrics(metrics.clone());
        let unlocks = ResourceUnlockGate::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            config.unlock_cost,
            deadline,
        )
        .with_metrics(metrics.clone());
        let transactions = TransactionService::new(
            Arc::clone(&store),
            EscrowPolicy::new(config.escrow_threshold),
            config.escrow_enabled,
            deadline,
        );

        Self {
            ledger: CreditLedger::new(Arc::clone(&store), deadline),
            store,
            orders,
            unlocks,
            transactions,
            cache,
            limiter,
            limits: config.rate_limits,
            auth: Authenticator::new(config.jwt_secret.as_deref()),
            metrics,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ConnectionHealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

// ── Routes ────────────────────────────────────────────────────

/// Malformed bodies render like every other validation error.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| ServiceError::Validation(err.to_string()).into())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        // Platform routes
        .route("/health", web::get().to(handlers::health))
        .route("/metrics", web::get().to(handlers::metrics))
        // Credits
        .route("/credits/packages", web::get().to(handlers::packages))
        .route("/credits/balance/{account_id}", web::get().to(handlers::balance))
        .route("/credits/purchase", web::post().to(handlers::purchase))
        .route("/credits/verify", web::post().to(handlers::verify))
        .route("/credits/orders/{order_id}/cancel", web::post().to(handlers::cancel))
        // Gated resources
        .route("/unlocks", web::post().to(handlers::unlock))
        .route("/resources/{resource_id}", web::get().to(handlers::view_resource))
        .route("/accounts/{account_id}/unlocks", web::get().to(handlers::account_unlocks))
        // Transactions
        .route("/transactions", web::post().to(handlers::create_transaction));
}
