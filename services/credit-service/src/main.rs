// ============================================================
// src/main.rs - credit-service (Rust + Actix-web)
// ============================================================
// Sells prepaid credits through the payment gateway, verifies payment
// signatures and spends credits to unlock gated leads.
//
// Without DATABASE_URL the service runs on the in-memory store; without
// gateway credentials it mints local order ids and signs with a dev secret.

use actix_web::{middleware, web, App, HttpServer};
use credit_service::api::{self, AppState, Collaborators};
use credit_service::cache::CacheManager;
use credit_service::config::ServiceConfig;
use credit_service::gateway::{
    DeterministicGateway, HttpPaymentGateway, PaymentGateway, PaymentSigner,
};
use credit_service::health::ConnectionHealthMonitor;
use credit_service::metrics::Metrics;
use credit_service::model::GatedResource;
use credit_service::rate_limit::RateLimiter;
use credit_service::store::{CreditStore, InMemoryStore, PostgresStore};
use log::{error, info, warn};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

type BoxError = Box<dyn Error + Send + Sync>;

// ── Bootstrap helpers ─────────────────────────────────────────

async fn open_store(
    config: &ServiceConfig,
    metrics: &Metrics,
) -> Result<(Arc<dyn CreditStore>, Option<Arc<ConnectionHealthMonitor>>), BoxError> {
    let Some(database) = &config.database else {
        warn!("[credit-service] DATABASE_URL not set; using the in-memory store");
        let store: Arc<dyn CreditStore> = Arc::new(InMemoryStore::new());
        return Ok((store, None));
    };
    let postgres = Arc::new(PostgresStore::connect(database).await?);
    info!(
        "[credit-service] Connected to Postgres (max {} connections)",
        database.max_connections
    );
    let monitor = Arc::new(ConnectionHealthMonitor::new(
        postgres.clone(),
        config.health,
        Some(metrics.clone()),
    ));
    monitor.spawn();
    let store: Arc<dyn CreditStore> = postgres;
    Ok((store, Some(monitor)))
}

fn payment_gateway(config: &ServiceConfig) -> Result<Arc<dyn PaymentGateway>, BoxError> {
    let gateway = &config.gateway;
    match (&gateway.key_id, &gateway.key_secret) {
        (Some(key_id), Some(key_secret)) => {
            let remote = HttpPaymentGateway::new(
                &gateway.base_url,
                key_id.clone(),
                key_secret.clone(),
                gateway.timeout,
            )?;
            info!("[credit-service] Payment gateway at {}", remote.orders_url());
            let remote: Arc<dyn PaymentGateway> = Arc::new(remote);
            Ok(remote)
        }
        _ => {
            warn!("[credit-service] No gateway credentials; minting local order ids with the dev signing secret");
            let local: Arc<dyn PaymentGateway> = Arc::new(DeterministicGateway::new());
            Ok(local)
        }
    }
}

async fn seed_resources(store: &dyn CreditStore, path: &Path) -> Result<usize, BoxError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let resources: Vec<GatedResource> = serde_json::from_str(&raw)?;
    let count = resources.len();
    for resource in resources {
        store.upsert_resource(resource).await?;
    }
    Ok(count)
}

async fn run() -> Result<(), BoxError> {
    let config = ServiceConfig::from_env()?;
    let metrics = Metrics::new().map_err(|e| format!("metrics registry: {e}"))?;

    let (store, monitor) = open_store(&config, &metrics).await?;
    if let Some(path) = &config.resource_seed_path {
        let count = seed_resources(store.as_ref(), path).await?;
        info!("[credit-service] Seeded {count} gated resources from {}", path.display());
    }

    let gateway = payment_gateway(&config)?;
    let signer = PaymentSigner::new(config.gateway.signing_secret())
        .map_err(|e| format!("signing key: {e}"))?;
    let cache = Arc::new(CacheManager::start(config.cache_ttl, config.cache_sweep));
    let limiter = Arc::new(RateLimiter::start(config.rate_limit_sweep));

    let mut state = AppState::new(
        &config,
        Collaborators {
            store,
            gateway,
            signer,
            cache: Arc::clone(&cache),
            limiter: Arc::clone(&limiter),
            metrics,
        },
    );
    if let Some(monitor) = &monitor {
        state = state.with_monitor(Arc::clone(monitor));
    }
    if !state.auth.is_enabled() {
        warn!("[credit-service] JWT_SECRET not set; account routes accept unauthenticated calls");
    }
    let state = web::Data::new(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("[credit-service] Listening on {addr}");

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(&addr)?
    .run()
    .await?;

    info!("[credit-service] Shutting down");
    cache.shutdown();
    limiter.shutdown();
    if let Some(monitor) = monitor {
        monitor.shutdown();
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    run().await.map_err(|e| {
        error!("[credit-service] {e}");
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })
}
