//! Request handlers. Each one authenticates, throttles, then delegates to
//! the engine; errors render through `ResponseError`.

use super::types::{
    CancelRequest, PurchaseRequest, TransactionRequest, TransactionResponse, UnlockRequest,
    UnlockResponse, VerifyRequest, VerifyResponse, ViewQuery,
};
use super::AppState;
use crate::error::ServiceError;
use crate::orders::{CancelOutcome, PaymentVerification, VerificationOutcome};
use crate::rate_limit::RateLimitRule;
use crate::store::bounded;
use crate::transactions::NewTransaction;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use log::{error, warn};
use prometheus::{Encoder, TextEncoder};
use std::time::Duration;
use uuid::Uuid;

type HandlerResult = Result<HttpResponse, ServiceError>;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ── Rate limiting ─────────────────────────────────────────────

fn client_identity(req: &HttpRequest, subject: Option<&str>) -> String {
    match subject {
        Some(sub) => format!("sub:{sub}"),
        None => req
            .peer_addr()
            .map(|addr| format!("ip:{}", addr.ip()))
            .unwrap_or_else(|| "ip:unknown".to_string()),
    }
}

fn throttle(
    state: &AppState,
    operation: &'static str,
    rule: RateLimitRule,
    client: &str,
) -> Result<(), ServiceError> {
    let decision = state.limiter.check_rule(operation, client, rule);
    if decision.allowed {
        return Ok(());
    }
    warn!("[rate-limit] {operation} rejected for {client}");
    state.metrics.rate_limited.with_label_values(&[operation]).inc();
    Err(ServiceError::RateLimited {
        retry_after_secs: decision.retry_after_secs(),
    })
}

// ── Platform ──────────────────────────────────────────────────

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let store_ok = match bounded(HEALTH_PROBE_TIMEOUT, state.store.health_check()).await {
        Ok(()) => true,
        Err(err) => {
            error!("[health] store check failed: {err}");
            false
        }
    };
    let status = if store_ok { "ok" } else { "degraded" };
    let body = serde_json::json!({
        "status": status,
        "service": "credit-service",
        "timestamp": Utc::now().to_rfc3339(),
        "store": state.store.backend_name(),
        "database": state.monitor.as_ref().map(|m| m.snapshot()),
        "cache": state.cache.stats(),
        "rateLimitWindows": state.limiter.len(),
    });
    if store_ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let metric_families = state.metrics.registry.gather();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("[metrics] encode failed: {err}");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

// ── Credits ───────────────────────────────────────────────────

pub async fn packages(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "currency": state.orders.currency(),
        "packages": state.orders.catalog().all(),
        "unlockCost": state.unlocks.unlock_cost(),
    }))
}

pub async fn balance(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HandlerResult {
    let account_id = path.into_inner();
    state.auth.authorize(&req, &account_id)?;
    let balance = state.ledger.balance(&account_id).await?;
    Ok(HttpResponse::Ok().json(balance))
}

pub async fn purchase(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<PurchaseRequest>,
) -> HandlerResult {
    let subject = state.auth.authorize(&req, &payload.account_id)?;
    let client = client_identity(&req, subject.as_deref());
    throttle(&state, "purchase", state.limits.purchase, &client)?;

    let created = state
        .orders
        .create_order(&payload.account_id, &payload.package_id)
        .await?;
    Ok(HttpResponse::Created().json(created))
}

/// Authenticated by the payment signature only; may be a gateway callback.
pub async fn verify(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<VerifyRequest>,
) -> HandlerResult {
    let client = client_identity(&req, None);
    throttle(&state, "verify", state.limits.verify, &client)?;

    let payload = payload.into_inner();
    let outcome = state
        .orders
        .verify_payment(&PaymentVerification {
            gateway_order_id: payload.gateway_order_id,
            gateway_payment_id: payload.gateway_payment_id,
            signature: payload.signature,
            local_order_id: payload.local_order_id,
        })
        .await?;

    let body = match outcome {
        VerificationOutcome::Credited {
            credits_added,
            balance,
            ..
        } => VerifyResponse {
            success: true,
            credits_added,
            already_processed: false,
            credit_balance: Some(balance),
        },
        VerificationOutcome::AlreadyProcessed { .. } => VerifyResponse {
            success: true,
            credits_added: 0,
            already_processed: true,
            credit_balance: None,
        },
    };
    Ok(HttpResponse::Ok().json(body))
}

pub async fn cancel(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    payload: web::Json<CancelRequest>,
) -> HandlerResult {
    let order_id = path.into_inner();
    let subject = state.auth.authorize(&req, &payload.account_id)?;
    let client = client_identity(&req, subject.as_deref());
    throttle(&state, "purchase", state.limits.purchase, &client)?;

    let reason = payload.reason.as_deref().unwrap_or("cancelled by client");
    let (order, already_processed) = match state
        .orders
        .cancel_order(&payload.account_id, order_id, reason)
        .await?
    {
        CancelOutcome::Cancelled(order) => (order, false),
        CancelOutcome::AlreadyProcessed(order) => (order, true),
    };
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "localOrderId": order.order_id,
        "status": order.status,
        "alreadyProcessed": already_processed,
    })))
}

// ── Gated resources ───────────────────────────────────────────

pub async fn unlock(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<UnlockRequest>,
) -> HandlerResult {
    let subject = state.auth.authorize(&req, &payload.account_id)?;
    let client = client_identity(&req, subject.as_deref());
    throttle(&state, "unlock", state.limits.unlock, &client)?;

    let result = state
        .unlocks
        .unlock(&payload.resource_id, &payload.account_id)
        .await?;
    Ok(HttpResponse::Ok().json(UnlockResponse {
        success: true,
        already_unlocked: result.already_unlocked,
        credits_remaining: result.credits_remaining,
    }))
}

pub async fn view_resource(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ViewQuery>,
) -> HandlerResult {
    let resource_id = path.into_inner();
    let account_id = query.into_inner().account_id;
    if let Some(account_id) = &account_id {
        state.auth.authorize(&req, account_id)?;
    }
    let view = state
        .unlocks
        .view(&resource_id, account_id.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn account_unlocks(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HandlerResult {
    let account_id = path.into_inner();
    state.auth.authorize(&req, &account_id)?;
    let unlocks = state.unlocks.unlocked_resources(&account_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "accountId": account_id,
        "unlocks": unlocks,
    })))
}

// ── Transactions ──────────────────────────────────────────────

pub async fn create_transaction(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<TransactionRequest>,
) -> HandlerResult {
    let payload = payload.into_inner();
    let subject = match &payload.account_id {
        Some(account_id) => state.auth.authorize(&req, account_id)?,
        None => state.auth.subject(&req)?,
    };
    let client = client_identity(&req, subject.as_deref());
    throttle(&state, "transaction", state.limits.transaction, &client)?;

    let transaction = state
        .transactions
        .create(NewTransaction {
            account_id: payload.account_id.or(subject),
            amount: payload.amount,
            currency: payload.currency,
            kind: payload.kind,
            description: payload.description,
        })
        .await?;
    Ok(HttpResponse::Created().json(TransactionResponse {
        transaction_id: transaction.transaction_id,
        status: transaction.status.as_str().to_string(),
        escrow_required: transaction.escrow_required,
        escrow_id: transaction.escrow_id,
    }))
}
