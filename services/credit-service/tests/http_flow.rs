use actix_web::http::{header, StatusCode};
use actix_web::{test, web, App};
use credit_service::api::{self, AppState, Collaborators};
use credit_service::auth::Claims;
use credit_service::cache::CacheManager;
use credit_service::config::{ServiceConfig, DEV_SIGNING_SECRET};
use credit_service::gateway::{DeterministicGateway, PaymentSigner};
use credit_service::metrics::Metrics;
use credit_service::model::GatedResource;
use credit_service::rate_limit::RateLimiter;
use credit_service::store::InMemoryStore;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ── Fixtures ──────────────────────────────────────────────────

fn config(overrides: &[(&str, &str)]) -> ServiceConfig {
    let vars: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ServiceConfig::from_lookup(|key| vars.get(key).cloned()).expect("config")
}

fn lead(id: &str, public: bool) -> GatedResource {
    GatedResource {
        resource_id: id.to_string(),
        title: format!("Lead {id}"),
        summary: "2,000 bags of OPC cement, Nagpur".to_string(),
        contact_name: Some("S. Rao".to_string()),
        contact_email: Some("rao@example.com".to_string()),
        contact_phone: Some("+91 91000 00000".to_string()),
        is_publicly_visible: public,
    }
}

fn state(config: &ServiceConfig) -> web::Data<AppState> {
    let store = Arc::new(InMemoryStore::with_resources([
        lead("lead-1", false),
        lead("lead-2", false),
        lead("lead-public", true),
    ]));
    web::Data::new(AppState::new(
        config,
        Collaborators {
            store,
            gateway: Arc::new(DeterministicGateway::new()),
            signer: PaymentSigner::new(config.gateway.signing_secret()).expect("signer"),
            cache: Arc::new(CacheManager::new(config.cache_ttl)),
            limiter: Arc::new(RateLimiter::new()),
            metrics: Metrics::new().expect("metrics"),
        },
    ))
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(App::new().app_data($state.clone()).configure(api::configure)).await
    };
}

fn sign(order: &str, payment: &str) -> String {
    PaymentSigner::new(DEV_SIGNING_SECRET)
        .expect("signer")
        .sign(order, payment)
}

fn bearer(sub: &str, secret: &str) -> (header::HeaderName, String) {
    let claims = Claims {
        sub: sub.to_string(),
        exp: 4_102_444_800,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token");
    (header::AUTHORIZATION, format!("Bearer {token}"))
}

// ── Flows ─────────────────────────────────────────────────────

#[actix_web::test]
async fn purchase_verify_unlock_happy_path() {
    let state = state(&config(&[]));
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/credits/purchase")
        .set_json(json!({"accountId": "acct-1", "packageId": "pro"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let order: Value = test::read_body_json(resp).await;
    assert_eq!(order["credits"], 12);
    assert_eq!(order["amount"], 5000);
    let gateway_order_id = order["gatewayOrderId"].as_str().expect("gateway id").to_string();
    let local_order_id = order["localOrderId"].as_str().expect("local id").to_string();

    let verify = json!({
        "gatewayOrderId": gateway_order_id,
        "gatewayPaymentId": "pay_001",
        "signature": sign(&gateway_order_id, "pay_001"),
        "localOrderId": local_order_id,
    });
    let req = test::TestRequest::post()
        .uri("/credits/verify")
        .set_json(&verify)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["creditsAdded"], 12);

    // Redelivered callback is a no-op.
    let req = test::TestRequest::post()
        .uri("/credits/verify")
        .set_json(&verify)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["alreadyProcessed"], true);
    assert_eq!(body["creditsAdded"], 0);

    for expected_already in [false, true] {
        let req = test::TestRequest::post()
            .uri("/unlocks")
            .set_json(json!({"resourceId": "lead-1", "accountId": "acct-1"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["alreadyUnlocked"], expected_already);
        assert_eq!(body["creditsRemaining"], 11);
    }

    let req = test::TestRequest::get()
        .uri("/credits/balance/acct-1")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["creditBalance"], 11);
    assert_eq!(body["totalSpent"], 5000);

    let req = test::TestRequest::get()
        .uri("/resources/lead-1?accountId=acct-1")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["contactEmail"], "rao@example.com");
    assert_eq!(body["unlocked"], true);

    let req = test::TestRequest::get()
        .uri("/accounts/acct-1/unlocks")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["unlocks"].as_array().map(Vec::len), Some(1));
}

#[actix_web::test]
async fn unknown_package_is_rejected() {
    let state = state(&config(&[]));
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/credits/purchase")
        .set_json(json!({"accountId": "acct-1", "packageId": "gold"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "InvalidPackage");
}

#[actix_web::test]
async fn tampered_signature_is_rejected() {
    let state = state(&config(&[]));
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/credits/purchase")
        .set_json(json!({"accountId": "acct-1", "packageId": "starter"}))
        .to_request();
    let order: Value = test::call_and_read_body_json(&app, req).await;
    let gateway_order_id = order["gatewayOrderId"].as_str().expect("gateway id");

    let req = test::TestRequest::post()
        .uri("/credits/verify")
        .set_json(json!({
            "gatewayOrderId": gateway_order_id,
            "gatewayPaymentId": "pay_001",
            "signature": sign(gateway_order_id, "pay_002"),
            "localOrderId": order["localOrderId"],
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "InvalidSignature");

    let req = test::TestRequest::get()
        .uri("/credits/balance/acct-1")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["creditBalance"], 0);
}

#[actix_web::test]
async fn cancelled_order_reports_already_processed_on_verify() {
    let state = state(&config(&[]));
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/credits/purchase")
        .set_json(json!({"accountId": "acct-1", "packageId": "starter"}))
        .to_request();
    let order: Value = test::call_and_read_body_json(&app, req).await;
    let local = order["localOrderId"].as_str().expect("local id");
    let gateway_order_id = order["gatewayOrderId"].as_str().expect("gateway id");

    let req = test::TestRequest::post()
        .uri(&format!("/credits/orders/{local}/cancel"))
        .set_json(json!({"accountId": "acct-1", "reason": "checkout closed"}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["alreadyProcessed"], false);

    let req = test::TestRequest::post()
        .uri("/credits/verify")
        .set_json(json!({
            "gatewayOrderId": gateway_order_id,
            "gatewayPaymentId": "pay_late",
            "signature": sign(gateway_order_id, "pay_late"),
            "localOrderId": local,
        }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["alreadyProcessed"], true);
}

#[actix_web::test]
async fn broke_account_gets_payment_required() {
    let state = state(&config(&[]));
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/unlocks")
        .set_json(json!({"resourceId": "lead-1", "accountId": "acct-broke"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "InsufficientCredit");
    assert_eq!(body["creditsRemaining"], 0);

    let req = test::TestRequest::get()
        .uri("/accounts/acct-broke/unlocks")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["unlocks"], json!([]));
}

#[actix_web::test]
async fn unknown_resource_is_not_found() {
    let state = state(&config(&[]));
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/unlocks")
        .set_json(json!({"resourceId": "lead-missing", "accountId": "acct-1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn unlock_endpoint_is_rate_limited() {
    let state = state(&config(&[("RATE_LIMIT_UNLOCK", "2/60")]));
    let app = app!(state);
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let req = test::TestRequest::post()
            .uri("/unlocks")
            .set_json(json!({"resourceId": "lead-1", "accountId": "acct-1"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        statuses.push(resp.status());
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            assert!(resp.headers().contains_key(header::RETRY_AFTER));
        }
    }
    assert_eq!(
        statuses,
        [
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    assert_eq!(
        state.metrics.rate_limited.with_label_values(&["unlock"]).get(),
        1
    );
}

#[actix_web::test]
async fn bearer_subject_must_match_account() {
    let secret = "integration-jwt";
    let state = state(&config(&[("JWT_SECRET", secret)]));
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/credits/balance/acct-1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/credits/balance/acct-1")
        .insert_header(bearer("acct-2", secret))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get()
        .uri("/credits/balance/acct-1")
        .insert_header(bearer("acct-1", secret))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn large_transactions_enter_escrow_when_enabled() {
    let state = state(&config(&[("ESCROW_ENABLED", "true")]));
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/transactions")
        .set_json(json!({
            "amount": 500_000,
            "currency": "INR",
            "type": "purchase",
            "description": "steel coils",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "escrow_pending");
    assert_eq!(body["escrowRequired"], true);
    assert!(body["escrowId"].as_str().is_some_and(|id| id.starts_with("esc_")));

    let req = test::TestRequest::post()
        .uri("/transactions")
        .set_json(json!({"amount": 499_999, "currency": "INR", "type": "purchase"}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["escrowRequired"], false);
}

#[actix_web::test]
async fn public_and_private_resources_render_differently() {
    let state = state(&config(&[]));
    let app = app!(state);

    let req = test::TestRequest::get().uri("/resources/lead-2").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["redacted"], true);
    assert!(body["contactEmail"].is_null());
    assert_eq!(body["title"], "Lead lead-2");

    let req = test::TestRequest::get()
        .uri("/resources/lead-public")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["redacted"], false);
    assert_eq!(body["contactPhone"], "+91 91000 00000");
}

#[actix_web::test]
async fn malformed_body_is_a_validation_error() {
    let state = state(&config(&[]));
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/unlocks")
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{\"resourceId\": 5")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "ValidationError");
}

#[actix_web::test]
async fn platform_routes_report_store_and_metrics() {
    let state = state(&config(&[]));
    let app = app!(state);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");

    let req = test::TestRequest::get().uri("/credits/packages").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["packages"].as_array().map(Vec::len), Some(3));
    assert_eq!(body["unlockCost"], 1);

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let body = test::call_and_read_body(&app, req).await;
    let text = String::from_utf8(body.to_vec()).expect("utf8");
    assert!(text.contains("credit_service_orders_created_total"));
}
