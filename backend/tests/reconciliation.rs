// HTTP-level tests driving the full router with tower::ServiceExt::oneshot,
// backed by the in-memory store and a scripted processor gateway.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use backend::{
    axum_http::http_serve::build_router,
    config::config_loader,
    usecases::subscriptions::StripeGateway,
};
use chrono::Utc;
use crates::{
    infra::memory::subscriptions::SubscriptionInMemory,
    payments::{
        stripe_client::{CheckoutSession, CheckoutSessionRequest, StripeCheckoutSession},
        webhook_signature::{DEFAULT_TOLERANCE_SECS, WebhookVerifier},
    },
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_integration";

/// Records checkout requests and serves one scripted session on retrieval.
#[derive(Default)]
struct FakeGateway {
    created: Mutex<Vec<CheckoutSessionRequest>>,
    session: Mutex<Option<Value>>,
}

impl FakeGateway {
    fn with_session(session: Value) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            session: Mutex::new(Some(session)),
        }
    }
}

#[async_trait::async_trait]
impl StripeGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        self.created.lock().unwrap().push(request.clone());
        Ok(CheckoutSession {
            session_id: "cs_test_1".to_string(),
            redirect_url: "https://checkout.stripe.com/c/pay/cs_test_1".to_string(),
        })
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<StripeCheckoutSession> {
        let session = self
            .session
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no such checkout session: {session_id}"))?;
        Ok(serde_json::from_value(session)?)
    }
}

struct TestApp {
    router: Router,
    store: Arc<SubscriptionInMemory>,
    stripe: Arc<FakeGateway>,
}

fn app_with(stripe: FakeGateway) -> TestApp {
    let config = config_loader::load_from(|key| {
        let value = match key {
            "SERVER_PORT" => "0",
            "SERVER_BODY_LIMIT" => "1",
            "SERVER_TIMEOUT" => "10",
            "DATABASE_URL" => "postgres://unused",
            "STRIPE_SECRET_KEY" => "sk_test_integration",
            "STRIPE_WEBHOOK_SECRET" => WEBHOOK_SECRET,
            "STRIPE_PROFESSIONAL_MONTHLY_PRICE_ID" => "price_pro_m",
            "STRIPE_PROFESSIONAL_YEARLY_PRICE_ID" => "price_pro_y",
            "STRIPE_ENTERPRISE_MONTHLY_PRICE_ID" => "price_ent_m",
            "STRIPE_ENTERPRISE_YEARLY_PRICE_ID" => "price_ent_y",
            "PUBLIC_BASE_URL" => "https://app.example.com",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap();

    let store = Arc::new(SubscriptionInMemory::new());
    let stripe = Arc::new(stripe);
    let router = build_router(Arc::new(config), Arc::clone(&store), Arc::clone(&stripe)).unwrap();

    TestApp {
        router,
        store,
        stripe,
    }
}

fn app() -> TestApp {
    app_with(FakeGateway::default())
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

async fn get_subscription(router: &Router, user_id: &str) -> Value {
    let request = Request::builder()
        .uri(format!("/api/v1/subscription/{user_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::OK);
    body
}

async fn deliver_webhook(router: &Router, event: &Value, secret: &str) -> (StatusCode, Value) {
    let payload = serde_json::to_vec(event).unwrap();
    let header = WebhookVerifier::new(secret.to_string(), DEFAULT_TOLERANCE_SECS)
        .signature_header(&payload, Utc::now().timestamp());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/payment")
        .header("content-type", "application/json")
        .header("stripe-signature", header)
        .body(Body::from(payload))
        .unwrap();
    send(router, request).await
}

fn checkout_completed(user_id: &str, plan: &str, subscription_ref: &str, created: i64) -> Value {
    json!({
        "id": format!("evt_checkout_{subscription_ref}"),
        "type": "checkout.session.completed",
        "created": created,
        "data": { "object": {
            "id": "cs_test_1",
            "mode": "subscription",
            "status": "complete",
            "payment_status": "paid",
            "customer": "cus_1",
            "subscription": subscription_ref,
            "metadata": { "user_id": user_id, "plan_id": plan, "interval": "MONTHLY" }
        }}
    })
}

fn paid_session(user_id: &str, plan: &str, subscription_ref: &str) -> Value {
    json!({
        "id": "cs_test_1",
        "mode": "subscription",
        "status": "complete",
        "payment_status": "paid",
        "customer": "cus_1",
        "subscription": { "id": subscription_ref, "status": "active", "current_period_end": 1_790_000_000 },
        "metadata": { "user_id": user_id, "plan_id": plan, "interval": "MONTHLY" }
    })
}

fn reconciled_state(view: &Value) -> (Value, Value, Value, Value) {
    (
        view["plan"].clone(),
        view["status"].clone(),
        view["processorCustomerRef"].clone(),
        view["processorSubscriptionRef"].clone(),
    )
}

#[tokio::test]
async fn checkout_then_webhook_activates_the_paid_plan() {
    let app = app();

    let (status, body) = post_json(
        &app.router,
        "/api/v1/checkout/session",
        json!({ "userId": "u1", "planId": "PROFESSIONAL", "interval": "monthly", "userEmail": "u1@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "redirect");
    assert_eq!(body["sessionId"], "cs_test_1");
    assert_eq!(body["redirectUrl"], "https://checkout.stripe.com/c/pay/cs_test_1");

    {
        let created = app.stripe.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].price_ref, "price_pro_m");
        assert_eq!(created[0].metadata.get("user_id").map(String::as_str), Some("u1"));
        assert_eq!(created[0].metadata.get("plan_id").map(String::as_str), Some("PROFESSIONAL"));
    }
    assert!(app.store.is_empty().await);

    let event = checkout_completed("u1", "PROFESSIONAL", "sub_abc", Utc::now().timestamp());
    let (status, body) = deliver_webhook(&app.router, &event, WEBHOOK_SECRET).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));

    let view = get_subscription(&app.router, "u1").await;
    assert_eq!(view["plan"], "PROFESSIONAL");
    assert_eq!(view["status"], "ACTIVE");
    assert_eq!(view["processorSubscriptionRef"], "sub_abc");
    assert_eq!(view["isActive"], true);
}

#[tokio::test]
async fn cancellation_webhook_keeps_the_plan_and_cancels() {
    let app = app();
    let now = Utc::now().timestamp();

    deliver_webhook(
        &app.router,
        &checkout_completed("u2", "ENTERPRISE", "sub_ent", now - 60),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(get_subscription(&app.router, "u2").await["status"], "ACTIVE");

    // No metadata on the subscription: the user is found through the stored ref.
    let deleted = json!({
        "id": "evt_deleted",
        "type": "customer.subscription.deleted",
        "created": now,
        "data": { "object": { "id": "sub_ent", "customer": "cus_1", "status": "canceled" } }
    });
    let (status, _) = deliver_webhook(&app.router, &deleted, WEBHOOK_SECRET).await;
    assert_eq!(status, StatusCode::OK);

    let view = get_subscription(&app.router, "u2").await;
    assert_eq!(view["plan"], "ENTERPRISE");
    assert_eq!(view["status"], "CANCELLED");
    assert_eq!(view["isActive"], false);
}

#[tokio::test]
async fn cancellation_delivered_before_checkout_still_ends_cancelled() {
    let app = app();
    let now = Utc::now().timestamp();

    let deleted = json!({
        "id": "evt_deleted_early",
        "type": "customer.subscription.deleted",
        "created": now,
        "data": { "object": {
            "id": "sub_early",
            "customer": "cus_1",
            "status": "canceled",
            "metadata": { "user_id": "u5", "plan_id": "ENTERPRISE", "interval": "MONTHLY" },
            "items": { "data": [ { "price": { "id": "price_ent_m" } } ] }
        }}
    });
    let (status, _) = deliver_webhook(&app.router, &deleted, WEBHOOK_SECRET).await;
    assert_eq!(status, StatusCode::OK);

    deliver_webhook(
        &app.router,
        &checkout_completed("u5", "ENTERPRISE", "sub_early", now - 30),
        WEBHOOK_SECRET,
    )
    .await;

    let view = get_subscription(&app.router, "u5").await;
    assert_eq!(view["plan"], "ENTERPRISE");
    assert_eq!(view["status"], "CANCELLED");
    assert_eq!(view["processorSubscriptionRef"], "sub_early");
    assert_eq!(view["isActive"], false);
}

#[tokio::test]
async fn verify_and_webhook_converge_in_either_order() {
    let verify_body = json!({ "sessionId": "cs_test_1" });

    let webhook_first = app_with(FakeGateway::with_session(paid_session("u1", "PROFESSIONAL", "sub_abc")));
    let event = checkout_completed("u1", "PROFESSIONAL", "sub_abc", Utc::now().timestamp() - 5);
    deliver_webhook(&webhook_first.router, &event, WEBHOOK_SECRET).await;
    let (status, result) =
        post_json(&webhook_first.router, "/api/v1/checkout/verify", verify_body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result, json!({ "userId": "u1", "plan": "PROFESSIONAL", "status": "ACTIVE" }));

    let verify_first = app_with(FakeGateway::with_session(paid_session("u1", "PROFESSIONAL", "sub_abc")));
    let (status, result) =
        post_json(&verify_first.router, "/api/v1/checkout/verify", verify_body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result, json!({ "userId": "u1", "plan": "PROFESSIONAL", "status": "ACTIVE" }));
    deliver_webhook(&verify_first.router, &event, WEBHOOK_SECRET).await;

    assert_eq!(
        reconciled_state(&get_subscription(&webhook_first.router, "u1").await),
        reconciled_state(&get_subscription(&verify_first.router, "u1").await),
    );
}

#[tokio::test]
async fn verifying_an_unpaid_session_returns_payment_required() {
    let mut session = paid_session("u1", "PROFESSIONAL", "sub_abc");
    session["payment_status"] = json!("unpaid");
    session["status"] = json!("open");
    let app = app_with(FakeGateway::with_session(session));

    let (status, body) =
        post_json(&app.router, "/api/v1/checkout/verify", json!({ "sessionId": "cs_test_1" })).await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "payment_not_completed");
    assert_eq!(body["details"]["currentStatus"], "unpaid");
    assert!(app.store.is_empty().await);
}

#[tokio::test]
async fn duplicate_webhook_delivery_is_a_no_op() {
    let app = app();
    let event = checkout_completed("u1", "PROFESSIONAL", "sub_abc", Utc::now().timestamp());

    deliver_webhook(&app.router, &event, WEBHOOK_SECRET).await;
    let first = get_subscription(&app.router, "u1").await;
    let (status, _) = deliver_webhook(&app.router, &event, WEBHOOK_SECRET).await;
    let second = get_subscription(&app.router, "u1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(app.store.len().await, 1);
}

#[tokio::test]
async fn badly_signed_webhook_is_rejected_without_mutation() {
    let app = app();
    let event = checkout_completed("u1", "PROFESSIONAL", "sub_abc", Utc::now().timestamp());

    let (status, body) = deliver_webhook(&app.router, &event, "whsec_attacker").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_signature");

    let unsigned = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/payment")
        .body(Body::from(event.to_string()))
        .unwrap();
    let (status, _) = send(&app.router, unsigned).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(app.store.is_empty().await);
    let view = get_subscription(&app.router, "u1").await;
    assert_eq!(view["plan"], "STARTER");
    assert_eq!(view["status"], "INACTIVE");
}

#[tokio::test]
async fn free_plan_is_activated_without_the_processor() {
    let app = app();

    let (status, body) = post_json(
        &app.router,
        "/api/v1/checkout/session",
        json!({ "userId": "u3", "planId": "starter", "billingCycle": "Yearly", "userEmail": "u3@example.com" }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "kind": "free_plan_activated", "plan": "STARTER", "status": "ACTIVE" }));
    assert!(app.stripe.created.lock().unwrap().is_empty());

    let view = get_subscription(&app.router, "u3").await;
    assert_eq!(view["plan"], "STARTER");
    assert_eq!(view["status"], "ACTIVE");
}

#[tokio::test]
async fn free_plan_over_a_live_paid_subscription_conflicts() {
    let app = app();
    deliver_webhook(
        &app.router,
        &checkout_completed("u4", "ENTERPRISE", "sub_live", Utc::now().timestamp()),
        WEBHOOK_SECRET,
    )
    .await;

    let (status, body) = post_json(
        &app.router,
        "/api/v1/checkout/session",
        json!({ "userId": "u4", "planId": "STARTER", "interval": "MONTHLY", "userEmail": "u4@example.com" }),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
    assert_eq!(get_subscription(&app.router, "u4").await["plan"], "ENTERPRISE");
}

#[tokio::test]
async fn unknown_plan_is_rejected_with_allowed_values() {
    let app = app();

    let (status, body) = post_json(
        &app.router,
        "/api/v1/checkout/session",
        json!({ "userId": "u1", "planId": "GOLD", "interval": "MONTHLY", "userEmail": "u1@example.com" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
    assert_eq!(body["details"]["field"], "planId");
    assert_eq!(body["details"]["receivedValue"], "GOLD");
    assert!(app.stripe.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_bodies_get_the_json_error_envelope() {
    let app = app();

    for uri in ["/api/v1/checkout/session", "/api/v1/checkout/verify"] {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from("{\"userId\": "))
            .unwrap();
        let (status, body) = send(&app.router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["code"], 400);
        assert_eq!(body["error"], "invalid_input");
        assert_eq!(body["details"]["field"], "body");
    }

    let without_content_type = Request::builder()
        .method("POST")
        .uri("/api/v1/checkout/session")
        .body(Body::from(json!({ "userId": "u1" }).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, without_content_type).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
    assert!(app.stripe.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let app = app();

    let request = Request::builder()
        .uri("/api/v1/does-not-exist")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"NOT_FOUND");
}

#[tokio::test]
async fn health_check_reports_stage() {
    let app = app();

    let request = Request::builder()
        .uri("/api/v1/health-check")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
    assert_eq!(body["stage"], "local");
}
