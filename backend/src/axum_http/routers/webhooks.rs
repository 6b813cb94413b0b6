use crate::usecases::stripe_webhook::StripeWebhookUseCase;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use crates::{
    domain::{
        repositories::subscriptions::SubscriptionRepository, value_objects::plans::PlanCatalog,
    },
    payments::webhook_signature::WebhookVerifier,
};
use std::sync::Arc;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub fn routes<S>(
    subscription_repo: Arc<S>,
    verifier: WebhookVerifier,
    catalog: Arc<PlanCatalog>,
) -> Router
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    let usecase = StripeWebhookUseCase::new(subscription_repo, verifier, catalog);

    Router::new()
        .route("/payment", post(payment_webhook::<S>))
        .with_state(Arc::new(usecase))
}

/// The body is taken raw: the signature covers the exact bytes received.
pub async fn payment_webhook<S>(
    State(usecase): State<Arc<StripeWebhookUseCase<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match usecase.ingest(&body, signature).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(err) => err.into_response(),
    }
}
