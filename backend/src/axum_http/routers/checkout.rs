use crate::usecases::{
    checkout::{CheckoutUseCase, RedirectDefaults},
    session_verify::SessionVerifyUseCase,
    subscriptions::{StripeGateway, SubscriptionError},
};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use crates::domain::{
    repositories::subscriptions::SubscriptionRepository,
    value_objects::{
        plans::PlanCatalog,
        subscriptions::{CreateCheckoutRequest, VerifySessionRequest},
    },
};
use std::sync::Arc;
use tracing::warn;

pub fn routes<S, G>(
    subscription_repo: Arc<S>,
    stripe_client: Arc<G>,
    catalog: Arc<PlanCatalog>,
    redirects: RedirectDefaults,
) -> Router
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    let checkout_usecase = CheckoutUseCase::new(
        Arc::clone(&subscription_repo),
        Arc::clone(&stripe_client),
        catalog,
        redirects,
    );
    let verify_usecase = SessionVerifyUseCase::new(subscription_repo, stripe_client);

    Router::new()
        .route(
            "/session",
            post(create_checkout_session::<S, G>).with_state(Arc::new(checkout_usecase)),
        )
        .route(
            "/verify",
            post(verify_checkout_session::<S, G>).with_state(Arc::new(verify_usecase)),
        )
}

pub async fn create_checkout_session<S, G>(
    State(usecase): State<Arc<CheckoutUseCase<S, G>>>,
    payload: Result<Json<CreateCheckoutRequest>, JsonRejection>,
) -> impl IntoResponse
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return rejected_body("session", rejection),
    };

    match usecase.initiate(request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn verify_checkout_session<S, G>(
    State(usecase): State<Arc<SessionVerifyUseCase<S, G>>>,
    payload: Result<Json<VerifySessionRequest>, JsonRejection>,
) -> impl IntoResponse
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return rejected_body("verify", rejection),
    };

    match usecase.verify(request).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => err.into_response(),
    }
}

fn rejected_body(route: &'static str, rejection: JsonRejection) -> Response {
    warn!(route, reason = %rejection.body_text(), "checkout: rejected request body");
    SubscriptionError::from(rejection).into_response()
}
