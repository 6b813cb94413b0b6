use crate::usecases::subscriptions::SubscriptionUseCase;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use crates::domain::repositories::subscriptions::SubscriptionRepository;
use std::sync::Arc;

pub fn routes<S>(subscription_repo: Arc<S>) -> Router
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    let subscriptions_usecase = SubscriptionUseCase::new(subscription_repo);

    Router::new()
        .route("/:user_id", get(get_subscription::<S>))
        .with_state(Arc::new(subscriptions_usecase))
}

pub async fn get_subscription<S>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<S>>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    match subscriptions_usecase.get_subscription(&user_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}
