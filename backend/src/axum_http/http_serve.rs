use crate::{
    axum_http::{default_routers, routers},
    config::config_model::DotEnvyConfig,
    usecases::{checkout::RedirectDefaults, subscriptions::StripeGateway},
};
use anyhow::{Context, Result};
use axum::{
    Router,
    http::{
        HeaderName, HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::get,
};
use crates::{
    domain::repositories::subscriptions::SubscriptionRepository,
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::subscriptions::SubscriptionPostgres,
    },
    payments::{stripe_client::StripeClient, webhook_signature::WebhookVerifier},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info};

pub async fn start(config: Arc<DotEnvyConfig>, db_pool: Arc<PgPoolSquad>) -> Result<()> {
    let subscription_repo = Arc::new(SubscriptionPostgres::new(Arc::clone(&db_pool)));
    let stripe_client = Arc::new(StripeClient::new(
        config.stripe.secret_key.clone(),
        config.stripe.api_base.clone(),
    ));

    let app = build_router(Arc::clone(&config), subscription_repo, stripe_client)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.backend_server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind port {}", config.backend_server.port))?;

    info!(
        port = config.backend_server.port,
        stage = %config.stage,
        "Server is running"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wires every route against the given store and processor gateway.
pub fn build_router<S, G>(
    config: Arc<DotEnvyConfig>,
    subscription_repo: Arc<S>,
    stripe_client: Arc<G>,
) -> Result<Router>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    let catalog = Arc::new(config.plan_catalog.clone());
    let verifier = WebhookVerifier::new(
        config.stripe.webhook_secret.clone(),
        config.stripe.webhook_tolerance_secs,
    );

    let app = Router::new()
        .fallback(default_routers::not_found)
        .nest(
            "/api/v1/checkout",
            routers::checkout::routes(
                Arc::clone(&subscription_repo),
                stripe_client,
                Arc::clone(&catalog),
                RedirectDefaults::new(&config.public_base_url),
            ),
        )
        .nest(
            "/api/v1/webhooks",
            routers::webhooks::routes(Arc::clone(&subscription_repo), verifier, catalog),
        )
        .nest(
            "/api/v1/subscription",
            routers::subscriptions::routes(subscription_repo),
        )
        .route(
            "/api/v1/health-check",
            get(default_routers::health_check).with_state(config.stage),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.backend_server.timeout,
        )))
        .layer(RequestBodyLimitLayer::new(
            (config.backend_server.body_limit * 1024 * 1024).try_into()?,
        ))
        .layer(cors_layer(&config.cors.allowed_origins)?)
        .layer(TraceLayer::new_for_http());

    Ok(app)
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static(routers::webhooks::STRIPE_SIGNATURE_HEADER),
        ]);

    if allowed_origins.is_empty() {
        return Ok(cors.allow_origin(Any));
    }

    let origins = allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid CORS origin {origin:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(cors.allow_origin(AllowOrigin::list(origins)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = ?err, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = ?err, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
