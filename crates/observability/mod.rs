mod config;
mod discord;
mod layer;
mod notifier;

use anyhow::Result;
use config::ObservabilityConfig;
use discord::DiscordWebhookProvider;
use layer::ErrorNotifyLayer;
use notifier::Notifier;
use std::sync::Arc;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`), local-time
/// RFC3339 timestamps, and the optional Discord sink for errors and security events.
///
/// Must run inside a tokio runtime when Discord is configured.
pub fn init_observability(component: &str) -> Result<()> {
    let mut config = ObservabilityConfig::from_env(component);

    let notify_layer = match config.discord.as_ref() {
        Some(discord) => match DiscordWebhookProvider::new(discord.webhook_url.clone()) {
            Ok(provider) => Some(ErrorNotifyLayer::new(
                Notifier::new(vec![Arc::new(provider)]),
                config.service_context.clone(),
                discord.min_level,
            )),
            Err(err) => {
                config
                    .warnings
                    .push(format!("Discord notifications disabled: {err:#}"));
                None
            }
        },
        None => None,
    };
    let discord_enabled = notify_layer.is_some();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Local time so `TZ` is reflected in log timestamps.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(notify_layer)
        .with(env_filter)
        .try_init()?;

    for warning in &config.warnings {
        warn!(
            service = %config.service_context.service_name,
            environment = %config.service_context.environment,
            component = %config.service_context.component,
            warning = %warning,
            "observability: config warning"
        );
    }

    info!(
        service = %config.service_context.service_name,
        environment = %config.service_context.environment,
        component = %config.service_context.component,
        discord_enabled,
        "observability: initialized"
    );

    Ok(())
}
