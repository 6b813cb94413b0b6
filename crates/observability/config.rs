use std::env;
use tracing::Level;
use url::Url;

#[derive(Clone, Debug)]
pub(crate) struct ServiceContext {
    pub(crate) service_name: String,
    pub(crate) environment: String,
    pub(crate) component: String,
}

#[derive(Clone, Debug)]
pub(crate) struct DiscordConfig {
    pub(crate) webhook_url: Url,
    pub(crate) min_level: Level,
}

#[derive(Clone, Debug)]
pub(crate) struct ObservabilityConfig {
    pub(crate) service_context: ServiceContext,
    pub(crate) discord: Option<DiscordConfig>,
    /// Parse warnings, logged once tracing is up.
    pub(crate) warnings: Vec<String>,
}

impl ObservabilityConfig {
    pub(crate) fn from_env(component: &str) -> Self {
        Self::from_lookup(component, |key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(component: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let component = component.trim().to_string();

        let service_context = ServiceContext {
            service_name: non_empty("SERVICE_NAME")
                .unwrap_or_else(|| "subscription-reconciler".to_string()),
            environment: non_empty("STAGE").unwrap_or_else(|| "unknown".to_string()),
            component,
        };

        let mut warnings = Vec::new();
        let discord = discord_from_lookup(&non_empty, &mut warnings);

        Self {
            service_context,
            discord,
            warnings,
        }
    }
}

fn discord_from_lookup<F>(lookup: &F, warnings: &mut Vec<String>) -> Option<DiscordConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let enabled = match lookup("DISCORD_NOTIFY_ENABLED") {
        Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
            warnings.push(format!(
                "DISCORD_NOTIFY_ENABLED is not a boolean (value: {raw}); treating as enabled"
            ));
            true
        }),
        None => true,
    };
    if !enabled {
        return None;
    }

    let raw_url = lookup("DISCORD_WEBHOOK_URL")?;
    let webhook_url = match Url::parse(raw_url.trim()) {
        Ok(url) => url,
        Err(err) => {
            // The URL embeds a token, so only the parse error is reported.
            warnings.push(format!(
                "DISCORD_WEBHOOK_URL is set but invalid; Discord notifications disabled (parse error: {err})"
            ));
            return None;
        }
    };

    let min_level = match lookup("DISCORD_NOTIFY_LEVEL") {
        Some(raw) => parse_level(&raw).unwrap_or_else(|| {
            warnings.push(format!(
                "DISCORD_NOTIFY_LEVEL is invalid (value: {raw}); defaulting to ERROR"
            ));
            Level::ERROR
        }),
        None => Level::ERROR,
    };

    Some(DiscordConfig {
        webhook_url,
        min_level,
    })
}

fn parse_level(input: &str) -> Option<Level> {
    match input.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
