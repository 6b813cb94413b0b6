use anyhow::{Context, Result, anyhow, bail};
use crates::{
    domain::value_objects::plans::{PlanCatalog, PlanTierPrices},
    payments::webhook_signature::DEFAULT_TOLERANCE_SECS,
};
use url::Url;

use super::{
    config_model::{BackendServer, Cors, Database, DotEnvyConfig, Stripe},
    stage::Stage,
};

const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";

pub fn load() -> Result<DotEnvyConfig> {
    dotenvy::dotenv().ok();

    load_from(|key| std::env::var(key).ok())
}

/// Builds the configuration from any key lookup. Every missing or malformed
/// required value aborts with the variable name in the error.
pub fn load_from<F>(lookup: F) -> Result<DotEnvyConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let optional = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let required = |key: &str| optional(key).ok_or_else(|| anyhow!("{key} is missing"));

    let backend_server = BackendServer {
        port: required("SERVER_PORT")?
            .parse()
            .context("SERVER_PORT is invalid")?,
        body_limit: required("SERVER_BODY_LIMIT")?
            .parse()
            .context("SERVER_BODY_LIMIT is invalid")?,
        timeout: required("SERVER_TIMEOUT")?
            .parse()
            .context("SERVER_TIMEOUT is invalid")?,
    };

    let database = Database {
        url: required("DATABASE_URL")?,
    };

    let stripe = Stripe {
        secret_key: required("STRIPE_SECRET_KEY")?,
        webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
        api_base: optional("STRIPE_API_BASE")
            .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string()),
        webhook_tolerance_secs: match optional("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw
                .parse()
                .context("STRIPE_WEBHOOK_TOLERANCE_SECS is invalid")?,
            None => DEFAULT_TOLERANCE_SECS,
        },
    };

    let plan_catalog = PlanCatalog::new(
        PlanTierPrices::new(
            optional("STRIPE_PROFESSIONAL_MONTHLY_PRICE_ID"),
            optional("STRIPE_PROFESSIONAL_YEARLY_PRICE_ID"),
        ),
        PlanTierPrices::new(
            optional("STRIPE_ENTERPRISE_MONTHLY_PRICE_ID"),
            optional("STRIPE_ENTERPRISE_YEARLY_PRICE_ID"),
        ),
    )
    .context("plan catalog is incomplete")?;

    let public_base_url = required("PUBLIC_BASE_URL")?;
    let parsed = Url::parse(&public_base_url).context("PUBLIC_BASE_URL is invalid")?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("PUBLIC_BASE_URL must be an http(s) URL");
    }

    let cors = Cors {
        allowed_origins: optional("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    };

    let stage = match optional("STAGE") {
        Some(raw) => Stage::try_from(raw.as_str()).context("STAGE is invalid")?,
        None => Stage::default(),
    };

    Ok(DotEnvyConfig {
        backend_server,
        database,
        stripe,
        plan_catalog,
        public_base_url: public_base_url.trim_end_matches('/').to_string(),
        cors,
        stage,
    })
}
