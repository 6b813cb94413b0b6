use std::sync::Arc;

use anyhow::anyhow;
use crates::{
    domain::{
        repositories::subscriptions::SubscriptionRepository,
        value_objects::{
            enums::{plan_tiers::PlanTier, subscription_statuses::SubscriptionStatus},
            plans::{InvalidInput, PlanCatalog, normalize},
            subscriptions::{
                ApplyEffect, CheckoutMetadata, CheckoutOutcome, CreateCheckoutRequest,
                SubscriptionChange, SubscriptionUpdate,
            },
        },
    },
    payments::stripe_client::CheckoutSessionRequest,
};
use tracing::{error, info, warn};
use url::Url;

use super::subscriptions::{StripeGateway, SubscriptionError, UseCaseResult, required};

pub const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

/// Where the processor sends the customer back to when the caller does not say.
#[derive(Debug, Clone)]
pub struct RedirectDefaults {
    public_base_url: String,
}

impl RedirectDefaults {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn success_url(&self, supplied: Option<&str>) -> UseCaseResult<String> {
        match supplied.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => {
                validate_redirect("successUrl", url)?;
                Ok(with_session_placeholder(url))
            }
            None => Ok(format!(
                "{}/checkout/success?session_id={SESSION_ID_PLACEHOLDER}",
                self.public_base_url
            )),
        }
    }

    fn cancel_url(&self, supplied: Option<&str>) -> UseCaseResult<String> {
        match supplied.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => {
                validate_redirect("cancelUrl", url)?;
                Ok(url.to_string())
            }
            None => Ok(format!("{}/pricing", self.public_base_url)),
        }
    }
}

fn validate_redirect(field: &'static str, raw: &str) -> UseCaseResult<()> {
    let valid = Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(InvalidInput::new(field, raw, vec!["absolute http(s) URL"]).into())
    }
}

/// Appends `session_id={CHECKOUT_SESSION_ID}` unless the caller already placed it.
/// The placeholder must reach the processor unencoded, so this works on the raw string.
fn with_session_placeholder(url: &str) -> String {
    if url.contains(SESSION_ID_PLACEHOLDER) {
        return url.to_string();
    }

    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut out = format!("{base}{separator}session_id={SESSION_ID_PLACEHOLDER}");
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

pub struct CheckoutUseCase<S, G>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    subscription_repo: Arc<S>,
    stripe_client: Arc<G>,
    catalog: Arc<PlanCatalog>,
    redirects: RedirectDefaults,
}

impl<S, G> CheckoutUseCase<S, G>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    pub fn new(
        subscription_repo: Arc<S>,
        stripe_client: Arc<G>,
        catalog: Arc<PlanCatalog>,
        redirects: RedirectDefaults,
    ) -> Self {
        Self {
            subscription_repo,
            stripe_client,
            catalog,
            redirects,
        }
    }

    pub async fn initiate(&self, request: CreateCheckoutRequest) -> UseCaseResult<CheckoutOutcome> {
        let user_id = required(request.user_id.as_deref(), "userId")?;
        let raw_plan = required(request.plan_id.as_deref(), "planId")?;
        let raw_interval = required(request.interval.as_deref(), "interval")?;
        let user_email = required(request.user_email.as_deref(), "userEmail")?;

        let (plan, interval) = normalize(&raw_plan, &raw_interval).map_err(|err| {
            warn!(
                %user_id,
                field = err.field,
                received_value = %err.received_value,
                "checkout: rejected plan selection"
            );
            SubscriptionError::InvalidInput(err)
        })?;

        info!(%user_id, %plan, %interval, "checkout: initiating");

        if plan.is_free() {
            return self.activate_free_plan(user_id).await;
        }

        let success_url = self.redirects.success_url(request.success_url.as_deref())?;
        let cancel_url = self.redirects.cancel_url(request.cancel_url.as_deref())?;

        let price_ref = self.catalog.resolve(plan, interval).ok_or_else(|| {
            error!(%user_id, %plan, %interval, "checkout: no price configured");
            SubscriptionError::Internal(anyhow!("no price configured for {plan}/{interval}"))
        })?;

        let metadata = CheckoutMetadata {
            user_id: user_id.clone(),
            plan,
            interval,
            user_email: Some(user_email.clone()),
        };

        let session = self
            .stripe_client
            .create_checkout_session(&CheckoutSessionRequest {
                price_ref: price_ref.to_string(),
                user_email,
                client_reference_id: user_id.clone(),
                success_url,
                cancel_url,
                metadata: metadata.to_metadata(),
            })
            .await
            .map_err(|err| {
                error!(
                    %user_id,
                    %plan,
                    %interval,
                    stripe_error = ?err,
                    "checkout: failed to create stripe checkout session"
                );
                SubscriptionError::Processor(err)
            })?;

        info!(
            %user_id,
            session_id = %session.session_id,
            "checkout: stripe checkout session created"
        );

        Ok(CheckoutOutcome::Redirect {
            session_id: session.session_id,
            redirect_url: session.redirect_url,
        })
    }

    async fn activate_free_plan(&self, user_id: String) -> UseCaseResult<CheckoutOutcome> {
        let outcome = self
            .subscription_repo
            .apply_update(SubscriptionUpdate {
                user_id: user_id.clone(),
                change: SubscriptionChange::ActivateFreePlan,
                observed_at: None,
            })
            .await
            .map_err(|err| {
                error!(
                    %user_id,
                    db_error = ?err,
                    "checkout: failed to activate free plan"
                );
                SubscriptionError::Internal(err)
            })?;

        match outcome.effect {
            ApplyEffect::Created | ApplyEffect::Updated | ApplyEffect::Unchanged => {
                info!(
                    %user_id,
                    effect = outcome.effect.as_str(),
                    "checkout: free plan active"
                );
                Ok(CheckoutOutcome::FreePlanActivated {
                    plan: PlanTier::Starter,
                    status: SubscriptionStatus::Active,
                })
            }
            ApplyEffect::Conflict(reason) | ApplyEffect::Skipped(reason) => {
                warn!(%user_id, reason, "checkout: free plan activation refused");
                Err(SubscriptionError::Conflict(reason.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usecases::subscriptions::MockStripeGateway;
    use crates::{
        domain::{
            repositories::subscriptions::MockSubscriptionRepository,
            value_objects::{
                enums::billing_intervals::BillingInterval, plans::PlanTierPrices,
                subscriptions::ApplyOutcome,
            },
        },
        payments::stripe_client::CheckoutSession,
    };

    fn catalog() -> Arc<PlanCatalog> {
        Arc::new(
            PlanCatalog::new(
                PlanTierPrices::new(Some("price_pro_m".into()), Some("price_pro_y".into())),
                PlanTierPrices::new(Some("price_ent_m".into()), Some("price_ent_y".into())),
            )
            .unwrap(),
        )
    }

    fn request(plan: &str, interval: &str) -> CreateCheckoutRequest {
        CreateCheckoutRequest {
            user_id: Some("u1".to_string()),
            plan_id: Some(plan.to_string()),
            interval: Some(interval.to_string()),
            user_email: Some("u1@example.com".to_string()),
            ..Default::default()
        }
    }

    fn usecase(
        repo: MockSubscriptionRepository,
        stripe: MockStripeGateway,
    ) -> CheckoutUseCase<MockSubscriptionRepository, MockStripeGateway> {
        CheckoutUseCase::new(
            Arc::new(repo),
            Arc::new(stripe),
            catalog(),
            RedirectDefaults::new("https://app.example.com/"),
        )
    }

    #[tokio::test]
    async fn paid_plan_creates_a_session_with_canonical_metadata() {
        let mut stripe = MockStripeGateway::new();
        stripe
            .expect_create_checkout_session()
            .withf(|request| {
                request.price_ref == "price_pro_m"
                    && request.client_reference_id == "u1"
                    && request.user_email == "u1@example.com"
                    && request.metadata.get("plan_id").map(String::as_str) == Some("PROFESSIONAL")
                    && request.metadata.get("interval").map(String::as_str) == Some("MONTHLY")
                    && request.success_url
                        == "https://app.example.com/checkout/success?session_id={CHECKOUT_SESSION_ID}"
                    && request.cancel_url == "https://app.example.com/pricing"
            })
            .times(1)
            .returning(|_| {
                Ok(CheckoutSession {
                    session_id: "cs_1".to_string(),
                    redirect_url: "https://checkout.stripe.com/c/cs_1".to_string(),
                })
            });

        let outcome = usecase(MockSubscriptionRepository::new(), stripe)
            .initiate(request("professional", "monthly"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CheckoutOutcome::Redirect {
                session_id: "cs_1".to_string(),
                redirect_url: "https://checkout.stripe.com/c/cs_1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn free_plan_never_calls_the_processor() {
        let mut repo = MockSubscriptionRepository::new();
        repo.expect_apply_update()
            .withf(|update| update.change == SubscriptionChange::ActivateFreePlan)
            .times(1)
            .returning(|_| {
                Box::pin(async {
                    Ok(ApplyOutcome {
                        record: None,
                        effect: ApplyEffect::Created,
                    })
                })
            });
        let mut stripe = MockStripeGateway::new();
        stripe.expect_create_checkout_session().never();

        let outcome = usecase(repo, stripe)
            .initiate(request("Starter", "YEARLY"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CheckoutOutcome::FreePlanActivated {
                plan: PlanTier::Starter,
                status: SubscriptionStatus::Active,
            }
        );
    }

    #[tokio::test]
    async fn free_plan_conflict_surfaces_as_409() {
        let mut repo = MockSubscriptionRepository::new();
        repo.expect_apply_update().returning(|_| {
            Box::pin(async {
                Ok(ApplyOutcome {
                    record: None,
                    effect: ApplyEffect::Conflict("a live paid subscription is still attached"),
                })
            })
        });

        let err = usecase(repo, MockStripeGateway::new())
            .initiate(request("STARTER", "MONTHLY"))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_before_any_side_effect() {
        let err = usecase(MockSubscriptionRepository::new(), MockStripeGateway::new())
            .initiate(request("premium", "monthly"))
            .await
            .unwrap_err();

        match err {
            SubscriptionError::InvalidInput(invalid) => {
                assert_eq!(invalid.field, "planId");
                assert_eq!(invalid.received_value, "premium");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_email_is_reported_by_name() {
        let mut req = request("PROFESSIONAL", "MONTHLY");
        req.user_email = Some("   ".to_string());

        let err = usecase(MockSubscriptionRepository::new(), MockStripeGateway::new())
            .initiate(req)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::MissingField("userEmail")));
    }

    #[tokio::test]
    async fn processor_failure_maps_to_bad_gateway() {
        let mut stripe = MockStripeGateway::new();
        stripe
            .expect_create_checkout_session()
            .returning(|_| Err(anyhow!("stripe is down")));

        let err = usecase(MockSubscriptionRepository::new(), stripe)
            .initiate(request("ENTERPRISE", "YEARLY"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Processor(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn relative_success_url_is_rejected() {
        let mut req = request("ENTERPRISE", "MONTHLY");
        req.success_url = Some("/checkout/done".to_string());

        let err = usecase(MockSubscriptionRepository::new(), MockStripeGateway::new())
            .initiate(req)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::InvalidInput(ref invalid) if invalid.field == "successUrl"));
    }

    #[test]
    fn session_placeholder_is_appended_once() {
        assert_eq!(
            with_session_placeholder("https://app.example.com/done"),
            "https://app.example.com/done?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            with_session_placeholder("https://app.example.com/done?ref=mail#top"),
            "https://app.example.com/done?ref=mail&session_id={CHECKOUT_SESSION_ID}#top"
        );
        assert_eq!(
            with_session_placeholder("https://app.example.com/done?id={CHECKOUT_SESSION_ID}"),
            "https://app.example.com/done?id={CHECKOUT_SESSION_ID}"
        );
    }

    #[test]
    fn catalog_resolves_every_paid_combination() {
        let catalog = catalog();
        for plan in [PlanTier::Professional, PlanTier::Enterprise] {
            for interval in BillingInterval::ALL {
                assert!(catalog.resolve(plan, interval).is_some());
            }
        }
    }
}
