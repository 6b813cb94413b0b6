use std::sync::Arc;

use chrono::{DateTime, Utc};
use crates::{
    domain::{
        repositories::subscriptions::SubscriptionRepository,
        value_objects::{
            enums::{plan_tiers::PlanTier, subscription_statuses::SubscriptionStatus},
            plans::PlanCatalog,
            subscriptions::{
                ApplyEffect, CheckoutMetadata, SubscriptionChange, SubscriptionUpdate, WebhookAck,
            },
        },
    },
    payments::{
        stripe_client::{StripeEvent, StripeSubscription, extract_checkout_session, extract_subscription},
        webhook_signature::WebhookVerifier,
    },
};
use tracing::{debug, error, info, warn};

use super::subscriptions::{PaidActivation, SubscriptionError, UseCaseResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED: &str =
    "checkout.session.async_payment_succeeded";
pub const CUSTOMER_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// Asynchronous reconciliation from processor events.
pub struct StripeWebhookUseCase<S>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    subscription_repo: Arc<S>,
    verifier: WebhookVerifier,
    catalog: Arc<PlanCatalog>,
}

impl<S> StripeWebhookUseCase<S>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    pub fn new(subscription_repo: Arc<S>, verifier: WebhookVerifier, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            subscription_repo,
            verifier,
            catalog,
        }
    }

    /// Rejects only on signature failure. Anything past that is acknowledged so the
    /// processor does not keep redelivering events we cannot act on.
    pub async fn ingest(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> UseCaseResult<WebhookAck> {
        let Some(signature_header) = signature_header else {
            warn!(
                security_event = true,
                payload_bytes = payload.len(),
                "webhook: request without stripe-signature header rejected"
            );
            return Err(SubscriptionError::InvalidSignature);
        };

        if let Err(reason) = self.verifier.verify(payload, signature_header, Utc::now()) {
            warn!(
                security_event = true,
                %reason,
                payload_bytes = payload.len(),
                "webhook: signature verification failed"
            );
            return Err(SubscriptionError::InvalidSignature);
        }

        let event: StripeEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "webhook: signed payload is not a stripe event; acknowledged");
                return Ok(WebhookAck::received());
            }
        };

        let event_id = event.id.clone().unwrap_or_default();
        info!(%event_id, event_type = %event.type_, "webhook: stripe event verified");

        let result = match event.type_.as_str() {
            CHECKOUT_SESSION_COMPLETED | CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED => {
                self.handle_checkout_completed(&event).await
            }
            CUSTOMER_SUBSCRIPTION_UPDATED => self.handle_subscription_updated(&event).await,
            CUSTOMER_SUBSCRIPTION_DELETED => self.handle_subscription_deleted(&event).await,
            _ => {
                debug!(%event_id, event_type = %event.type_, "webhook: unhandled event type");
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(SubscriptionError::Internal(err)) => {
                error!(
                    %event_id,
                    event_type = %event.type_,
                    error = ?err,
                    "webhook: failed to process event"
                );
            }
            Err(err) => {
                warn!(
                    %event_id,
                    event_type = %event.type_,
                    error = %err,
                    "webhook: event could not be applied"
                );
            }
        }

        Ok(WebhookAck::received())
    }

    async fn handle_checkout_completed(&self, event: &StripeEvent) -> UseCaseResult<()> {
        let session = extract_checkout_session(event)
            .map_err(|err| SubscriptionError::CorruptSession(format!("{err:#}")))?;

        if !session.is_payment_completed() {
            info!(
                session_id = %session.id,
                payment_status = %session.payment_status_label(),
                "webhook: checkout session not paid yet; no effect"
            );
            return Ok(());
        }

        let activation =
            PaidActivation::from_session(&session).map_err(SubscriptionError::CorruptSession)?;
        info!(
            session_id = %session.id,
            user_id = %activation.user_id,
            plan = %activation.plan,
            interval = %activation.interval,
            "webhook: checkout session paid"
        );

        self.apply(activation.into_update(event.created_at()), event)
            .await
    }

    async fn handle_subscription_updated(&self, event: &StripeEvent) -> UseCaseResult<()> {
        let subscription = extract_subscription(event)
            .map_err(|err| SubscriptionError::CorruptSession(format!("{err:#}")))?;
        let user_id = self.resolve_user(&subscription).await?;

        let status = SubscriptionStatus::from_processor_status(
            subscription.status.as_deref().unwrap_or_default(),
        );

        self.apply(
            SubscriptionUpdate {
                user_id,
                change: SubscriptionChange::SyncProcessorSubscription {
                    plan: self.plan_for(&subscription),
                    status,
                    customer_ref: subscription.customer_id().map(str::to_string),
                    subscription_ref: subscription.id.clone(),
                    current_period_end: subscription.period_end(),
                },
                observed_at: event.created_at(),
            },
            event,
        )
        .await
    }

    async fn handle_subscription_deleted(&self, event: &StripeEvent) -> UseCaseResult<()> {
        let subscription = extract_subscription(event)
            .map_err(|err| SubscriptionError::CorruptSession(format!("{err:#}")))?;
        let user_id = self.resolve_user(&subscription).await?;

        self.apply(
            SubscriptionUpdate {
                user_id,
                change: SubscriptionChange::CancelSubscription {
                    plan: self.plan_for(&subscription),
                    customer_ref: subscription.customer_id().map(str::to_string),
                    subscription_ref: subscription.id.clone(),
                },
                observed_at: event.created_at(),
            },
            event,
        )
        .await
    }

    /// Price-based lookup first, so plan changes made on the processor side are picked up.
    fn plan_for(&self, subscription: &StripeSubscription) -> Option<PlanTier> {
        subscription
            .price_id()
            .and_then(|price_id| self.catalog.plan_for_price(price_id))
            .map(|(plan, _)| plan)
            .or_else(|| {
                subscription
                    .metadata
                    .get(CheckoutMetadata::PLAN_ID)
                    .and_then(|raw| PlanTier::from_str(raw))
            })
    }

    async fn resolve_user(&self, subscription: &StripeSubscription) -> UseCaseResult<String> {
        if let Some(user_id) = subscription
            .metadata
            .get(CheckoutMetadata::USER_ID)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
        {
            return Ok(user_id.to_string());
        }

        self.subscription_repo
            .find_user_id_by_subscription_ref(&subscription.id)
            .await
            .map_err(SubscriptionError::Internal)?
            .ok_or_else(|| {
                SubscriptionError::CorruptSession(format!(
                    "no user is linked to subscription {}",
                    subscription.id
                ))
            })
    }

    async fn apply(&self, update: SubscriptionUpdate, event: &StripeEvent) -> UseCaseResult<()> {
        let user_id = update.user_id.clone();
        let change = update.change.kind();
        let observed_at: Option<DateTime<Utc>> = update.observed_at;

        let outcome = self
            .subscription_repo
            .apply_update(update)
            .await
            .map_err(SubscriptionError::Internal)?;

        match outcome.effect {
            ApplyEffect::Created | ApplyEffect::Updated => info!(
                %user_id,
                change,
                event_type = %event.type_,
                effect = outcome.effect.as_str(),
                "webhook: subscription record updated"
            ),
            ApplyEffect::Unchanged => debug!(
                %user_id,
                change,
                event_type = %event.type_,
                "webhook: event already reflected"
            ),
            ApplyEffect::Skipped(reason) => info!(
                %user_id,
                change,
                reason,
                observed_at = ?observed_at,
                "webhook: event skipped"
            ),
            ApplyEffect::Conflict(reason) => warn!(
                %user_id,
                change,
                reason,
                "webhook: event conflicts with stored record"
            ),
        }

        Ok(())
    }
}
