use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use crates::{
    domain::{
        repositories::subscriptions::SubscriptionRepository,
        value_objects::{
            enums::{billing_intervals::BillingInterval, plan_tiers::PlanTier},
            plans::InvalidInput,
            subscriptions::{
                CheckoutMetadata, SubscriptionChange, SubscriptionUpdate, SubscriptionView,
            },
        },
    },
    payments::stripe_client::{
        CheckoutSession, CheckoutSessionRequest, StripeCheckoutSession, StripeClient,
    },
};
use thiserror::Error;
use tracing::{error, info};

/// The two processor calls the engine makes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StripeGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> AnyResult<CheckoutSession>;

    async fn retrieve_checkout_session(&self, session_id: &str)
    -> AnyResult<StripeCheckoutSession>;
}

#[async_trait]
impl StripeGateway for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> AnyResult<CheckoutSession> {
        self.create_checkout_session(request).await
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> AnyResult<StripeCheckoutSession> {
        self.retrieve_checkout_session(session_id).await
    }
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("webhook signature verification failed")]
    InvalidSignature,
    #[error("payment has not been completed (status: {current_status})")]
    PaymentNotCompleted { current_status: String },
    #[error("checkout session cannot be reconciled: {0}")]
    CorruptSession(String),
    #[error("subscription change refused: {0}")]
    Conflict(String),
    #[error("payment processor request failed")]
    Processor(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SubscriptionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscriptionError::InvalidInput(_)
            | SubscriptionError::MissingField(_)
            | SubscriptionError::InvalidSignature => StatusCode::BAD_REQUEST,
            SubscriptionError::PaymentNotCompleted { .. } => StatusCode::PAYMENT_REQUIRED,
            SubscriptionError::CorruptSession(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SubscriptionError::Conflict(_) => StatusCode::CONFLICT,
            SubscriptionError::Processor(_) => StatusCode::BAD_GATEWAY,
            SubscriptionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SubscriptionError::InvalidInput(_) => "invalid_input",
            SubscriptionError::MissingField(_) => "missing_field",
            SubscriptionError::InvalidSignature => "invalid_signature",
            SubscriptionError::PaymentNotCompleted { .. } => "payment_not_completed",
            SubscriptionError::CorruptSession(_) => "corrupt_session",
            SubscriptionError::Conflict(_) => "conflict",
            SubscriptionError::Processor(_) => "processor_error",
            SubscriptionError::Internal(_) => "internal_error",
        }
    }
}

pub type UseCaseResult<T> = std::result::Result<T, SubscriptionError>;

/// Trims a request field and rejects it when absent or blank.
pub(crate) fn required(value: Option<&str>, field: &'static str) -> UseCaseResult<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(SubscriptionError::MissingField(field))
}

/// A completed paid checkout, as both the verifier and the webhook see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PaidActivation {
    pub(crate) user_id: String,
    pub(crate) plan: PlanTier,
    pub(crate) interval: BillingInterval,
    pub(crate) customer_ref: String,
    pub(crate) subscription_ref: String,
    pub(crate) current_period_end: Option<DateTime<Utc>>,
}

impl PaidActivation {
    pub(crate) fn from_session(session: &StripeCheckoutSession) -> Result<Self, String> {
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| format!("session {} has no metadata", session.id))?;
        let metadata = CheckoutMetadata::from_metadata(metadata)?;

        if let Some(mode) = session.mode.as_deref().filter(|mode| *mode != "subscription") {
            return Err(format!(
                "session {} is a {mode} session, not a subscription",
                session.id
            ));
        }
        if let Some(reference) = session
            .client_reference_id
            .as_deref()
            .filter(|reference| *reference != metadata.user_id)
        {
            return Err(format!(
                "session {} references user {reference} but its metadata names {}",
                session.id, metadata.user_id
            ));
        }
        if metadata.plan.is_free() {
            return Err(format!(
                "session {} was created for the free plan",
                session.id
            ));
        }

        let customer_ref = session
            .customer_id()
            .ok_or_else(|| format!("session {} has no customer", session.id))?;
        let subscription_ref = session
            .subscription_id()
            .ok_or_else(|| format!("session {} has no subscription", session.id))?;

        Ok(Self {
            user_id: metadata.user_id,
            plan: metadata.plan,
            interval: metadata.interval,
            customer_ref: customer_ref.to_string(),
            subscription_ref: subscription_ref.to_string(),
            current_period_end: session
                .subscription()
                .and_then(|subscription| subscription.period_end()),
        })
    }

    pub(crate) fn into_update(self, observed_at: Option<DateTime<Utc>>) -> SubscriptionUpdate {
        SubscriptionUpdate {
            user_id: self.user_id,
            change: SubscriptionChange::ActivatePaidPlan {
                plan: self.plan,
                customer_ref: self.customer_ref,
                subscription_ref: self.subscription_ref,
                current_period_end: self.current_period_end,
            },
            observed_at,
        }
    }
}

/// Read side of the store.
pub struct SubscriptionUseCase<S>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    subscription_repo: Arc<S>,
}

impl<S> SubscriptionUseCase<S>
where
    S: SubscriptionRepository + Send + Sync + 'static,
{
    pub fn new(subscription_repo: Arc<S>) -> Self {
        Self { subscription_repo }
    }

    pub async fn get_subscription(&self, user_id: &str) -> UseCaseResult<SubscriptionView> {
        let user_id = required(Some(user_id), "userId")?;
        info!(%user_id, "subscriptions: loading subscription record");

        let record = self
            .subscription_repo
            .find_by_user_id(&user_id)
            .await
            .map_err(|err| {
                error!(
                    %user_id,
                    db_error = ?err,
                    "subscriptions: failed to load subscription record"
                );
                SubscriptionError::Internal(err)
            })?;

        Ok(match record {
            Some(record) => SubscriptionView::from(record),
            None => {
                info!(%user_id, "subscriptions: no record, serving defaults");
                SubscriptionView::default_for(&user_id)
            }
        })
    }
}
