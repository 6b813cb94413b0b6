use std::sync::Arc;

use anyhow::anyhow;
use crates::domain::{
    repositories::subscriptions::SubscriptionRepository,
    value_objects::{
        plans::InvalidInput,
        subscriptions::{ApplyEffect, ReconciliationResult, VerifySessionRequest},
    },
};
use tracing::{error, info, warn};

use super::subscriptions::{
    PaidActivation, StripeGateway, SubscriptionError, UseCaseResult,
};

/// Synchronous reconciliation triggered by the client after the redirect back.
pub struct SessionVerifyUseCase<S, G>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    subscription_repo: Arc<S>,
    stripe_client: Arc<G>,
}

impl<S, G> SessionVerifyUseCase<S, G>
where
    S: SubscriptionRepository + Send + Sync + 'static,
    G: StripeGateway + 'static,
{
    pub fn new(subscription_repo: Arc<S>, stripe_client: Arc<G>) -> Self {
        Self {
            subscription_repo,
            stripe_client,
        }
    }

    pub async fn verify(&self, request: VerifySessionRequest) -> UseCaseResult<ReconciliationResult> {
        let session_id = parse_session_id(request.session_id.as_deref())?;
        info!(%session_id, "verify: retrieving checkout session");

        let session = self
            .stripe_client
            .retrieve_checkout_session(&session_id)
            .await
            .map_err(|err| {
                error!(
                    %session_id,
                    stripe_error = ?err,
                    "verify: failed to retrieve stripe checkout session"
                );
                SubscriptionError::Processor(err)
            })?;

        if !session.is_payment_completed() {
            let current_status = session.payment_status_label();
            info!(%session_id, %current_status, "verify: payment not completed");
            return Err(SubscriptionError::PaymentNotCompleted { current_status });
        }

        let activation = PaidActivation::from_session(&session).map_err(|reason| {
            warn!(%session_id, %reason, "verify: corrupt checkout session");
            SubscriptionError::CorruptSession(reason)
        })?;
        let user_id = activation.user_id.clone();
        let interval = activation.interval;

        let outcome = self
            .subscription_repo
            .apply_update(activation.into_update(None))
            .await
            .map_err(|err| {
                error!(
                    %session_id,
                    %user_id,
                    db_error = ?err,
                    "verify: failed to apply paid activation"
                );
                SubscriptionError::Internal(err)
            })?;

        match outcome.effect {
            ApplyEffect::Skipped(reason) | ApplyEffect::Conflict(reason) => {
                info!(%session_id, %user_id, reason, "verify: activation not applied");
            }
            effect => {
                info!(
                    %session_id,
                    %user_id,
                    %interval,
                    effect = effect.as_str(),
                    "verify: reconciled"
                );
            }
        }

        let record = outcome.record.ok_or_else(|| {
            SubscriptionError::Internal(anyhow!(
                "no subscription record for user {user_id} after verifying session {session_id}"
            ))
        })?;

        Ok(ReconciliationResult::from(&record))
    }
}

/// Session ids are interpolated into the processor URL path.
fn parse_session_id(raw: Option<&str>) -> UseCaseResult<String> {
    let session_id = raw.map(str::trim).unwrap_or_default();
    let well_formed = !session_id.is_empty()
        && session_id.len() <= 255
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if well_formed {
        Ok(session_id.to_string())
    } else {
        Err(InvalidInput::new("sessionId", session_id, vec!["checkout session id"]).into())
    }
}
