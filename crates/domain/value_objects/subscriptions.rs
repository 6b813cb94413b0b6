use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::subscriptions::SubscriptionRecordEntity;
use crate::domain::value_objects::{
    enums::{
        billing_intervals::BillingInterval, plan_tiers::PlanTier,
        subscription_statuses::SubscriptionStatus,
    },
    plans::normalize,
};

/// A typed state transition requested by one of the three writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    ActivateFreePlan,
    ActivatePaidPlan {
        plan: PlanTier,
        customer_ref: String,
        subscription_ref: String,
        current_period_end: Option<DateTime<Utc>>,
    },
    SyncProcessorSubscription {
        plan: Option<PlanTier>,
        status: SubscriptionStatus,
        customer_ref: Option<String>,
        subscription_ref: String,
        current_period_end: Option<DateTime<Utc>>,
    },
    /// `plan` and `customer_ref` are only used when the cancellation arrives
    /// before the record tracks the subscription.
    CancelSubscription {
        plan: Option<PlanTier>,
        customer_ref: Option<String>,
        subscription_ref: String,
    },
}

impl SubscriptionChange {
    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionChange::ActivateFreePlan => "activate_free_plan",
            SubscriptionChange::ActivatePaidPlan { .. } => "activate_paid_plan",
            SubscriptionChange::SyncProcessorSubscription { .. } => "sync_processor_subscription",
            SubscriptionChange::CancelSubscription { .. } => "cancel_subscription",
        }
    }
}

/// Input of the store's single upsert path.
///
/// `observed_at` is the processor's own event timestamp when one exists. Writes
/// without it (session verification, free plan) only know "now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub user_id: String,
    pub change: SubscriptionChange,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEffect {
    Created,
    Updated,
    Unchanged,
    Skipped(&'static str),
    Conflict(&'static str),
}

impl ApplyEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyEffect::Created => "created",
            ApplyEffect::Updated => "updated",
            ApplyEffect::Unchanged => "unchanged",
            ApplyEffect::Skipped(_) => "skipped",
            ApplyEffect::Conflict(_) => "conflict",
        }
    }
}

/// Result of `apply_update`. `record` is the stored state after the call, or
/// `None` when the user has no record and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub record: Option<SubscriptionRecordEntity>,
    pub effect: ApplyEffect,
}

/// Metadata attached to every checkout session. It is the only way the
/// asynchronous webhook learns why a session was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub user_id: String,
    pub plan: PlanTier,
    pub interval: BillingInterval,
    pub user_email: Option<String>,
}

impl CheckoutMetadata {
    pub const USER_ID: &'static str = "user_id";
    pub const PLAN_ID: &'static str = "plan_id";
    pub const INTERVAL: &'static str = "interval";
    pub const USER_EMAIL: &'static str = "user_email";

    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::from([
            (Self::USER_ID.to_string(), self.user_id.clone()),
            (Self::PLAN_ID.to_string(), self.plan.to_string()),
            (Self::INTERVAL.to_string(), self.interval.to_string()),
        ]);
        if let Some(email) = &self.user_email {
            metadata.insert(Self::USER_EMAIL.to_string(), email.clone());
        }
        metadata
    }

    /// Reads the metadata back, returning a reason string when it is unusable.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Result<Self, String> {
        let user_id = metadata
            .get(Self::USER_ID)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "missing user_id in session metadata".to_string())?;
        let raw_plan = metadata
            .get(Self::PLAN_ID)
            .ok_or_else(|| "missing plan_id in session metadata".to_string())?;
        let raw_interval = metadata
            .get(Self::INTERVAL)
            .ok_or_else(|| "missing interval in session metadata".to_string())?;

        let (plan, interval) =
            normalize(raw_plan, raw_interval).map_err(|err| format!("session metadata: {err}"))?;

        Ok(Self {
            user_id: user_id.to_string(),
            plan,
            interval,
            user_email: metadata.get(Self::USER_EMAIL).cloned(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
    #[serde(alias = "billingCycle")]
    pub interval: Option<String>,
    pub user_email: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    #[serde(rename_all = "camelCase")]
    Redirect {
        session_id: String,
        redirect_url: String,
    },
    FreePlanActivated {
        plan: PlanTier,
        status: SubscriptionStatus,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub user_id: String,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
}

impl From<&SubscriptionRecordEntity> for ReconciliationResult {
    fn from(value: &SubscriptionRecordEntity) -> Self {
        Self {
            user_id: value.user_id.clone(),
            plan: value.plan,
            status: value.status,
        }
    }
}

/// Read-only projection served to dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub user_id: String,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub processor_customer_ref: Option<String>,
    pub processor_subscription_ref: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl SubscriptionView {
    /// What a user without any stored record looks like.
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            plan: PlanTier::Starter,
            status: SubscriptionStatus::Inactive,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            current_period_end: None,
            updated_at: None,
            is_active: false,
        }
    }
}

impl From<SubscriptionRecordEntity> for SubscriptionView {
    fn from(value: SubscriptionRecordEntity) -> Self {
        Self {
            is_active: value.status == SubscriptionStatus::Active,
            user_id: value.user_id,
            plan: value.plan,
            status: value.status,
            processor_customer_ref: value.processor_customer_ref,
            processor_subscription_ref: value.processor_subscription_ref,
            current_period_end: value.current_period_end,
            updated_at: Some(value.updated_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

impl WebhookAck {
    pub fn received() -> Self {
        Self { received: true }
    }
}
