use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    domain::value_objects::{
        enums::{plan_tiers::PlanTier, subscription_statuses::SubscriptionStatus},
        subscriptions::{SubscriptionChange, SubscriptionUpdate},
    },
    infra::db::postgres::schema::subscription_records,
};

/// One record per user. The only state the engine owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecordEntity {
    pub user_id: String,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub processor_customer_ref: Option<String>,
    pub processor_subscription_ref: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Identifiable, Selectable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = subscription_records)]
#[diesel(primary_key(user_id))]
#[diesel(treat_none_as_null = true)]
pub struct SubscriptionRecordRow {
    pub user_id: String,
    pub plan: String,
    pub status: String,
    pub processor_customer_ref: Option<String>,
    pub processor_subscription_ref: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRecordRow> for SubscriptionRecordEntity {
    type Error = anyhow::Error;

    fn try_from(value: SubscriptionRecordRow) -> Result<Self> {
        let plan = PlanTier::from_str(&value.plan)
            .ok_or_else(|| anyhow!("unknown plan {:?} for user {}", value.plan, value.user_id))?;
        let status = SubscriptionStatus::from_str(&value.status).ok_or_else(|| {
            anyhow!("unknown status {:?} for user {}", value.status, value.user_id)
        })?;

        Ok(Self {
            user_id: value.user_id,
            plan,
            status,
            processor_customer_ref: value.processor_customer_ref,
            processor_subscription_ref: value.processor_subscription_ref,
            current_period_end: value.current_period_end,
            updated_at: value.updated_at,
        })
    }
}

impl From<&SubscriptionRecordEntity> for SubscriptionRecordRow {
    fn from(value: &SubscriptionRecordEntity) -> Self {
        Self {
            user_id: value.user_id.clone(),
            plan: value.plan.to_string(),
            status: value.status.to_string(),
            processor_customer_ref: value.processor_customer_ref.clone(),
            processor_subscription_ref: value.processor_subscription_ref.clone(),
            current_period_end: value.current_period_end,
            updated_at: value.updated_at,
        }
    }
}

/// What the store should do with an update after merging it into the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Write(SubscriptionRecordEntity),
    Unchanged,
    Skip(&'static str),
    Conflict(&'static str),
}

impl SubscriptionRecordEntity {
    /// Starting point for a user without a record. `updated_at` sorts before any real
    /// timestamp so the first write is never considered stale.
    pub fn new_default(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            plan: PlanTier::Starter,
            status: SubscriptionStatus::Inactive,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            current_period_end: None,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn satisfies_invariants(&self) -> bool {
        if self.plan.is_free() && self.processor_subscription_ref.is_some() {
            return false;
        }
        if !self.plan.is_free()
            && self.status == SubscriptionStatus::Active
            && (self.processor_customer_ref.is_none() || self.processor_subscription_ref.is_none())
        {
            return false;
        }
        true
    }

    /// Field-wise equality that ignores `updated_at`.
    pub fn same_state_as(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.plan == other.plan
            && self.status == other.status
            && self.processor_customer_ref == other.processor_customer_ref
            && self.processor_subscription_ref == other.processor_subscription_ref
            && self.current_period_end == other.current_period_end
    }

    pub fn holds_live_paid_subscription(&self) -> bool {
        !self.plan.is_free() && self.status.is_live() && self.processor_subscription_ref.is_some()
    }

    fn tracks(&self, subscription_ref: &str) -> bool {
        self.processor_subscription_ref.as_deref() == Some(subscription_ref)
    }

    fn fill_missing(
        &self,
        customer_ref: Option<&String>,
        current_period_end: Option<DateTime<Utc>>,
    ) -> Self {
        let mut next = self.clone();
        if next.processor_customer_ref.is_none() {
            next.processor_customer_ref = customer_ref.cloned();
        }
        if next.current_period_end.is_none() {
            next.current_period_end = current_period_end;
        }
        next
    }
}

/// Merges one typed change into the current record.
///
/// All three writers funnel through here, so the outcome depends only on the
/// record and the change, never on which caller arrived first.
pub fn merge(
    current: Option<&SubscriptionRecordEntity>,
    update: &SubscriptionUpdate,
    now: DateTime<Utc>,
) -> MergeDecision {
    let base = current
        .cloned()
        .unwrap_or_else(|| SubscriptionRecordEntity::new_default(&update.user_id));
    let stale = update
        .observed_at
        .is_some_and(|observed_at| observed_at < base.updated_at);

    let next = match &update.change {
        SubscriptionChange::ActivateFreePlan => {
            if base.holds_live_paid_subscription() {
                return MergeDecision::Conflict("a live paid subscription is still attached");
            }
            SubscriptionRecordEntity {
                plan: PlanTier::Starter,
                status: SubscriptionStatus::Active,
                processor_subscription_ref: None,
                current_period_end: None,
                ..base.clone()
            }
        }
        SubscriptionChange::ActivatePaidPlan {
            plan,
            customer_ref,
            subscription_ref,
            current_period_end,
        } => {
            let same_subscription = base.tracks(subscription_ref);
            let untimestamped = update.observed_at.is_none();
            let fill_only = stale
                || (same_subscription
                    && (untimestamped || base.status == SubscriptionStatus::Cancelled));

            if fill_only {
                if !same_subscription {
                    return MergeDecision::Skip("stale activation for another subscription");
                }
                base.fill_missing(Some(customer_ref), *current_period_end)
            } else {
                if untimestamped && !same_subscription && base.holds_live_paid_subscription() {
                    return MergeDecision::Skip("another live subscription is attached");
                }
                SubscriptionRecordEntity {
                    plan: *plan,
                    status: SubscriptionStatus::Active,
                    processor_customer_ref: Some(customer_ref.clone()),
                    processor_subscription_ref: Some(subscription_ref.clone()),
                    current_period_end: current_period_end.or(if same_subscription {
                        base.current_period_end
                    } else {
                        None
                    }),
                    ..base.clone()
                }
            }
        }
        SubscriptionChange::SyncProcessorSubscription {
            plan,
            status,
            customer_ref,
            subscription_ref,
            current_period_end,
        } => {
            let same_subscription = base.tracks(subscription_ref);
            if !same_subscription && base.holds_live_paid_subscription() {
                return MergeDecision::Skip("another live subscription is attached");
            }
            if same_subscription && base.status == SubscriptionStatus::Cancelled {
                return MergeDecision::Skip("subscription already cancelled");
            }

            if stale {
                if !same_subscription {
                    return MergeDecision::Skip("stale event for another subscription");
                }
                base.fill_missing(customer_ref.as_ref(), *current_period_end)
            } else {
                SubscriptionRecordEntity {
                    plan: plan.unwrap_or(base.plan),
                    status: *status,
                    processor_customer_ref: customer_ref
                        .clone()
                        .or_else(|| base.processor_customer_ref.clone()),
                    processor_subscription_ref: Some(subscription_ref.clone()),
                    current_period_end: current_period_end.or(if same_subscription {
                        base.current_period_end
                    } else {
                        None
                    }),
                    ..base.clone()
                }
            }
        }
        SubscriptionChange::CancelSubscription {
            plan,
            customer_ref,
            subscription_ref,
        } => {
            if base.tracks(subscription_ref) {
                SubscriptionRecordEntity {
                    status: SubscriptionStatus::Cancelled,
                    ..base.clone()
                }
            } else {
                if base.holds_live_paid_subscription() {
                    return MergeDecision::Skip("cancellation for an untracked subscription");
                }
                if stale {
                    return MergeDecision::Skip("stale cancellation for another subscription");
                }
                // Cancellation overtook the activation. Record it so the late
                // activation only fills fields instead of reviving the subscription.
                SubscriptionRecordEntity {
                    plan: plan.unwrap_or(base.plan),
                    status: SubscriptionStatus::Cancelled,
                    processor_customer_ref: customer_ref
                        .clone()
                        .or_else(|| base.processor_customer_ref.clone()),
                    processor_subscription_ref: Some(subscription_ref.clone()),
                    current_period_end: None,
                    ..base.clone()
                }
            }
        }
    };

    if current.is_some() && next.same_state_as(&base) {
        return MergeDecision::Unchanged;
    }
    if !next.satisfies_invariants() {
        return MergeDecision::Skip("result would break record invariants");
    }

    let observed_at = update.observed_at.unwrap_or(now);
    MergeDecision::Write(SubscriptionRecordEntity {
        updated_at: base.updated_at.max(observed_at),
        ..next
    })
}
