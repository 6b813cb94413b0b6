use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Default, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    #[default]
    Inactive,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Inactive => "INACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(SubscriptionStatus::Active),
            "INACTIVE" => Some(SubscriptionStatus::Inactive),
            "PAST_DUE" => Some(SubscriptionStatus::PastDue),
            "CANCELLED" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }

    /// Maps a Stripe subscription status onto the engine's status set.
    pub fn from_processor_status(value: &str) -> Self {
        match value {
            "active" | "trialing" => SubscriptionStatus::Active,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Inactive,
        }
    }

    /// Statuses under which the processor still bills the subscription.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
