use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Starter,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [
        PlanTier::Starter,
        PlanTier::Professional,
        PlanTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "STARTER",
            PlanTier::Professional => "PROFESSIONAL",
            PlanTier::Enterprise => "ENTERPRISE",
        }
    }

    /// Case-insensitive, exact-token match. Anything else is rejected.
    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|plan| plan.as_str().eq_ignore_ascii_case(value))
    }

    /// The zero-cost tier never has a processor-side subscription.
    pub fn is_free(&self) -> bool {
        matches!(self, PlanTier::Starter)
    }
}

impl Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
