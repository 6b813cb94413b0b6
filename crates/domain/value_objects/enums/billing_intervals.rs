use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub const ALL: [BillingInterval; 2] = [BillingInterval::Monthly, BillingInterval::Yearly];

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "MONTHLY",
            BillingInterval::Yearly => "YEARLY",
        }
    }

    /// Case-insensitive, exact-token match. Anything else is rejected.
    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str().eq_ignore_ascii_case(value))
    }
}

impl Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
