use serde::Serialize;
use thiserror::Error;

use crate::domain::value_objects::enums::{
    billing_intervals::BillingInterval, plan_tiers::PlanTier,
};

/// Rejection for a plan or interval token that is not one of the canonical values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("invalid {field}: {received_value:?} (allowed: {allowed_values:?})")]
pub struct InvalidInput {
    pub field: &'static str,
    pub received_value: String,
    pub allowed_values: Vec<&'static str>,
}

impl InvalidInput {
    pub fn new(field: &'static str, received_value: &str, allowed_values: Vec<&'static str>) -> Self {
        Self {
            field,
            received_value: received_value.to_string(),
            allowed_values,
        }
    }
}

/// Canonicalizes caller-supplied plan and interval strings. Every other component
/// receives the returned enums and does no case handling of its own.
pub fn normalize(
    raw_plan: &str,
    raw_interval: &str,
) -> Result<(PlanTier, BillingInterval), InvalidInput> {
    let plan = PlanTier::from_str(raw_plan).ok_or_else(|| {
        InvalidInput::new(
            "planId",
            raw_plan,
            PlanTier::ALL.iter().map(|plan| plan.as_str()).collect(),
        )
    })?;

    let interval = BillingInterval::from_str(raw_interval).ok_or_else(|| {
        InvalidInput::new(
            "interval",
            raw_interval,
            BillingInterval::ALL
                .iter()
                .map(|interval| interval.as_str())
                .collect(),
        )
    })?;

    Ok((plan, interval))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanTierPrices {
    pub monthly_price_ref: Option<String>,
    pub yearly_price_ref: Option<String>,
}

impl PlanTierPrices {
    pub fn new(monthly_price_ref: Option<String>, yearly_price_ref: Option<String>) -> Self {
        Self {
            monthly_price_ref,
            yearly_price_ref,
        }
    }

    fn for_interval(&self, interval: BillingInterval) -> Option<&str> {
        match interval {
            BillingInterval::Monthly => self.monthly_price_ref.as_deref(),
            BillingInterval::Yearly => self.yearly_price_ref.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("missing processor price reference for {plan}/{interval}")]
    MissingPriceRef {
        plan: PlanTier,
        interval: BillingInterval,
    },
    #[error("processor price reference {price_ref:?} is mapped to more than one plan")]
    DuplicatePriceRef { price_ref: String },
}

/// Immutable plan → processor price mapping, built once at startup.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    tiers: Vec<(PlanTier, PlanTierPrices)>,
}

impl PlanCatalog {
    /// Builds the catalog, refusing any paid plan/interval without a price reference.
    pub fn new(
        professional: PlanTierPrices,
        enterprise: PlanTierPrices,
    ) -> Result<Self, CatalogError> {
        let tiers = vec![
            (PlanTier::Starter, PlanTierPrices::default()),
            (PlanTier::Professional, clean(professional)),
            (PlanTier::Enterprise, clean(enterprise)),
        ];

        let mut seen: Vec<&str> = Vec::new();
        for (plan, prices) in tiers.iter().filter(|(plan, _)| !plan.is_free()) {
            for interval in BillingInterval::ALL {
                let price_ref = prices.for_interval(interval).ok_or(
                    CatalogError::MissingPriceRef {
                        plan: *plan,
                        interval,
                    },
                )?;
                if seen.contains(&price_ref) {
                    return Err(CatalogError::DuplicatePriceRef {
                        price_ref: price_ref.to_string(),
                    });
                }
                seen.push(price_ref);
            }
        }

        Ok(Self { tiers })
    }

    pub fn resolve(&self, plan: PlanTier, interval: BillingInterval) -> Option<&str> {
        self.tiers
            .iter()
            .find(|(candidate, _)| *candidate == plan)
            .and_then(|(_, prices)| prices.for_interval(interval))
    }

    /// Reverse lookup used when the processor reports the price a subscription is on.
    pub fn plan_for_price(&self, price_ref: &str) -> Option<(PlanTier, BillingInterval)> {
        self.tiers.iter().find_map(|(plan, prices)| {
            BillingInterval::ALL
                .into_iter()
                .find(|interval| prices.for_interval(*interval) == Some(price_ref))
                .map(|interval| (*plan, interval))
        })
    }
}

fn clean(prices: PlanTierPrices) -> PlanTierPrices {
    let keep = |value: Option<String>| {
        value
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };
    PlanTierPrices {
        monthly_price_ref: keep(prices.monthly_price_ref),
        yearly_price_ref: keep(prices.yearly_price_ref),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(
            PlanTierPrices::new(Some("price_pro_m".into()), Some("price_pro_y".into())),
            PlanTierPrices::new(Some("price_ent_m".into()), Some("price_ent_y".into())),
        )
        .unwrap()
    }

    #[test]
    fn normalize_ignores_case() {
        let expected = (PlanTier::Professional, BillingInterval::Yearly);
        assert_eq!(normalize("professional", "YEARLY").unwrap(), expected);
        assert_eq!(normalize("PROFESSIONAL", "yearly").unwrap(), expected);
        assert_eq!(normalize("Professional", "Yearly").unwrap(), expected);
    }

    #[test]
    fn normalize_rejects_partial_and_synonym_tokens() {
        let err = normalize("pro", "monthly").unwrap_err();
        assert_eq!(err.field, "planId");
        assert_eq!(err.received_value, "pro");
        assert_eq!(
            err.allowed_values,
            vec!["STARTER", "PROFESSIONAL", "ENTERPRISE"]
        );

        let err = normalize("enterprise", "annual").unwrap_err();
        assert_eq!(err.field, "interval");
        assert_eq!(err.allowed_values, vec!["MONTHLY", "YEARLY"]);
    }

    #[test]
    fn resolve_returns_configured_price() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve(PlanTier::Enterprise, BillingInterval::Yearly),
            Some("price_ent_y")
        );
        assert_eq!(
            catalog.resolve(PlanTier::Starter, BillingInterval::Monthly),
            None
        );
    }

    #[test]
    fn plan_for_price_reverses_the_mapping() {
        assert_eq!(
            catalog().plan_for_price("price_pro_m"),
            Some((PlanTier::Professional, BillingInterval::Monthly))
        );
        assert_eq!(catalog().plan_for_price("price_unknown"), None);
    }

    #[test]
    fn missing_paid_price_fails_construction() {
        let err = PlanCatalog::new(
            PlanTierPrices::new(Some("price_pro_m".into()), Some("  ".into())),
            PlanTierPrices::new(Some("price_ent_m".into()), Some("price_ent_y".into())),
        )
        .unwrap_err();

        assert_eq!(
            err,
            CatalogError::MissingPriceRef {
                plan: PlanTier::Professional,
                interval: BillingInterval::Yearly,
            }
        );
    }

    #[test]
    fn shared_price_reference_is_rejected() {
        let err = PlanCatalog::new(
            PlanTierPrices::new(Some("price_same".into()), Some("price_pro_y".into())),
            PlanTierPrices::new(Some("price_same".into()), Some("price_ent_y".into())),
        )
        .unwrap_err();

        assert!(matches!(err, CatalogError::DuplicatePriceRef { .. }));
    }
}
