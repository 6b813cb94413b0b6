pub mod billing_intervals;
pub mod plan_tiers;
pub mod subscription_statuses;
