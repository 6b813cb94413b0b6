use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;

use crate::domain::{
    entities::subscriptions::SubscriptionRecordEntity,
    value_objects::subscriptions::{ApplyOutcome, SubscriptionUpdate},
};

#[async_trait]
#[automock]
pub trait SubscriptionRepository {
    /// Merges the update into the user's record atomically. The only write path.
    async fn apply_update(&self, update: SubscriptionUpdate) -> Result<ApplyOutcome>;

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<SubscriptionRecordEntity>>;

    async fn find_user_id_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<String>>;
}
