use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::{
    entities::subscriptions::{MergeDecision, SubscriptionRecordEntity, merge},
    repositories::subscriptions::SubscriptionRepository,
    value_objects::subscriptions::{ApplyEffect, ApplyOutcome, SubscriptionUpdate},
};

/// Process-local store. The whole merge runs under one lock, so readers never
/// observe a half-applied update.
#[derive(Default)]
pub struct SubscriptionInMemory {
    records: Mutex<HashMap<String, SubscriptionRecordEntity>>,
}

impl SubscriptionInMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionRepository for SubscriptionInMemory {
    async fn apply_update(&self, update: SubscriptionUpdate) -> Result<ApplyOutcome> {
        let mut records = self.records.lock().await;
        let current = records.get(&update.user_id).cloned();

        let outcome = match merge(current.as_ref(), &update, Utc::now()) {
            MergeDecision::Write(record) => {
                let effect = if current.is_some() {
                    ApplyEffect::Updated
                } else {
                    ApplyEffect::Created
                };
                records.insert(record.user_id.clone(), record.clone());
                ApplyOutcome {
                    record: Some(record),
                    effect,
                }
            }
            MergeDecision::Unchanged => ApplyOutcome {
                record: current,
                effect: ApplyEffect::Unchanged,
            },
            MergeDecision::Skip(reason) => ApplyOutcome {
                record: current,
                effect: ApplyEffect::Skipped(reason),
            },
            MergeDecision::Conflict(reason) => ApplyOutcome {
                record: current,
                effect: ApplyEffect::Conflict(reason),
            },
        };

        Ok(outcome)
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<SubscriptionRecordEntity>> {
        Ok(self.records.lock().await.get(user_id).cloned())
    }

    async fn find_user_id_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<String>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .find(|record| record.processor_subscription_ref.as_deref() == Some(subscription_ref))
            .map(|record| record.user_id.clone()))
    }
}
