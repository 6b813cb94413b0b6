use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use diesel::{PgConnection, RunQueryDsl, insert_into, prelude::*, update};
use std::sync::Arc;
use tokio::task;

use crate::{
    domain,
    infra::db::postgres::{postgres_connection::PgPoolSquad, schema::subscription_records},
};
use domain::{
    entities::subscriptions::{
        MergeDecision, SubscriptionRecordEntity, SubscriptionRecordRow, merge,
    },
    repositories::subscriptions::SubscriptionRepository,
    value_objects::subscriptions::{ApplyEffect, ApplyOutcome, SubscriptionUpdate},
};

/// A concurrent first insert for the same user can win between our read and our
/// insert. One re-read under the row lock is then enough.
const MAX_APPLY_ATTEMPTS: usize = 2;

pub struct SubscriptionPostgres {
    db_pool: Arc<PgPoolSquad>,
}

impl SubscriptionPostgres {
    pub fn new(db_pool: Arc<PgPoolSquad>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl SubscriptionRepository for SubscriptionPostgres {
    async fn apply_update(&self, update: SubscriptionUpdate) -> Result<ApplyOutcome> {
        // Diesel is synchronous and the row lock can block; keep it off the async workers.
        let db_pool = Arc::clone(&self.db_pool);

        task::spawn_blocking(move || -> Result<ApplyOutcome> {
            let mut conn = db_pool.get()?;

            retry_lost_inserts(&update, || {
                conn.transaction::<Option<ApplyOutcome>, anyhow::Error, _>(|tx| {
                    apply_locked(tx, &update)
                })
            })
        })
        .await?
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<SubscriptionRecordEntity>> {
        let db_pool = Arc::clone(&self.db_pool);
        let user_id = user_id.to_string();

        task::spawn_blocking(move || -> Result<Option<SubscriptionRecordEntity>> {
            let mut conn = db_pool.get()?;

            let row = subscription_records::table
                .find(user_id.as_str())
                .select(SubscriptionRecordRow::as_select())
                .first::<SubscriptionRecordRow>(&mut conn)
                .optional()?;

            row.map(SubscriptionRecordEntity::try_from).transpose()
        })
        .await?
    }

    async fn find_user_id_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<String>> {
        let db_pool = Arc::clone(&self.db_pool);
        let subscription_ref = subscription_ref.to_string();

        task::spawn_blocking(move || -> Result<Option<String>> {
            let mut conn = db_pool.get()?;

            let user_id = subscription_records::table
                .filter(subscription_records::processor_subscription_ref.eq(subscription_ref))
                .select(subscription_records::user_id)
                .first::<String>(&mut conn)
                .optional()?;

            Ok(user_id)
        })
        .await?
    }
}

/// Re-runs `attempt` while it reports a lost insert race (`Ok(None)`).
fn retry_lost_inserts<F>(update: &SubscriptionUpdate, mut attempt: F) -> Result<ApplyOutcome>
where
    F: FnMut() -> Result<Option<ApplyOutcome>>,
{
    for _ in 0..MAX_APPLY_ATTEMPTS {
        let outcome = attempt().with_context(|| {
            format!(
                "failed to apply {} for user {}",
                update.change.kind(),
                update.user_id
            )
        })?;

        if let Some(outcome) = outcome {
            return Ok(outcome);
        }
    }

    bail!(
        "gave up applying {} for user {} after concurrent inserts",
        update.change.kind(),
        update.user_id
    )
}

/// Runs inside a transaction. `Ok(None)` means the insert lost a race and the
/// caller should retry.
fn apply_locked(
    tx: &mut PgConnection,
    subscription_update: &SubscriptionUpdate,
) -> Result<Option<ApplyOutcome>> {
    let current = subscription_records::table
        .find(subscription_update.user_id.as_str())
        .select(SubscriptionRecordRow::as_select())
        .for_update()
        .first::<SubscriptionRecordRow>(tx)
        .optional()?
        .map(SubscriptionRecordEntity::try_from)
        .transpose()?;

    let outcome = match merge(current.as_ref(), subscription_update, Utc::now()) {
        MergeDecision::Write(record) => {
            let row = SubscriptionRecordRow::from(&record);

            if current.is_some() {
                update(subscription_records::table.find(record.user_id.as_str()))
                    .set(&row)
                    .execute(tx)?;

                ApplyOutcome {
                    record: Some(record),
                    effect: ApplyEffect::Updated,
                }
            } else {
                let inserted = insert_into(subscription_records::table)
                    .values(&row)
                    .on_conflict_do_nothing()
                    .execute(tx)?;

                if inserted == 0 {
                    return Ok(None);
                }

                ApplyOutcome {
                    record: Some(record),
                    effect: ApplyEffect::Created,
                }
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

    Ok(Some(outcome))
}
