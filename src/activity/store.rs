use async_trait::async_trait;
use chrono::Utc;
use mockall::automock;
use sqlx::Row;

use crate::store::{decode_address, decode_count, PostgresStore, StoreError};

use super::{ActivitySummary, SummarySet};

#[automock]
#[async_trait]
pub trait ActivityStore {
    /// Swaps the stored summary set for `set` in one transaction.
    async fn replace_summaries(&self, set: &SummarySet) -> Result<(), StoreError>;
    /// The current summary set as one consistent read, None before the first scoring run.
    async fn summaries(&self) -> Result<Option<SummarySet>, StoreError>;
}

#[async_trait]
impl ActivityStore for PostgresStore {
    async fn replace_summaries(&self, set: &SummarySet) -> Result<(), StoreError> {
        let mut transaction = self.db_pool().begin().await?;

        sqlx::query("DELETE FROM address_activity_summary")
            .execute(&mut *transaction)
            .await?;

        for chunk in set.summaries.chunks(10_000) {
            let addresses: Vec<&str> = chunk.iter().map(|summary| summary.address.as_str()).collect();
            let scores: Vec<i64> = chunk.iter().map(|summary| summary.score as i64).collect();
            let eligible: Vec<bool> = chunk.iter().map(|summary| summary.eligible).collect();

            sqlx::query(
                "
                INSERT INTO address_activity_summary (address, score, eligible)
                SELECT * FROM UNNEST($1::TEXT[], $2::BIGINT[], $3::BOOLEAN[])
                ",
            )
            .bind(&addresses)
            .bind(&scores)
            .bind(&eligible)
            .execute(&mut *transaction)
            .await?;
        }

        sqlx::query(
            "
            INSERT INTO activity_state (id, as_of_block, eligibility_threshold, computed_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                as_of_block = EXCLUDED.as_of_block,
                eligibility_threshold = EXCLUDED.eligibility_threshold,
                computed_at = EXCLUDED.computed_at
            ",
        )
        .bind(set.as_of_block)
        .bind(set.eligibility_threshold as i64)
        .bind(Utc::now())
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(())
    }

    async fn summaries(&self) -> Result<Option<SummarySet>, StoreError> {
        let mut transaction = self.db_pool().begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *transaction)
            .await?;

        let state = sqlx::query(
            "
            SELECT as_of_block, eligibility_threshold FROM activity_state WHERE id = 1
            ",
        )
        .fetch_optional(&mut *transaction)
        .await?;

        let Some(state) = state else {
            transaction.commit().await?;
            return Ok(None);
        };

        let summaries = sqlx::query(
            "
            SELECT address, score, eligible
            FROM address_activity_summary
            ORDER BY address ASC
            ",
        )
        .fetch_all(&mut *transaction)
        .await?
        .iter()
        .map(|row| -> Result<ActivitySummary, StoreError> {
            Ok(ActivitySummary {
                address: decode_address(row, "address")?,
                score: decode_count(row, "score")?,
                eligible: row.try_get("eligible")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        transaction.commit().await?;

        Ok(Some(SummarySet {
            as_of_block: state.try_get("as_of_block")?,
            eligibility_threshold: decode_count(&state, "eligibility_threshold")?,
            summaries,
        }))
    }
}
