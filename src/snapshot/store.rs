use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use sqlx::{postgres::PgRow, types::Json, Row};

use crate::{
    merkle::MerkleHash,
    store::{decode_amount, decode_column, decode_count, PostgresStore, StoreError},
};

use super::{Snapshot, SnapshotLeaf, SnapshotStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized(Snapshot),
    NotFound,
    AlreadyFinalized,
}

#[automock]
#[async_trait]
pub trait SnapshotStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
    /// Moves a draft to finalized. Concurrent calls for one id see exactly one `Finalized`.
    async fn finalize_snapshot(
        &self,
        id: &str,
        finalized_at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, StoreError>;
    async fn snapshot(&self, id: &str) -> Result<Option<Snapshot>, StoreError>;
    async fn latest_snapshot(&self) -> Result<Option<Snapshot>, StoreError>;
    async fn all_snapshots(&self) -> Result<Vec<Snapshot>, StoreError>;
}

const SNAPSHOT_COLUMNS: &str = "
    id,
    block_height,
    merkle_root,
    leaves,
    total_allocated::TEXT,
    eligible_count,
    total_addresses,
    eligibility_threshold,
    status,
    created_at,
    finalized_at
";

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    let Json(leaves): Json<Vec<SnapshotLeaf>> = row.try_get("leaves")?;

    Ok(Snapshot {
        id: row.try_get("id")?,
        block_height: row.try_get("block_height")?,
        merkle_root: decode_column::<MerkleHash>(row, "merkle_root")?,
        leaves,
        total_allocated: decode_amount(row, "total_allocated")?,
        eligible_count: decode_count(row, "eligible_count")?,
        total_addresses: decode_count(row, "total_addresses")?,
        eligibility_threshold: decode_count(row, "eligibility_threshold")?,
        status: decode_column::<SnapshotStatus>(row, "status")?,
        created_at: row.try_get("created_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

#[async_trait]
impl SnapshotStore for PostgresStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        sqlx::query(
            "
            INSERT INTO genesis_snapshots (
                id,
                block_height,
                merkle_root,
                leaves,
                total_allocated,
                eligible_count,
                total_addresses,
                eligibility_threshold,
                status,
                created_at,
                finalized_at
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(&snapshot.id)
        .bind(snapshot.block_height)
        .bind(snapshot.merkle_root.to_string())
        .bind(Json(&snapshot.leaves))
        .bind(snapshot.total_allocated.to_string())
        .bind(snapshot.eligible_count as i64)
        .bind(snapshot.total_addresses as i64)
        .bind(snapshot.eligibility_threshold as i64)
        .bind(snapshot.status.to_string())
        .bind(snapshot.created_at)
        .bind(snapshot.finalized_at)
        .execute(self.db_pool())
        .await?;

        Ok(())
    }

    async fn finalize_snapshot(
        &self,
        id: &str,
        finalized_at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, StoreError> {
        // The status condition makes concurrent finalizations race on the row lock, the loser
        // matches no row.
        let finalized = sqlx::query(&format!(
            "
            UPDATE genesis_snapshots
            SET status = 'finalized', finalized_at = $2
            WHERE id = $1 AND status = 'draft'
            RETURNING {SNAPSHOT_COLUMNS}
            "
        ))
        .bind(id)
        .bind(finalized_at)
        .fetch_optional(self.db_pool())
        .await?;

        if let Some(row) = finalized {
            return Ok(FinalizeOutcome::Finalized(snapshot_from_row(&row)?));
        }

        let exists = sqlx::query_scalar::<_, bool>(
            "
            SELECT EXISTS (SELECT 1 FROM genesis_snapshots WHERE id = $1)
            ",
        )
        .bind(id)
        .fetch_one(self.db_pool())
        .await?;

        if exists {
            Ok(FinalizeOutcome::AlreadyFinalized)
        } else {
            Ok(FinalizeOutcome::NotFound)
        }
    }

    async fn snapshot(&self, id: &str) -> Result<Option<Snapshot>, StoreError> {
        sqlx::query(&format!(
            "
            SELECT {SNAPSHOT_COLUMNS} FROM genesis_snapshots WHERE id = $1
            "
        ))
        .bind(id)
        .fetch_optional(self.db_pool())
        .await?
        .as_ref()
        .map(snapshot_from_row)
        .transpose()
    }

    async fn latest_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        sqlx::query(&format!(
            "
            SELECT {SNAPSHOT_COLUMNS}
            FROM genesis_snapshots
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "
        ))
        .fetch_optional(self.db_pool())
        .await?
        .as_ref()
        .map(snapshot_from_row)
        .transpose()
    }

    async fn all_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        sqlx::query(&format!(
            "
            SELECT {SNAPSHOT_COLUMNS}
            FROM genesis_snapshots
            ORDER BY created_at DESC, id DESC
            "
        ))
        .fetch_all(self.db_pool())
        .await?
        .iter()
        .map(snapshot_from_row)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_context::test_context;

    use crate::{db::tests::TestDb, merkle::EMPTY_ROOT, units::TokenAmount};

    use super::*;

    fn draft(id: &str, created_at_secs: i64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            block_height: 100,
            merkle_root: EMPTY_ROOT,
            leaves: vec![],
            total_allocated: TokenAmount::ZERO,
            eligible_count: 0,
            total_addresses: 0,
            eligibility_threshold: 15,
            status: SnapshotStatus::Draft,
            created_at: Utc.timestamp_opt(created_at_secs, 0).unwrap(),
            finalized_at: None,
        }
    }

    #[test_context(TestDb)]
    #[tokio::test]
    #[ignore = "requires a postgres testdb"]
    async fn finalize_snapshot_test(test_db: &mut TestDb) {
        let store = PostgresStore::new(test_db.pool.clone());
        store.insert_snapshot(&draft("a", 1_000)).await.unwrap();

        let finalized_at = Utc.timestamp_opt(2_000, 0).unwrap();
        let outcome = store.finalize_snapshot("a", finalized_at).await.unwrap();
        match outcome {
            FinalizeOutcome::Finalized(snapshot) => {
                assert_eq!(snapshot.status, SnapshotStatus::Finalized);
                assert_eq!(snapshot.finalized_at, Some(finalized_at));
            }
            other => panic!("expected finalized, got {other:?}"),
        }

        assert_eq!(
            store.finalize_snapshot("a", finalized_at).await.unwrap(),
            FinalizeOutcome::AlreadyFinalized
        );
        assert_eq!(
            store.finalize_snapshot("b", finalized_at).await.unwrap(),
            FinalizeOutcome::NotFound
        );
    }

    #[test_context(TestDb)]
    #[tokio::test]
    #[ignore = "requires a postgres testdb"]
    async fn newest_first_test(test_db: &mut TestDb) {
        let store = PostgresStore::new(test_db.pool.clone());
        store.insert_snapshot(&draft("old", 1_000)).await.unwrap();
        store.insert_snapshot(&draft("new", 2_000)).await.unwrap();

        let latest = store.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, "new");

        let ids: Vec<String> = store
            .all_snapshots()
            .await
            .unwrap()
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }
}
