use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use mockall::automock;
use sqlx::{postgres::PgRow, PgExecutor, Row};

use crate::{
    chain_reader::BlockNumber,
    store::{decode_address, decode_amount, decode_count, PostgresStore, StoreError},
    units::Address,
};

use super::types::{AddressRecord, BlockBatch, IndexedAddresses, IndexerStats, RankingMetric};

#[automock]
#[async_trait]
pub trait IndexStore {
    async fn last_indexed_block(&self) -> Result<Option<BlockNumber>, StoreError>;
    async fn block_hash(&self, block_number: BlockNumber) -> Result<Option<String>, StoreError>;
    /// Writes the block, its transactions and events, the address updates and the new
    /// `last_indexed_block` together, or nothing at all.
    async fn commit_block(&self, batch: &BlockBatch) -> Result<(), StoreError>;
    async fn stats(&self) -> Result<IndexerStats, StoreError>;
    async fn top_addresses(
        &self,
        limit: usize,
        metric: RankingMetric,
    ) -> Result<Vec<AddressRecord>, StoreError>;
    async fn address(&self, address: &Address) -> Result<Option<AddressRecord>, StoreError>;
    /// Every address record together with the height they are current as of, read consistently.
    async fn indexed_addresses(&self) -> Result<IndexedAddresses, StoreError>;
}

const ADDRESS_COLUMNS: &str = "
    address,
    first_seen,
    last_seen,
    transaction_count,
    sent_count,
    received_count,
    total_sent::TEXT,
    total_received::TEXT,
    token_transfer_count,
    token_volume::TEXT,
    staking_event_count,
    staked_balance::TEXT,
    staking_since,
    closed_staking_blocks,
    governance_votes,
    proposals_created
";

fn address_record_from_row(row: &PgRow) -> Result<AddressRecord, StoreError> {
    Ok(AddressRecord {
        address: decode_address(row, "address")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        transaction_count: decode_count(row, "transaction_count")?,
        sent_count: decode_count(row, "sent_count")?,
        received_count: decode_count(row, "received_count")?,
        total_sent: decode_amount(row, "total_sent")?,
        total_received: decode_amount(row, "total_received")?,
        token_transfer_count: decode_count(row, "token_transfer_count")?,
        token_volume: decode_amount(row, "token_volume")?,
        staking_event_count: decode_count(row, "staking_event_count")?,
        staked_balance: decode_amount(row, "staked_balance")?,
        staking_since: row.try_get("staking_since")?,
        closed_staking_blocks: decode_count(row, "closed_staking_blocks")?,
        governance_votes: decode_count(row, "governance_votes")?,
        proposals_created: decode_count(row, "proposals_created")?,
    })
}

async fn upsert_address(
    executor: impl PgExecutor<'_>,
    record: &AddressRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        "
        INSERT INTO addresses (
            address,
            first_seen,
            last_seen,
            transaction_count,
            sent_count,
            received_count,
            total_sent,
            total_received,
            token_transfer_count,
            token_volume,
            staking_event_count,
            staked_balance,
            staking_since,
            closed_staking_blocks,
            governance_votes,
            proposals_created
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7::NUMERIC, $8::NUMERIC, $9, $10::NUMERIC, $11,
            $12::NUMERIC, $13, $14, $15, $16
        )
        ON CONFLICT (address) DO UPDATE SET
            last_seen = EXCLUDED.last_seen,
            transaction_count = EXCLUDED.transaction_count,
            sent_count = EXCLUDED.sent_count,
            received_count = EXCLUDED.received_count,
            total_sent = EXCLUDED.total_sent,
            total_received = EXCLUDED.total_received,
            token_transfer_count = EXCLUDED.token_transfer_count,
            token_volume = EXCLUDED.token_volume,
            staking_event_count = EXCLUDED.staking_event_count,
            staked_balance = EXCLUDED.staked_balance,
            staking_since = EXCLUDED.staking_since,
            closed_staking_blocks = EXCLUDED.closed_staking_blocks,
            governance_votes = EXCLUDED.governance_votes,
            proposals_created = EXCLUDED.proposals_created
        ",
    )
    .bind(record.address.as_str())
    .bind(record.first_seen)
    .bind(record.last_seen)
    .bind(record.transaction_count as i64)
    .bind(record.sent_count as i64)
    .bind(record.received_count as i64)
    .bind(record.total_sent.to_string())
    .bind(record.total_received.to_string())
    .bind(record.token_transfer_count as i64)
    .bind(record.token_volume.to_string())
    .bind(record.staking_event_count as i64)
    .bind(record.staked_balance.to_string())
    .bind(record.staking_since)
    .bind(record.closed_staking_blocks as i64)
    .bind(record.governance_votes as i64)
    .bind(record.proposals_created as i64)
    .execute(executor)
    .await?;

    Ok(())
}

fn ranking_expression(metric: RankingMetric) -> &'static str {
    match metric {
        RankingMetric::TransactionCount => "transaction_count",
        RankingMetric::TransferVolume => "total_sent + total_received + token_volume",
        RankingMetric::TokenTransfers => "token_transfer_count",
        RankingMetric::StakingDuration => {
            "closed_staking_blocks + COALESCE(
                GREATEST(
                    (SELECT last_indexed_block FROM indexer_state WHERE id = 1) - staking_since,
                    0
                ),
                0
            )"
        }
        RankingMetric::GovernanceParticipation => "governance_votes + proposals_created",
    }
}

#[async_trait]
impl IndexStore for PostgresStore {
    async fn last_indexed_block(&self) -> Result<Option<BlockNumber>, StoreError> {
        let last = sqlx::query_scalar::<_, i64>(
            "
            SELECT last_indexed_block FROM indexer_state WHERE id = 1
            ",
        )
        .fetch_optional(self.db_pool())
        .await?;

        Ok(last)
    }

    async fn block_hash(&self, block_number: BlockNumber) -> Result<Option<String>, StoreError> {
        let hash = sqlx::query_scalar::<_, String>(
            "
            SELECT hash FROM blocks WHERE number = $1
            ",
        )
        .bind(block_number)
        .fetch_optional(self.db_pool())
        .await?;

        Ok(hash)
    }

    async fn commit_block(&self, batch: &BlockBatch) -> Result<(), StoreError> {
        let block_number = batch.block.number;
        let mut transaction = self.db_pool().begin().await?;

        // Locks the progress row, a second writer waits here and then fails the order check.
        let last_indexed = sqlx::query_scalar::<_, i64>(
            "
            SELECT last_indexed_block FROM indexer_state WHERE id = 1 FOR UPDATE
            ",
        )
        .fetch_optional(&mut *transaction)
        .await?;

        if let Some(last_indexed) = last_indexed {
            if block_number != last_indexed + 1 {
                return Err(StoreError::OutOfOrder {
                    expected: last_indexed + 1,
                    got: block_number,
                });
            }
        }

        sqlx::query(
            "
            INSERT INTO blocks (number, hash, parent_hash, timestamp, transaction_count)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(block_number)
        .bind(&batch.block.hash)
        .bind(&batch.block.parent_hash)
        .bind(batch.block.timestamp)
        .bind(batch.block.transaction_count)
        .execute(&mut *transaction)
        .await?;

        for tx in &batch.transactions {
            sqlx::query(
                "
                INSERT INTO transactions (
                    hash,
                    block_number,
                    transaction_index,
                    from_address,
                    to_address,
                    value,
                    status
                )
                VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7)
                ",
            )
            .bind(&tx.hash)
            .bind(tx.block_number)
            .bind(tx.transaction_index)
            .bind(tx.from.as_str())
            .bind(tx.to.as_ref().map(|to| to.as_str()))
            .bind(tx.value.to_string())
            .bind(tx.status.as_str())
            .execute(&mut *transaction)
            .await?;
        }

        for transfer in &batch.token_transfers {
            sqlx::query(
                "
                INSERT INTO token_transfers (
                    transaction_hash,
                    log_index,
                    block_number,
                    token,
                    from_address,
                    to_address,
                    value
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC)
                ",
            )
            .bind(&transfer.transaction_hash)
            .bind(transfer.log_index)
            .bind(transfer.block_number)
            .bind(transfer.token.as_str())
            .bind(transfer.from.as_str())
            .bind(transfer.to.as_str())
            .bind(transfer.value.to_string())
            .execute(&mut *transaction)
            .await?;
        }

        for event in &batch.staking_events {
            sqlx::query(
                "
                INSERT INTO staking_events (
                    transaction_hash,
                    log_index,
                    block_number,
                    kind,
                    staker,
                    amount
                )
                VALUES ($1, $2, $3, $4, $5, $6::NUMERIC)
                ",
            )
            .bind(&event.transaction_hash)
            .bind(event.log_index)
            .bind(event.block_number)
            .bind(event.kind.as_str())
            .bind(event.staker.as_str())
            .bind(event.amount.to_string())
            .execute(&mut *transaction)
            .await?;
        }

        for event in &batch.governance_events {
            sqlx::query(
                "
                INSERT INTO governance_events (
                    transaction_hash,
                    log_index,
                    block_number,
                    kind,
                    participant,
                    proposal_id,
                    support
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(&event.transaction_hash)
            .bind(event.log_index)
            .bind(event.block_number)
            .bind(event.kind.as_str())
            .bind(event.participant.as_str())
            .bind(&event.proposal_id)
            .bind(event.support)
            .execute(&mut *transaction)
            .await?;
        }

        let touched: Vec<String> = batch
            .address_deltas
            .keys()
            .map(|address| address.to_string())
            .collect();

        let mut existing = sqlx::query(&format!(
            "
            SELECT {ADDRESS_COLUMNS} FROM addresses WHERE address = ANY($1) FOR UPDATE
            "
        ))
        .bind(&touched)
        .fetch_all(&mut *transaction)
        .await?
        .iter()
        .map(|row| address_record_from_row(row).map(|record| (record.address.clone(), record)))
        .collect::<Result<HashMap<_, _>, _>>()?;

        for (address, delta) in &batch.address_deltas {
            let mut record = existing
                .remove(address)
                .unwrap_or_else(|| AddressRecord::new(address.clone(), block_number));
            record.apply(block_number, delta)?;
            upsert_address(&mut *transaction, &record).await?;
        }

        sqlx::query(
            "
            INSERT INTO indexer_state (id, last_indexed_block, updated_at)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE SET
                last_indexed_block = EXCLUDED.last_indexed_block,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(block_number)
        .bind(Utc::now())
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(())
    }

    async fn stats(&self) -> Result<IndexerStats, StoreError> {
        let row = sqlx::query(
            "
            SELECT
                (SELECT COUNT(*) FROM blocks) AS blocks_indexed,
                (SELECT COUNT(*) FROM transactions) AS transactions,
                (SELECT COUNT(*) FROM addresses) AS addresses,
                (SELECT COUNT(*) FROM token_transfers) AS token_transfers,
                (SELECT COUNT(*) FROM staking_events) AS staking_events,
                (SELECT COUNT(*) FROM governance_events) AS governance_events,
                (SELECT last_indexed_block FROM indexer_state WHERE id = 1) AS last_indexed_block
            ",
        )
        .fetch_one(self.db_pool())
        .await?;

        Ok(IndexerStats {
            blocks_indexed: decode_count(&row, "blocks_indexed")?,
            transactions: decode_count(&row, "transactions")?,
            addresses: decode_count(&row, "addresses")?,
            token_transfers: decode_count(&row, "token_transfers")?,
            staking_events: decode_count(&row, "staking_events")?,
            governance_events: decode_count(&row, "governance_events")?,
            last_indexed_block: row.try_get("last_indexed_block")?,
        })
    }

    async fn top_addresses(
        &self,
        limit: usize,
        metric: RankingMetric,
    ) -> Result<Vec<AddressRecord>, StoreError> {
        sqlx::query(&format!(
            "
            SELECT {ADDRESS_COLUMNS}
            FROM addresses
            ORDER BY {} DESC, address ASC
            LIMIT $1
            ",
            ranking_expression(metric)
        ))
        .bind(limit as i64)
        .fetch_all(self.db_pool())
        .await?
        .iter()
        .map(address_record_from_row)
        .collect()
    }

    async fn address(&self, address: &Address) -> Result<Option<AddressRecord>, StoreError> {
        sqlx::query(&format!(
            "
            SELECT {ADDRESS_COLUMNS} FROM addresses WHERE address = $1
            "
        ))
        .bind(address.as_str())
        .fetch_optional(self.db_pool())
        .await?
        .as_ref()
        .map(address_record_from_row)
        .transpose()
    }

    async fn indexed_addresses(&self) -> Result<IndexedAddresses, StoreError> {
        let mut transaction = self.db_pool().begin().await?;

        // Both reads see the same commit, a block landing in between is either fully visible or
        // not at all.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *transaction)
            .await?;

        let last_indexed_block = sqlx::query_scalar::<_, i64>(
            "
            SELECT last_indexed_block FROM indexer_state WHERE id = 1
            ",
        )
        .fetch_optional(&mut *transaction)
        .await?;

        let records = sqlx::query(&format!(
            "
            SELECT {ADDRESS_COLUMNS} FROM addresses ORDER BY address ASC
            "
        ))
        .fetch_all(&mut *transaction)
        .await?
        .iter()
        .map(address_record_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        transaction.commit().await?;

        Ok(IndexedAddresses {
            last_indexed_block,
            records,
        })
    }
}
