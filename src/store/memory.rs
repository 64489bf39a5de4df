use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    activity::{ActivityStore, SummarySet},
    chain_reader::BlockNumber,
    indexer::{
        AddressRecord, BlockBatch, BlockRecord, GovernanceEvent, IndexStore, IndexedAddresses,
        IndexerStats, RankingMetric, StakingEvent, TokenTransfer, TransactionRecord,
    },
    snapshot::{FinalizeOutcome, Snapshot, SnapshotStatus, SnapshotStore},
    units::Address,
};

use super::StoreError;

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<BlockNumber, BlockRecord>,
    transactions: Vec<TransactionRecord>,
    token_transfers: Vec<TokenTransfer>,
    staking_events: Vec<StakingEvent>,
    governance_events: Vec<GovernanceEvent>,
    addresses: BTreeMap<Address, AddressRecord>,
    last_indexed_block: Option<BlockNumber>,
    summaries: Option<SummarySet>,
    // In creation order.
    snapshots: Vec<Snapshot>,
}

/// Canonical store kept in process memory. Every operation runs under one lock, which gives the
/// same all-or-nothing commits and consistent reads as the postgres store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // Operations validate before they mutate, a panic elsewhere cannot leave half a commit.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.state().transactions.clone()
    }

    pub fn token_transfers(&self) -> Vec<TokenTransfer> {
        self.state().token_transfers.clone()
    }

    pub fn staking_events(&self) -> Vec<StakingEvent> {
        self.state().staking_events.clone()
    }

    pub fn governance_events(&self) -> Vec<GovernanceEvent> {
        self.state().governance_events.clone()
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn last_indexed_block(&self) -> Result<Option<BlockNumber>, StoreError> {
        Ok(self.state().last_indexed_block)
    }

    async fn block_hash(&self, block_number: BlockNumber) -> Result<Option<String>, StoreError> {
        Ok(self
            .state()
            .blocks
            .get(&block_number)
            .map(|block| block.hash.clone()))
    }

    async fn commit_block(&self, batch: &BlockBatch) -> Result<(), StoreError> {
        let mut state = self.state();
        let block_number = batch.block.number;

        if let Some(last_indexed) = state.last_indexed_block {
            if block_number != last_indexed + 1 {
                return Err(StoreError::OutOfOrder {
                    expected: last_indexed + 1,
                    got: block_number,
                });
            }
        }

        // Apply to copies first so an overflow leaves the state untouched.
        let mut updated = Vec::with_capacity(batch.address_deltas.len());
        for (address, delta) in &batch.address_deltas {
            let mut record = state
                .addresses
                .get(address)
                .cloned()
                .unwrap_or_else(|| AddressRecord::new(address.clone(), block_number));
            record.apply(block_number, delta)?;
            updated.push(record);
        }

        for record in updated {
            state.addresses.insert(record.address.clone(), record);
        }
        state.blocks.insert(block_number, batch.block.clone());
        state.transactions.extend(batch.transactions.iter().cloned());
        state
            .token_transfers
            .extend(batch.token_transfers.iter().cloned());
        state
            .staking_events
            .extend(batch.staking_events.iter().cloned());
        state
            .governance_events
            .extend(batch.governance_events.iter().cloned());
        state.last_indexed_block = Some(block_number);

        Ok(())
    }

    async fn stats(&self) -> Result<IndexerStats, StoreError> {
        let state = self.state();
        Ok(IndexerStats {
            blocks_indexed: state.blocks.len() as u64,
            transactions: state.transactions.len() as u64,
            addresses: state.addresses.len() as u64,
            token_transfers: state.token_transfers.len() as u64,
            staking_events: state.staking_events.len() as u64,
            governance_events: state.governance_events.len() as u64,
            last_indexed_block: state.last_indexed_block,
        })
    }

    async fn top_addresses(
        &self,
        limit: usize,
        metric: RankingMetric,
    ) -> Result<Vec<AddressRecord>, StoreError> {
        let state = self.state();
        let as_of = state.last_indexed_block.unwrap_or(0);

        // BTreeMap iterates by address, the stable sort keeps that order among equal values.
        let mut records: Vec<&AddressRecord> = state.addresses.values().collect();
        records.sort_by_key(|record| std::cmp::Reverse(metric.value(record, as_of)));

        Ok(records.into_iter().take(limit).cloned().collect())
    }

    async fn address(&self, address: &Address) -> Result<Option<AddressRecord>, StoreError> {
        Ok(self.state().addresses.get(address).cloned())
    }

    async fn indexed_addresses(&self) -> Result<IndexedAddresses, StoreError> {
        let state = self.state();
        Ok(IndexedAddresses {
            last_indexed_block: state.last_indexed_block,
            records: state.addresses.values().cloned().collect(),
        })
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn replace_summaries(&self, set: &SummarySet) -> Result<(), StoreError> {
        self.state().summaries = Some(set.clone());
        Ok(())
    }

    async fn summaries(&self) -> Result<Option<SummarySet>, StoreError> {
        Ok(self.state().summaries.clone())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.state().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn finalize_snapshot(
        &self,
        id: &str,
        finalized_at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, StoreError> {
        let mut state = self.state();
        let Some(snapshot) = state.snapshots.iter_mut().find(|snapshot| snapshot.id == id) else {
            return Ok(FinalizeOutcome::NotFound);
        };

        match snapshot.status {
            SnapshotStatus::Finalized => Ok(FinalizeOutcome::AlreadyFinalized),
            SnapshotStatus::Draft => {
                snapshot.status = SnapshotStatus::Finalized;
                snapshot.finalized_at = Some(finalized_at);
                Ok(FinalizeOutcome::Finalized(snapshot.clone()))
            }
        }
    }

    async fn snapshot(&self, id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .find(|snapshot| snapshot.id == id)
            .cloned())
    }

    async fn latest_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.state().snapshots.last().cloned())
    }

    async fn all_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self.state().snapshots.iter().rev().cloned().collect())
    }
}
