//! Snapshots capture the eligible addresses and their provisional allocations at one indexed
//! height, committed to by a Merkle root. A snapshot starts out as a draft and becomes immutable
//! once finalized.

mod store;

use std::{fmt::Display, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    activity::ActivityStore,
    chain_reader::BlockNumber,
    distribution::{checked_total, split_proportionally, DistributionError},
    merkle::{self, MerkleError, MerkleHash, MerkleProof, MerkleTree},
    store::StoreError,
    units::{Address, TokenAmount},
};

pub use store::*;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Draft,
    Finalized,
}

impl Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotStatus::Draft => write!(f, "draft"),
            SnapshotStatus::Finalized => write!(f, "finalized"),
        }
    }
}

impl FromStr for SnapshotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(SnapshotStatus::Draft),
            "finalized" => Ok(SnapshotStatus::Finalized),
            unknown => Err(format!("unknown snapshot status {unknown}")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLeaf {
    pub address: Address,
    pub amount: TokenAmount,
    pub score: u64,
    pub index: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub block_height: BlockNumber,
    pub merkle_root: MerkleHash,
    /// Sorted by address, `index` equals position.
    pub leaves: Vec<SnapshotLeaf>,
    pub total_allocated: TokenAmount,
    pub eligible_count: u64,
    pub total_addresses: u64,
    pub eligibility_threshold: u64,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotProof {
    pub snapshot_id: String,
    pub merkle_root: MerkleHash,
    pub leaf: SnapshotLeaf,
    pub proof: MerkleProof,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no activity scores have been computed yet")]
    NoSummaries,
    #[error("scores are computed as of block {available}, not the requested block {requested}")]
    SummariesNotAtHeight {
        requested: BlockNumber,
        available: BlockNumber,
    },
    #[error("snapshot {0} not found")]
    NotFound(String),
    #[error("snapshot {0} is already finalized")]
    AlreadyFinalized(String),
    #[error("snapshot {id} is inconsistent: {reason}")]
    Integrity { id: String, reason: String },
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Distribution(#[from] DistributionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Snapshot {
    pub fn merkle_tree(&self) -> Result<MerkleTree, MerkleError> {
        MerkleTree::build(
            self.leaves
                .iter()
                .map(|leaf| (leaf.address.clone(), leaf.amount)),
        )
    }

    /// Checks leaf order, indices, the total and the root against the leaves. Snapshots read
    /// from files pass through here before anything is derived from them.
    pub fn verify_integrity(&self) -> Result<(), SnapshotError> {
        let integrity_error = |reason: String| SnapshotError::Integrity {
            id: self.id.clone(),
            reason,
        };

        for (position, leaf) in self.leaves.iter().enumerate() {
            if leaf.index != position as u64 {
                return Err(integrity_error(format!(
                    "leaf {} has index {}",
                    position, leaf.index
                )));
            }
        }

        if self
            .leaves
            .windows(2)
            .any(|pair| pair[0].address >= pair[1].address)
        {
            return Err(integrity_error("leaves are not sorted by address".into()));
        }

        let amounts: Vec<TokenAmount> = self.leaves.iter().map(|leaf| leaf.amount).collect();
        let total = TokenAmount::checked_sum(&amounts)
            .ok_or_else(|| integrity_error("leaf amounts overflow".into()))?;
        if total != self.total_allocated {
            return Err(integrity_error(format!(
                "leaves sum to {}, recorded total is {}",
                total, self.total_allocated
            )));
        }

        if self.eligible_count != self.leaves.len() as u64 {
            return Err(integrity_error(format!(
                "eligible count {} does not match {} leaves",
                self.eligible_count,
                self.leaves.len()
            )));
        }

        let root = self.merkle_tree()?.root();
        if root != self.merkle_root {
            return Err(integrity_error(format!(
                "recomputed root {} does not match recorded root {}",
                root, self.merkle_root
            )));
        }

        Ok(())
    }
}

pub struct SnapshotBuilder<S> {
    store: Arc<S>,
    eligibility_threshold: u64,
    snapshot_pool: TokenAmount,
}

impl<S> SnapshotBuilder<S>
where
    S: ActivityStore + SnapshotStore + Send + Sync,
{
    pub fn new(store: Arc<S>, eligibility_threshold: u64, snapshot_pool: TokenAmount) -> Self {
        Self {
            store,
            eligibility_threshold,
            snapshot_pool,
        }
    }

    /// Builds and stores a draft snapshot from the stored scores. When a height is given the
    /// scores must have been computed as of exactly that height.
    pub async fn generate_snapshot(
        &self,
        block_height: Option<BlockNumber>,
    ) -> Result<Snapshot, SnapshotError> {
        let set = self
            .store
            .summaries()
            .await?
            .ok_or(SnapshotError::NoSummaries)?;

        if let Some(requested) = block_height {
            if requested != set.as_of_block {
                return Err(SnapshotError::SummariesNotAtHeight {
                    requested,
                    available: set.as_of_block,
                });
            }
        }

        let mut eligible: Vec<_> = set
            .summaries
            .iter()
            .filter(|summary| summary.score >= self.eligibility_threshold)
            .collect();
        eligible.sort_by(|a, b| a.address.cmp(&b.address));

        let weights: Vec<(&Address, u64)> = eligible
            .iter()
            .map(|summary| (&summary.address, summary.score))
            .collect();
        let amounts = split_proportionally(self.snapshot_pool, &weights)?;

        let tree = MerkleTree::build(
            eligible
                .iter()
                .zip(&amounts)
                .map(|(summary, amount)| (summary.address.clone(), *amount)),
        )?;

        let leaves: Vec<SnapshotLeaf> = eligible
            .iter()
            .zip(amounts)
            .enumerate()
            .map(|(index, (summary, amount))| SnapshotLeaf {
                address: summary.address.clone(),
                amount,
                score: summary.score,
                index: index as u64,
            })
            .collect();

        let total_allocated = checked_total(leaves.iter().map(|leaf| &leaf.amount))?;

        let snapshot = Snapshot {
            id: nanoid!(),
            block_height: set.as_of_block,
            merkle_root: tree.root(),
            eligible_count: leaves.len() as u64,
            leaves,
            total_allocated,
            total_addresses: set.summaries.len() as u64,
            eligibility_threshold: self.eligibility_threshold,
            status: SnapshotStatus::Draft,
            created_at: Utc::now(),
            finalized_at: None,
        };

        self.store.insert_snapshot(&snapshot).await?;

        info!(
            id = snapshot.id,
            block_height = snapshot.block_height,
            eligible = snapshot.eligible_count,
            merkle_root = %snapshot.merkle_root,
            "generated draft snapshot"
        );

        Ok(snapshot)
    }

    pub async fn finalize_snapshot(&self, id: &str) -> Result<Snapshot, SnapshotError> {
        match self.store.finalize_snapshot(id, Utc::now()).await? {
            FinalizeOutcome::Finalized(snapshot) => {
                info!(id, merkle_root = %snapshot.merkle_root, "finalized snapshot");
                Ok(snapshot)
            }
            FinalizeOutcome::NotFound => Err(SnapshotError::NotFound(id.to_string())),
            FinalizeOutcome::AlreadyFinalized => {
                Err(SnapshotError::AlreadyFinalized(id.to_string()))
            }
        }
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.store.snapshot(id).await?)
    }

    /// The most recently created snapshot, draft or finalized.
    pub async fn get_latest_snapshot(&self) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.store.latest_snapshot().await?)
    }

    /// Newest first.
    pub async fn get_all_snapshots(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        Ok(self.store.all_snapshots().await?)
    }

    pub async fn proof(
        &self,
        id: &str,
        address: &Address,
    ) -> Result<Option<SnapshotProof>, SnapshotError> {
        let snapshot = self
            .store
            .snapshot(id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;

        let tree = snapshot.merkle_tree()?;
        if tree.root() != snapshot.merkle_root {
            return Err(SnapshotError::Integrity {
                id: id.to_string(),
                reason: "stored root does not match stored leaves".into(),
            });
        }

        let proof = tree
            .index_of(address)
            .and_then(|index| Some((snapshot.leaves.get(index)?.clone(), tree.proof(index)?)));

        Ok(proof.map(|(leaf, proof)| SnapshotProof {
            snapshot_id: snapshot.id.clone(),
            merkle_root: snapshot.merkle_root,
            leaf,
            proof,
        }))
    }

    /// True when `proof` shows `(address, amount)` is a leaf of the snapshot's stored root.
    /// Unknown snapshots and store failures are reported as false.
    pub async fn verify_proof(
        &self,
        id: &str,
        address: &Address,
        amount: TokenAmount,
        proof: &MerkleProof,
    ) -> bool {
        match self.store.snapshot(id).await {
            Ok(Some(snapshot)) => {
                let valid = merkle::verify_proof(&snapshot.merkle_root, address, amount, proof);
                debug!(id, %address, valid, "verified snapshot proof");
                valid
            }
            Ok(None) => {
                warn!(id, "asked to verify proof against unknown snapshot");
                false
            }
            Err(error) => {
                warn!(id, %error, "failed to load snapshot to verify proof");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use crate::{
        activity::{ActivityCalculator, ActivitySummary, ScoringWeights, SummarySet},
        indexer::{AddressDelta, BlockBatch, BlockRecord, IndexStore},
        store::MemoryStore,
    };

    use super::*;

    fn address(last_byte: u8) -> Address {
        format!("0x{:040x}", last_byte).parse().unwrap()
    }

    async fn store_with_scores(as_of_block: BlockNumber, scores: &[(u8, u64)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut summaries: Vec<ActivitySummary> = scores
            .iter()
            .map(|(byte, score)| ActivitySummary {
                address: address(*byte),
                score: *score,
                eligible: *score >= 15,
            })
            .collect();
        summaries.sort_by(|a, b| a.address.cmp(&b.address));
        store
            .replace_summaries(&SummarySet {
                as_of_block,
                eligibility_threshold: 15,
                summaries,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn proportional_snapshot_test() {
        let store = store_with_scores(100, &[(0xa, 10), (0xb, 20), (0xc, 30)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));

        let snapshot = builder.generate_snapshot(Some(100)).await.unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Draft);
        assert_eq!(snapshot.total_allocated, TokenAmount(1_000));
        assert_eq!(snapshot.total_addresses, 3);
        assert_eq!(
            snapshot.leaves,
            vec![
                SnapshotLeaf {
                    address: address(0xb),
                    amount: TokenAmount(400),
                    score: 20,
                    index: 0,
                },
                SnapshotLeaf {
                    address: address(0xc),
                    amount: TokenAmount(600),
                    score: 30,
                    index: 1,
                },
            ]
        );

        let left = merkle::leaf_hash(&address(0xb), TokenAmount(400), 0);
        let right = merkle::leaf_hash(&address(0xc), TokenAmount(600), 1);
        assert_eq!(snapshot.merkle_root, merkle::node_hash(&left, &right));
        snapshot.verify_integrity().unwrap();
    }

    #[tokio::test]
    async fn empty_snapshot_test() {
        let store = store_with_scores(100, &[(0xa, 1), (0xb, 2)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));

        let snapshot = builder.generate_snapshot(None).await.unwrap();

        assert!(snapshot.leaves.is_empty());
        assert_eq!(snapshot.merkle_root, merkle::EMPTY_ROOT);
        assert_eq!(snapshot.total_allocated, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn wrong_height_test() {
        let store = store_with_scores(100, &[(0xa, 20)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));

        let result = builder.generate_snapshot(Some(99)).await;

        assert!(matches!(
            result,
            Err(SnapshotError::SummariesNotAtHeight {
                requested: 99,
                available: 100
            })
        ));
        assert!(builder.get_all_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_once_test() {
        let store = store_with_scores(100, &[(0xa, 20)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));
        let draft = builder.generate_snapshot(None).await.unwrap();

        let finalized = builder.finalize_snapshot(&draft.id).await.unwrap();
        assert_eq!(finalized.status, SnapshotStatus::Finalized);
        assert!(finalized.finalized_at.is_some());
        assert_eq!(finalized.merkle_root, draft.merkle_root);
        assert_eq!(finalized.leaves, draft.leaves);

        assert!(matches!(
            builder.finalize_snapshot(&draft.id).await,
            Err(SnapshotError::AlreadyFinalized(_))
        ));
        assert!(matches!(
            builder.finalize_snapshot("missing").await,
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_finalize_test() {
        let store = store_with_scores(100, &[(0xa, 20)]).await;
        let builder = Arc::new(SnapshotBuilder::new(store, 15, TokenAmount(1_000)));
        let draft = builder.generate_snapshot(None).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let builder = builder.clone();
                let id = draft.id.clone();
                tokio::spawn(async move { builder.finalize_snapshot(&id).await.is_ok() })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn accessors_test() {
        let store = store_with_scores(100, &[(0xa, 20)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));
        assert_eq!(builder.get_latest_snapshot().await.unwrap(), None);

        let first = builder.generate_snapshot(None).await.unwrap();
        let second = builder.generate_snapshot(None).await.unwrap();
        builder.finalize_snapshot(&first.id).await.unwrap();

        let latest = builder.get_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let ids: Vec<String> = builder
            .get_all_snapshots()
            .await
            .unwrap()
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect();
        assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);

        assert_eq!(
            builder.get_snapshot(&first.id).await.unwrap().unwrap().status,
            SnapshotStatus::Finalized
        );
        assert_eq!(builder.get_snapshot("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn verify_proof_test() {
        let store = store_with_scores(100, &[(0xa, 10), (0xb, 20), (0xc, 30), (0xd, 40)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));
        let snapshot = builder.generate_snapshot(None).await.unwrap();

        let proof = builder
            .proof(&snapshot.id, &address(0xc))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(proof.leaf.amount, TokenAmount(333));

        assert!(
            builder
                .verify_proof(&snapshot.id, &address(0xc), proof.leaf.amount, &proof.proof)
                .await
        );
        assert!(
            !builder
                .verify_proof(&snapshot.id, &address(0xc), TokenAmount(334), &proof.proof)
                .await
        );
        assert!(
            !builder
                .verify_proof("missing", &address(0xc), proof.leaf.amount, &proof.proof)
                .await
        );
        assert_eq!(
            builder.proof(&snapshot.id, &address(0xa)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_integrity_test() {
        let store = store_with_scores(100, &[(0xb, 20), (0xc, 30)]).await;
        let builder = SnapshotBuilder::new(store, 15, TokenAmount(1_000));
        let mut snapshot = builder.generate_snapshot(None).await.unwrap();

        snapshot.leaves[0].amount = TokenAmount(500);
        snapshot.leaves[1].amount = TokenAmount(500);

        assert!(matches!(
            snapshot.verify_integrity(),
            Err(SnapshotError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_from_scored_index_test() {
        let store = Arc::new(MemoryStore::new());
        let deltas: BTreeMap<Address, AddressDelta> = [(0xa, 10), (0xb, 20), (0xc, 30)]
            .into_iter()
            .map(|(byte, count)| {
                (
                    address(byte),
                    AddressDelta {
                        transaction_count: count,
                        ..AddressDelta::default()
                    },
                )
            })
            .collect();
        store
            .commit_block(&BlockBatch {
                block: BlockRecord {
                    number: 20_000,
                    hash: "0x01".into(),
                    parent_hash: "0x00".into(),
                    timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                    transaction_count: 0,
                },
                transactions: vec![],
                token_transfers: vec![],
                staking_events: vec![],
                governance_events: vec![],
                address_deltas: deltas,
            })
            .await
            .unwrap();

        ActivityCalculator::new(store.clone(), ScoringWeights::V1, 15, TokenAmount(1_000))
            .score_all()
            .await
            .unwrap();
        let snapshot = SnapshotBuilder::new(store, 15, TokenAmount(1_000))
            .generate_snapshot(Some(20_000))
            .await
            .unwrap();

        let amounts: Vec<u128> = snapshot.leaves.iter().map(|leaf| leaf.amount.0).collect();
        assert_eq!(amounts, vec![400, 600]);
    }
}
