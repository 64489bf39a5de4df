//! Turns indexed address counters into activity scores and airdrop eligibility.

mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    chain_reader::BlockNumber,
    distribution::{checked_total, split_proportionally, DistributionError},
    indexer::{AddressRecord, IndexStore},
    store::StoreError,
    units::{Address, TokenAmount, WEI_PER_TOKEN},
};

pub use store::*;

/// Fixed scoring weights. A new weighting gets a new constant so earlier scores stay
/// reproducible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoringWeights {
    pub transaction_points: u64,
    pub transaction_cap: u64,
    /// Wei of combined native and token volume per point.
    pub volume_unit: u128,
    pub volume_cap: u64,
    pub token_transfer_points: u64,
    pub token_transfer_cap: u64,
    pub staking_event_points: u64,
    pub staking_blocks_per_point: u64,
    pub staking_cap: u64,
    pub vote_points: u64,
    pub proposal_points: u64,
    pub governance_cap: u64,
    pub early_adopter_before_block: BlockNumber,
    pub early_adopter_bonus: u64,
}

impl ScoringWeights {
    pub const V1: ScoringWeights = ScoringWeights {
        transaction_points: 1,
        transaction_cap: 1_000,
        volume_unit: 100 * WEI_PER_TOKEN,
        volume_cap: 500,
        token_transfer_points: 2,
        token_transfer_cap: 500,
        staking_event_points: 10,
        staking_blocks_per_point: 100,
        staking_cap: 2_000,
        vote_points: 50,
        proposal_points: 200,
        governance_cap: 1_000,
        early_adopter_before_block: 10_000,
        early_adopter_bonus: 100,
    };
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub transactions: u64,
    pub transfer_volume: u64,
    pub token_transfers: u64,
    pub staking: u64,
    pub governance: u64,
    pub early_adopter: u64,
    pub total: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InconsistentRecord {
    #[error("first seen {first_seen} is after last seen {last_seen}")]
    SeenOrder {
        first_seen: BlockNumber,
        last_seen: BlockNumber,
    },
    #[error("last seen {last_seen} is after as-of block {as_of}")]
    SeenAfterAsOf {
        last_seen: BlockNumber,
        as_of: BlockNumber,
    },
}

fn capped(points: u64, cap: u64) -> u64 {
    points.min(cap)
}

impl ScoringWeights {
    pub fn breakdown(
        &self,
        record: &AddressRecord,
        as_of: BlockNumber,
    ) -> Result<ScoreBreakdown, InconsistentRecord> {
        if record.first_seen > record.last_seen {
            return Err(InconsistentRecord::SeenOrder {
                first_seen: record.first_seen,
                last_seen: record.last_seen,
            });
        }
        if record.last_seen > as_of {
            return Err(InconsistentRecord::SeenAfterAsOf {
                last_seen: record.last_seen,
                as_of,
            });
        }

        let transactions = capped(
            record.transaction_count.saturating_mul(self.transaction_points),
            self.transaction_cap,
        );

        // Volume beyond u128 can only score the cap anyway.
        let volume = record
            .transfer_volume()
            .map(|volume| volume.0)
            .unwrap_or(u128::MAX);
        let volume_points = u64::try_from(volume / self.volume_unit).unwrap_or(u64::MAX);
        let transfer_volume = capped(volume_points, self.volume_cap);

        let token_transfers = capped(
            record
                .token_transfer_count
                .saturating_mul(self.token_transfer_points),
            self.token_transfer_cap,
        );

        let staking = capped(
            record
                .staking_event_count
                .saturating_mul(self.staking_event_points)
                .saturating_add(record.staking_blocks(as_of) / self.staking_blocks_per_point),
            self.staking_cap,
        );

        let governance = capped(
            record
                .governance_votes
                .saturating_mul(self.vote_points)
                .saturating_add(record.proposals_created.saturating_mul(self.proposal_points)),
            self.governance_cap,
        );

        let early_adopter = if record.first_seen < self.early_adopter_before_block {
            self.early_adopter_bonus
        } else {
            0
        };

        Ok(ScoreBreakdown {
            transactions,
            transfer_volume,
            token_transfers,
            staking,
            governance,
            early_adopter,
            total: transactions + transfer_volume + token_transfers + staking + governance + early_adopter,
        })
    }

    /// Score of a record as of a block, zero for records that cannot be scored.
    pub fn score(&self, record: &AddressRecord, as_of: BlockNumber) -> u64 {
        match self.breakdown(record, as_of) {
            Ok(breakdown) => breakdown.total,
            Err(error) => {
                warn!(address = %record.address, %error, "inconsistent address record, scoring zero");
                0
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ActivitySummary {
    pub address: Address,
    pub score: u64,
    pub eligible: bool,
}

/// The full set of scores, as computed at one indexed height.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SummarySet {
    pub as_of_block: BlockNumber,
    pub eligibility_threshold: u64,
    /// Sorted by address.
    pub summaries: Vec<ActivitySummary>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ScoreAllResult {
    pub processed: u64,
    pub eligible: u64,
    pub as_of_block: BlockNumber,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AirdropStats {
    pub as_of_block: Option<BlockNumber>,
    pub total_addresses: u64,
    pub eligible_count: u64,
    pub total_score: u64,
    pub max_score: u64,
    pub average_score: u64,
    pub provisional_total: TokenAmount,
}

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("no blocks have been indexed yet")]
    NothingIndexed,
    #[error("scores have not been computed yet")]
    NoSummaries,
    #[error(transparent)]
    Distribution(#[from] DistributionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ActivityCalculator<S> {
    store: Arc<S>,
    weights: ScoringWeights,
    eligibility_threshold: u64,
    snapshot_pool: TokenAmount,
}

impl<S> ActivityCalculator<S>
where
    S: IndexStore + ActivityStore + Send + Sync,
{
    pub fn new(
        store: Arc<S>,
        weights: ScoringWeights,
        eligibility_threshold: u64,
        snapshot_pool: TokenAmount,
    ) -> Self {
        Self {
            store,
            weights,
            eligibility_threshold,
            snapshot_pool,
        }
    }

    pub fn eligibility_threshold(&self) -> u64 {
        self.eligibility_threshold
    }

    /// Score of one address as of the last indexed block. Unknown addresses score zero.
    pub async fn score(&self, address: &Address) -> Result<ScoreBreakdown, ActivityError> {
        let as_of = self
            .store
            .last_indexed_block()
            .await?
            .ok_or(ActivityError::NothingIndexed)?;

        match self.store.address(address).await? {
            None => {
                warn!(%address, "no record for address, scoring zero");
                Ok(ScoreBreakdown::default())
            }
            Some(record) => Ok(self
                .weights
                .breakdown(&record, as_of)
                .unwrap_or_else(|error| {
                    warn!(%address, %error, "inconsistent address record, scoring zero");
                    ScoreBreakdown::default()
                })),
        }
    }

    /// Recomputes every address and replaces the stored summary set as one unit.
    pub async fn score_all(&self) -> Result<ScoreAllResult, ActivityError> {
        let indexed = self.store.indexed_addresses().await?;
        let as_of_block = indexed
            .last_indexed_block
            .ok_or(ActivityError::NothingIndexed)?;

        info!(
            as_of_block,
            addresses = indexed.records.len(),
            "scoring all addresses"
        );

        let mut progress = pit_wall::Progress::new("score-all", indexed.records.len() as u64);
        let mut summaries = Vec::with_capacity(indexed.records.len());
        for record in &indexed.records {
            let score = self.weights.score(record, as_of_block);
            summaries.push(ActivitySummary {
                address: record.address.clone(),
                score,
                eligible: score >= self.eligibility_threshold,
            });

            progress.inc_work_done();
            if progress.work_done % 10_000 == 0 {
                info!("{}", progress.get_progress_string());
            }
        }
        summaries.sort_by(|a, b| a.address.cmp(&b.address));

        let eligible = summaries.iter().filter(|summary| summary.eligible).count() as u64;
        let set = SummarySet {
            as_of_block,
            eligibility_threshold: self.eligibility_threshold,
            summaries,
        };
        self.store.replace_summaries(&set).await?;

        debug!(as_of_block, eligible, "stored summary set");

        Ok(ScoreAllResult {
            processed: set.summaries.len() as u64,
            eligible,
            as_of_block,
        })
    }

    /// Addresses scoring at least `threshold` in the stored summary set, by address.
    pub async fn eligible_addresses(
        &self,
        threshold: u64,
    ) -> Result<Vec<ActivitySummary>, ActivityError> {
        let set = self
            .store
            .summaries()
            .await?
            .ok_or(ActivityError::NoSummaries)?;

        Ok(set
            .summaries
            .into_iter()
            .filter(|summary| summary.score >= threshold)
            .collect())
    }

    pub async fn airdrop_stats(&self) -> Result<AirdropStats, ActivityError> {
        let Some(set) = self.store.summaries().await? else {
            return Ok(AirdropStats {
                as_of_block: None,
                total_addresses: 0,
                eligible_count: 0,
                total_score: 0,
                max_score: 0,
                average_score: 0,
                provisional_total: TokenAmount::ZERO,
            });
        };

        let eligible: Vec<&ActivitySummary> = set
            .summaries
            .iter()
            .filter(|summary| summary.score >= self.eligibility_threshold)
            .collect();
        let eligible_count = eligible.len() as u64;
        let total_score = eligible
            .iter()
            .fold(0u64, |sum, summary| sum.saturating_add(summary.score));
        let max_score = eligible.iter().map(|summary| summary.score).max().unwrap_or(0);
        let average_score = if eligible_count == 0 {
            0
        } else {
            total_score / eligible_count
        };

        let weights: Vec<(&Address, u64)> = eligible
            .iter()
            .map(|summary| (&summary.address, summary.score))
            .collect();
        let provisional = split_proportionally(self.snapshot_pool, &weights)?;
        let provisional_total = checked_total(&provisional)?;

        Ok(AirdropStats {
            as_of_block: Some(set.as_of_block),
            total_addresses: set.summaries.len() as u64,
            eligible_count,
            total_score,
            max_score,
            average_score,
            provisional_total,
        })
    }
}
