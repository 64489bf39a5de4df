//! Turns a finalized snapshot and a supply policy into final genesis balances.
//!
//! Baseline allocations are taken off the total supply first. What is left is the airdrop pool,
//! split over the snapshot's leaves by score. With a per-address cap, shares above the cap are
//! fixed at the cap and the rest of the pool is split again over the addresses still below it,
//! until nobody exceeds the cap. Whatever cannot be handed out goes to the configured unallocated
//! recipient. The result always sums to the total supply exactly.
//!
//! Each airdrop recipient is also classified into a tier by score. Tiers are reported alongside
//! the amounts and never change them.

use std::{collections::BTreeMap, fmt, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    distribution::{split_proportionally, DistributionError},
    snapshot::{Snapshot, SnapshotError, SnapshotStatus},
    units::{Address, TokenAmount},
};

use super::GenesisConfig;

/// Largest number of decimals whose unit, 10^decimals, fits in a u128.
pub const MAX_DECIMALS: u32 = 38;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("snapshot {0} is not finalized")]
    SnapshotNotFinalized(String),
    #[error("{0} decimals is more than the supported {}", MAX_DECIMALS)]
    UnsupportedDecimals(u32),
    #[error("tier thresholds must not decrease from bronze to platinum")]
    UnorderedTiers,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("baseline allocations exceed the total supply of {0}")]
    BaselineExceedsSupply(TokenAmount),
    #[error("{0} cannot be distributed and no unallocated recipient is configured")]
    UndistributablePool(TokenAmount),
    #[error("allocations sum to {actual}, expected the total supply of {expected}")]
    ConservationViolated {
        expected: TokenAmount,
        actual: TokenAmount,
    },
    #[error("allocation amounts overflow")]
    Overflow,
    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
        };
        f.write_str(name)
    }
}

/// Minimum score for each tier.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierThresholds {
    pub bronze: u64,
    pub silver: u64,
    pub gold: u64,
    pub platinum: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            bronze: 100,
            silver: 500,
            gold: 1_000,
            platinum: 5_000,
        }
    }
}

impl TierThresholds {
    /// The highest tier `score` reaches, none below bronze.
    pub fn classify(&self, score: u64) -> Option<Tier> {
        if score >= self.platinum {
            Some(Tier::Platinum)
        } else if score >= self.gold {
            Some(Tier::Gold)
        } else if score >= self.silver {
            Some(Tier::Silver)
        } else if score >= self.bronze {
            Some(Tier::Bronze)
        } else {
            None
        }
    }

    fn is_ordered(&self) -> bool {
        self.bronze <= self.silver && self.silver <= self.gold && self.gold <= self.platinum
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TierCounts {
    pub bronze: u64,
    pub silver: u64,
    pub gold: u64,
    pub platinum: u64,
}

impl TierCounts {
    fn count(allocations: &[Allocation]) -> Self {
        let mut counts = Self::default();
        for tier in allocations.iter().filter_map(|allocation| allocation.tier) {
            let counter = match tier {
                Tier::Bronze => &mut counts.bronze,
                Tier::Silver => &mut counts.silver,
                Tier::Gold => &mut counts.gold,
                Tier::Platinum => &mut counts.platinum,
            };
            *counter += 1;
        }
        counts
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub address: Address,
    pub amount: TokenAmount,
    pub baseline: TokenAmount,
    pub airdrop: TokenAmount,
    /// Snapshot score, 0 for addresses that only hold a baseline allocation.
    pub score: u64,
    /// Only airdrop recipients scoring at least the bronze threshold have a tier.
    pub tier: Option<Tier>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStatistics {
    pub count: u64,
    pub min: TokenAmount,
    pub max: TokenAmount,
    pub median: TokenAmount,
    pub average: TokenAmount,
    pub tier_counts: TierCounts,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    /// Sorted by address, zero balances left out.
    pub allocations: Vec<Allocation>,
    pub total_allocated: TokenAmount,
    pub airdrop_pool: TokenAmount,
    /// Part of the airdrop pool that went to the unallocated recipient.
    pub unallocated: TokenAmount,
    pub statistics: AllocationStatistics,
}

/// Splits `pool` by weight without giving anyone more than `cap`. Returns the amounts, in the
/// order of `weights`, and whatever could not be handed out.
fn split_with_cap(
    pool: TokenAmount,
    weights: &[(&Address, u64)],
    cap: Option<TokenAmount>,
) -> Result<(Vec<TokenAmount>, TokenAmount), DistributionError> {
    let mut amounts = vec![TokenAmount::ZERO; weights.len()];
    let mut capped = vec![false; weights.len()];
    let mut remaining = pool;

    loop {
        let open: Vec<usize> = (0..weights.len()).filter(|index| !capped[*index]).collect();
        if open.is_empty() || remaining.is_zero() {
            break;
        }

        let open_weights: Vec<(&Address, u64)> = open.iter().map(|index| weights[*index]).collect();
        let shares = split_proportionally(remaining, &open_weights)?;

        let over_cap: Vec<usize> = match cap {
            Some(cap) => open
                .iter()
                .zip(&shares)
                .filter(|(_, share)| **share > cap)
                .map(|(index, _)| *index)
                .collect(),
            None => vec![],
        };

        if over_cap.is_empty() {
            for (index, share) in open.into_iter().zip(shares) {
                amounts[index] = share;
            }
            remaining = TokenAmount::ZERO;
            break;
        }

        // Over-cap shares sum to more than their caps, so this cannot underflow.
        if let Some(cap) = cap {
            for index in over_cap {
                amounts[index] = cap;
                capped[index] = true;
                remaining = remaining - cap;
            }
        }
    }

    Ok((amounts, remaining))
}

fn statistics(allocations: &[Allocation], total: TokenAmount) -> AllocationStatistics {
    let mut amounts: Vec<TokenAmount> = allocations.iter().map(|allocation| allocation.amount).collect();
    amounts.sort();

    let (Some(min), Some(max)) = (amounts.first().copied(), amounts.last().copied()) else {
        return AllocationStatistics::default();
    };

    let count = amounts.len();
    let median = if count % 2 == 1 {
        amounts[count / 2]
    } else {
        let (low, high) = (amounts[count / 2 - 1].0, amounts[count / 2].0);
        // Averages without overflowing.
        TokenAmount(low / 2 + high / 2 + (low % 2 + high % 2) / 2)
    };

    AllocationStatistics {
        count: count as u64,
        min,
        max,
        median,
        average: TokenAmount(total.0 / count as u128),
        tier_counts: TierCounts::count(allocations),
    }
}

fn allocation_entry<'a>(
    merged: &'a mut BTreeMap<Address, Allocation>,
    address: &Address,
) -> &'a mut Allocation {
    merged
        .entry(address.clone())
        .or_insert_with(|| Allocation {
            address: address.clone(),
            amount: TokenAmount::ZERO,
            baseline: TokenAmount::ZERO,
            airdrop: TokenAmount::ZERO,
            score: 0,
            tier: None,
        })
}

pub fn calculate_allocations(
    snapshot: &Snapshot,
    config: &GenesisConfig,
) -> Result<AllocationResult, AllocationError> {
    if snapshot.status != SnapshotStatus::Finalized {
        return Err(AllocationError::SnapshotNotFinalized(snapshot.id.clone()));
    }
    if config.decimals > MAX_DECIMALS {
        return Err(AllocationError::UnsupportedDecimals(config.decimals));
    }
    if !config.tiers.is_ordered() {
        return Err(AllocationError::UnorderedTiers);
    }
    snapshot.verify_integrity()?;

    let mut baseline_total = TokenAmount::ZERO;
    for entry in &config.baseline_allocations {
        baseline_total = baseline_total
            .checked_add(entry.amount)
            .ok_or(AllocationError::BaselineExceedsSupply(config.total_supply))?;
    }
    let airdrop_pool = config
        .total_supply
        .checked_sub(baseline_total)
        .ok_or(AllocationError::BaselineExceedsSupply(config.total_supply))?;

    let weights: Vec<(&Address, u64)> = snapshot
        .leaves
        .iter()
        .map(|leaf| (&leaf.address, leaf.score))
        .collect();
    let (airdrops, undistributed) =
        split_with_cap(airdrop_pool, &weights, config.max_allocation_per_address)?;

    debug!(
        leaves = weights.len(),
        %airdrop_pool,
        %undistributed,
        "split airdrop pool"
    );

    let mut merged: BTreeMap<Address, Allocation> = BTreeMap::new();

    for entry in &config.baseline_allocations {
        let allocation = allocation_entry(&mut merged, &entry.address);
        allocation.baseline = allocation
            .baseline
            .checked_add(entry.amount)
            .ok_or(AllocationError::Overflow)?;
    }

    for (leaf, airdrop) in snapshot.leaves.iter().zip(airdrops) {
        let allocation = allocation_entry(&mut merged, &leaf.address);
        allocation.airdrop = airdrop;
        allocation.score = leaf.score;
        allocation.tier = config.tiers.classify(leaf.score);
    }

    if !undistributed.is_zero() {
        let recipient = config
            .unallocated_recipient
            .as_ref()
            .ok_or(AllocationError::UndistributablePool(undistributed))?;
        let allocation = allocation_entry(&mut merged, recipient);
        allocation.airdrop = allocation
            .airdrop
            .checked_add(undistributed)
            .ok_or(AllocationError::Overflow)?;
    }

    let mut allocations = Vec::with_capacity(merged.len());
    for (_, mut allocation) in merged {
        allocation.amount = allocation
            .baseline
            .checked_add(allocation.airdrop)
            .ok_or(AllocationError::Overflow)?;
        if !allocation.amount.is_zero() {
            allocations.push(allocation);
        }
    }

    let amounts: Vec<TokenAmount> = allocations.iter().map(|allocation| allocation.amount).collect();
    let total_allocated = TokenAmount::checked_sum(&amounts).ok_or(AllocationError::Overflow)?;
    if total_allocated != config.total_supply {
        return Err(AllocationError::ConservationViolated {
            expected: config.total_supply,
            actual: total_allocated,
        });
    }

    let statistics = statistics(&allocations, total_allocated);

    info!(
        snapshot_id = %snapshot.id,
        allocations = allocations.len(),
        %total_allocated,
        unallocated = %undistributed,
        "calculated genesis allocations"
    );

    Ok(AllocationResult {
        allocations,
        total_allocated,
        airdrop_pool,
        unallocated: undistributed,
        statistics,
    })
}

/// Whole tokens with thousands separators and four fractional digits, e.g. `1,234.5000`.
pub fn format_allocation(amount: TokenAmount, decimals: u32) -> String {
    amount.format(decimals)
}

/// Parts per million of `total`, rounded down. Amounts too large to scale are divided by a
/// rounded-down million-th of `total` instead.
pub fn share_ppm(amount: TokenAmount, total: TokenAmount) -> u64 {
    if total.is_zero() {
        return 0;
    }

    let ppm = match amount.0.checked_mul(1_000_000) {
        Some(scaled) => scaled / total.0,
        None => amount.0 / (total.0 / 1_000_000).max(1),
    };
    u64::try_from(ppm).unwrap_or(u64::MAX)
}

#[derive(Debug, Serialize)]
struct AllocationRow<'a> {
    address: &'a str,
    amount: String,
    score: u64,
    share_ppm: u64,
}

/// Writes `address,amount,score,share_ppm` rows, amounts in the smallest unit.
pub fn export_allocations_csv(
    allocations: &[(Address, TokenAmount, u64)],
    total_supply: TokenAmount,
    path: &Path,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;

    for (address, amount, score) in allocations {
        writer.serialize(AllocationRow {
            address: address.as_str(),
            amount: amount.to_string(),
            score: *score,
            share_ppm: share_ppm(*amount, total_supply),
        })?;
    }

    writer.flush()?;

    Ok(())
}
