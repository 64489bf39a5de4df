use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    chain_reader::BlockNumber,
    units::{Address, TokenAmount},
};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlockRecord {
    pub number: BlockNumber,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    pub transaction_count: i64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TxStatus::Success),
            "failed" => Ok(TxStatus::Failed),
            unknown => Err(format!("unknown transaction status {unknown}")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransactionRecord {
    pub hash: String,
    pub block_number: BlockNumber,
    pub transaction_index: i64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: TokenAmount,
    pub status: TxStatus,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenTransfer {
    pub transaction_hash: String,
    pub log_index: i64,
    pub block_number: BlockNumber,
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StakingEventKind {
    Stake,
    Unstake,
}

impl StakingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakingEventKind::Stake => "stake",
            StakingEventKind::Unstake => "unstake",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StakingEvent {
    pub transaction_hash: String,
    pub log_index: i64,
    pub block_number: BlockNumber,
    pub kind: StakingEventKind,
    pub staker: Address,
    pub amount: TokenAmount,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceEventKind {
    ProposalCreated,
    VoteCast,
}

impl GovernanceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernanceEventKind::ProposalCreated => "proposal_created",
            GovernanceEventKind::VoteCast => "vote_cast",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct GovernanceEvent {
    pub transaction_hash: String,
    pub log_index: i64,
    pub block_number: BlockNumber,
    pub kind: GovernanceEventKind,
    pub participant: Address,
    /// Hex encoded uint256.
    pub proposal_id: String,
    pub support: Option<i16>,
}

/// Per block change to an address's counters. Amounts are summed per block before they are
/// applied so one block touches each address row once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressDelta {
    pub transaction_count: u64,
    pub sent_count: u64,
    pub received_count: u64,
    pub total_sent: TokenAmount,
    pub total_received: TokenAmount,
    pub token_transfer_count: u64,
    pub token_volume: TokenAmount,
    pub staking_event_count: u64,
    pub staked: TokenAmount,
    pub unstaked: TokenAmount,
    pub governance_votes: u64,
    pub proposals_created: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("counters for address {0} overflowed")]
pub struct CounterOverflow(pub Address);

fn add_amount(
    address: &Address,
    current: TokenAmount,
    delta: TokenAmount,
) -> Result<TokenAmount, CounterOverflow> {
    current
        .checked_add(delta)
        .ok_or_else(|| CounterOverflow(address.clone()))
}

impl AddressDelta {
    pub fn merge(&mut self, address: &Address, other: &AddressDelta) -> Result<(), CounterOverflow> {
        self.transaction_count += other.transaction_count;
        self.sent_count += other.sent_count;
        self.received_count += other.received_count;
        self.total_sent = add_amount(address, self.total_sent, other.total_sent)?;
        self.total_received = add_amount(address, self.total_received, other.total_received)?;
        self.token_transfer_count += other.token_transfer_count;
        self.token_volume = add_amount(address, self.token_volume, other.token_volume)?;
        self.staking_event_count += other.staking_event_count;
        self.staked = add_amount(address, self.staked, other.staked)?;
        self.unstaked = add_amount(address, self.unstaked, other.unstaked)?;
        self.governance_votes += other.governance_votes;
        self.proposals_created += other.proposals_created;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: Address,
    pub first_seen: BlockNumber,
    pub last_seen: BlockNumber,
    pub transaction_count: u64,
    pub sent_count: u64,
    pub received_count: u64,
    pub total_sent: TokenAmount,
    pub total_received: TokenAmount,
    pub token_transfer_count: u64,
    pub token_volume: TokenAmount,
    pub staking_event_count: u64,
    pub staked_balance: TokenAmount,
    pub staking_since: Option<BlockNumber>,
    pub closed_staking_blocks: u64,
    pub governance_votes: u64,
    pub proposals_created: u64,
}

impl AddressRecord {
    pub fn new(address: Address, block_number: BlockNumber) -> Self {
        Self {
            address,
            first_seen: block_number,
            last_seen: block_number,
            transaction_count: 0,
            sent_count: 0,
            received_count: 0,
            total_sent: TokenAmount::ZERO,
            total_received: TokenAmount::ZERO,
            token_transfer_count: 0,
            token_volume: TokenAmount::ZERO,
            staking_event_count: 0,
            staked_balance: TokenAmount::ZERO,
            staking_since: None,
            closed_staking_blocks: 0,
            governance_votes: 0,
            proposals_created: 0,
        }
    }

    /// Insert-or-increment. Unstaking more than is staked empties the balance.
    pub fn apply(
        &mut self,
        block_number: BlockNumber,
        delta: &AddressDelta,
    ) -> Result<(), CounterOverflow> {
        let address = self.address.clone();

        self.last_seen = self.last_seen.max(block_number);
        self.transaction_count += delta.transaction_count;
        self.sent_count += delta.sent_count;
        self.received_count += delta.received_count;
        self.total_sent = add_amount(&address, self.total_sent, delta.total_sent)?;
        self.total_received = add_amount(&address, self.total_received, delta.total_received)?;
        self.token_transfer_count += delta.token_transfer_count;
        self.token_volume = add_amount(&address, self.token_volume, delta.token_volume)?;
        self.staking_event_count += delta.staking_event_count;
        self.governance_votes += delta.governance_votes;
        self.proposals_created += delta.proposals_created;

        let was_staking = !self.staked_balance.is_zero();
        let with_stake = add_amount(&address, self.staked_balance, delta.staked)?;
        let unstaked = delta.unstaked.min(with_stake);
        self.staked_balance = with_stake.saturating_sub(unstaked);

        match (was_staking, self.staked_balance.is_zero()) {
            (false, false) => {
                self.staking_since = Some(block_number);
            }
            (true, true) => {
                if let Some(since) = self.staking_since.take() {
                    self.closed_staking_blocks += (block_number - since).max(0) as u64;
                }
            }
            _ => (),
        }

        Ok(())
    }

    /// Blocks spent with a positive staked balance up to `as_of`.
    pub fn staking_blocks(&self, as_of: BlockNumber) -> u64 {
        let open = self
            .staking_since
            .map(|since| (as_of - since).max(0) as u64)
            .unwrap_or(0);
        self.closed_staking_blocks + open
    }

    pub fn transfer_volume(&self) -> Option<TokenAmount> {
        TokenAmount::checked_sum(&[self.total_sent, self.total_received, self.token_volume])
    }

    pub fn governance_participation(&self) -> u64 {
        self.governance_votes + self.proposals_created
    }
}

/// Everything the indexer commits for one block, in one atomic unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBatch {
    pub block: BlockRecord,
    pub transactions: Vec<TransactionRecord>,
    pub token_transfers: Vec<TokenTransfer>,
    pub staking_events: Vec<StakingEvent>,
    pub governance_events: Vec<GovernanceEvent>,
    pub address_deltas: BTreeMap<Address, AddressDelta>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexedAddresses {
    pub last_indexed_block: Option<BlockNumber>,
    /// Sorted by address.
    pub records: Vec<AddressRecord>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IndexerStats {
    pub blocks_indexed: u64,
    pub transactions: u64,
    pub addresses: u64,
    pub token_transfers: u64,
    pub staking_events: u64,
    pub governance_events: u64,
    pub last_indexed_block: Option<BlockNumber>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum RankingMetric {
    TransactionCount,
    TransferVolume,
    TokenTransfers,
    StakingDuration,
    GovernanceParticipation,
}

impl RankingMetric {
    /// The value addresses are ranked by, widened so every metric compares the same way.
    pub fn value(&self, record: &AddressRecord, as_of: BlockNumber) -> u128 {
        match self {
            RankingMetric::TransactionCount => record.transaction_count.into(),
            RankingMetric::TransferVolume => record
                .transfer_volume()
                .map(|amount| amount.0)
                .unwrap_or(u128::MAX),
            RankingMetric::TokenTransfers => record.token_transfer_count.into(),
            RankingMetric::StakingDuration => record.staking_blocks(as_of).into(),
            RankingMetric::GovernanceParticipation => record.governance_participation().into(),
        }
    }
}

impl Display for RankingMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RankingMetric::TransactionCount => "transaction-count",
            RankingMetric::TransferVolume => "transfer-volume",
            RankingMetric::TokenTransfers => "token-transfers",
            RankingMetric::StakingDuration => "staking-duration",
            RankingMetric::GovernanceParticipation => "governance-participation",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staker() -> Address {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    fn stake(amount: u128) -> AddressDelta {
        AddressDelta {
            staking_event_count: 1,
            staked: TokenAmount(amount),
            ..AddressDelta::default()
        }
    }

    fn unstake(amount: u128) -> AddressDelta {
        AddressDelta {
            staking_event_count: 1,
            unstaked: TokenAmount(amount),
            ..AddressDelta::default()
        }
    }

    #[test]
    fn staking_duration_test() {
        let mut record = AddressRecord::new(staker(), 10);
        record.apply(10, &stake(100)).unwrap();
        assert_eq!(record.staking_since, Some(10));
        assert_eq!(record.staking_blocks(25), 15);

        record.apply(20, &stake(50)).unwrap();
        assert_eq!(record.staking_since, Some(10));

        record.apply(30, &unstake(150)).unwrap();
        assert_eq!(record.staked_balance, TokenAmount::ZERO);
        assert_eq!(record.staking_since, None);
        assert_eq!(record.closed_staking_blocks, 20);
        assert_eq!(record.staking_blocks(1_000), 20);

        record.apply(40, &stake(1)).unwrap();
        assert_eq!(record.staking_blocks(45), 25);
        assert_eq!(record.staking_event_count, 4);
        assert_eq!(record.last_seen, 40);
    }

    #[test]
    fn unstake_more_than_staked_test() {
        let mut record = AddressRecord::new(staker(), 1);
        record.apply(1, &stake(10)).unwrap();
        record.apply(2, &unstake(99)).unwrap();
        assert_eq!(record.staked_balance, TokenAmount::ZERO);
        assert_eq!(record.closed_staking_blocks, 1);
    }

    #[test]
    fn stake_and_unstake_in_one_block_test() {
        let mut record = AddressRecord::new(staker(), 5);
        let mut delta = stake(10);
        delta.merge(&staker(), &unstake(10)).unwrap();
        record.apply(5, &delta).unwrap();
        assert_eq!(record.staked_balance, TokenAmount::ZERO);
        assert_eq!(record.staking_since, None);
        assert_eq!(record.closed_staking_blocks, 0);
    }

    #[test]
    fn overflow_is_reported_test() {
        let mut record = AddressRecord::new(staker(), 1);
        record.total_sent = TokenAmount(u128::MAX);
        let delta = AddressDelta {
            total_sent: TokenAmount(1),
            ..AddressDelta::default()
        };
        assert_eq!(record.apply(2, &delta), Err(CounterOverflow(staker())));
    }
}
