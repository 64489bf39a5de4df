//! Turns a fetched block, its receipts and its logs into the rows and address deltas the indexer
//! commits.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::warn;

use crate::{
    chain_reader::{ChainBlock, ChainLog, TransactionReceipt},
    units::{Address, TokenAmount},
};

use super::types::{
    AddressDelta, BlockBatch, BlockRecord, CounterOverflow, GovernanceEvent, GovernanceEventKind,
    StakingEvent, StakingEventKind, TokenTransfer, TransactionRecord, TxStatus,
};

pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

lazy_static! {
    pub static ref TRANSFER_TOPIC: String = event_topic("Transfer(address,address,uint256)");
    pub static ref STAKED_TOPIC: String = event_topic("Staked(address,uint256)");
    pub static ref UNSTAKED_TOPIC: String = event_topic("Unstaked(address,uint256)");
    pub static ref PROPOSAL_CREATED_TOPIC: String = event_topic(
        "ProposalCreated(uint256,address,address[],uint256[],string[],bytes[],uint256,uint256,string)"
    );
    pub static ref VOTE_CAST_TOPIC: String =
        event_topic("VoteCast(address,uint256,uint8,uint256,string)");
}

/// Contracts whose events count as staking or governance activity.
#[derive(Clone, Debug, Default)]
pub struct KnownContracts {
    pub staking: Option<Address>,
    pub governance: Option<Address>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("block {block_number} has {transactions} transactions but {receipts} receipts")]
    ReceiptCount {
        block_number: i64,
        transactions: usize,
        receipts: usize,
    },
    #[error("receipt for {receipt} does not belong to transaction {transaction}")]
    ReceiptMismatch {
        transaction: String,
        receipt: String,
    },
    #[error("block {block_number} has a log for transaction {transaction_hash}, which it does not contain")]
    LogOutsideBlock {
        block_number: i64,
        transaction_hash: String,
    },
    #[error("block {block_number} is {expected} but a receipt or log belongs to block {got}")]
    ForeignBlockHash {
        block_number: i64,
        expected: String,
        got: String,
    },
    #[error(transparent)]
    Overflow(#[from] CounterOverflow),
}

impl DecodeError {
    /// Receipts and logs that do not line up with the block were fetched while the node switched
    /// heads. Fetching the block again resolves these.
    pub fn is_inconsistent_fetch(&self) -> bool {
        matches!(
            self,
            DecodeError::ReceiptCount { .. }
                | DecodeError::ReceiptMismatch { .. }
                | DecodeError::LogOutsideBlock { .. }
                | DecodeError::ForeignBlockHash { .. }
        )
    }
}

fn check_block_hash(block: &ChainBlock, block_hash: Option<&str>) -> Result<(), DecodeError> {
    match block_hash {
        Some(block_hash) if !block_hash.eq_ignore_ascii_case(&block.hash) => {
            Err(DecodeError::ForeignBlockHash {
                block_number: block.number,
                expected: block.hash.clone(),
                got: block_hash.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn decode_hex(hex_str: &str) -> Option<Vec<u8>> {
    hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str)).ok()
}

fn data_words(log: &ChainLog) -> Option<Vec<[u8; 32]>> {
    let data = decode_hex(&log.data)?;
    if data.len() % 32 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(32)
            .map(|chunk| {
                let mut word = [0u8; 32];
                word.copy_from_slice(chunk);
                word
            })
            .collect(),
    )
}

fn topic_address(topic: &str) -> Option<Address> {
    Address::from_word(&decode_hex(topic)?)
}

/// uint256 values beyond u128 are not supported and make the log malformed.
fn word_amount(word: &[u8; 32]) -> Option<TokenAmount> {
    if word[..16].iter().any(|byte| *byte != 0) {
        return None;
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Some(TokenAmount(u128::from_be_bytes(low)))
}

fn decode_token_transfer(block_number: i64, log: &ChainLog) -> Option<TokenTransfer> {
    if log.topics.len() != 3 {
        return None;
    }
    let words = data_words(log)?;
    let [value_word] = words.as_slice() else {
        return None;
    };
    Some(TokenTransfer {
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index as i64,
        block_number,
        token: log.address.clone(),
        from: topic_address(&log.topics[1])?,
        to: topic_address(&log.topics[2])?,
        value: word_amount(value_word)?,
    })
}

fn decode_staking_event(
    block_number: i64,
    kind: StakingEventKind,
    log: &ChainLog,
) -> Option<StakingEvent> {
    if log.topics.len() != 2 {
        return None;
    }
    let words = data_words(log)?;
    let [amount_word] = words.as_slice() else {
        return None;
    };
    Some(StakingEvent {
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index as i64,
        block_number,
        kind,
        staker: topic_address(&log.topics[1])?,
        amount: word_amount(amount_word)?,
    })
}

fn decode_proposal_created(block_number: i64, log: &ChainLog) -> Option<GovernanceEvent> {
    let words = data_words(log)?;
    if log.topics.len() != 1 || words.len() < 2 {
        return None;
    }
    Some(GovernanceEvent {
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index as i64,
        block_number,
        kind: GovernanceEventKind::ProposalCreated,
        participant: Address::from_word(&words[1])?,
        proposal_id: format!("0x{}", hex::encode(words[0])),
        support: None,
    })
}

fn decode_vote_cast(block_number: i64, log: &ChainLog) -> Option<GovernanceEvent> {
    let words = data_words(log)?;
    if log.topics.len() != 2 || words.len() < 2 {
        return None;
    }
    // support is a uint8, For/Against/Abstain.
    let support_word = &words[1];
    if support_word[..31].iter().any(|byte| *byte != 0) {
        return None;
    }
    Some(GovernanceEvent {
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index as i64,
        block_number,
        kind: GovernanceEventKind::VoteCast,
        participant: topic_address(&log.topics[1])?,
        proposal_id: format!("0x{}", hex::encode(words[0])),
        support: Some(support_word[31].into()),
    })
}

#[derive(Default)]
struct DeltaCollector {
    deltas: BTreeMap<Address, AddressDelta>,
}

impl DeltaCollector {
    fn add(&mut self, address: &Address, delta: AddressDelta) -> Result<(), CounterOverflow> {
        self.deltas
            .entry(address.clone())
            .or_default()
            .merge(address, &delta)
    }
}

pub fn decode_block(
    block: &ChainBlock,
    receipts: &[TransactionReceipt],
    logs: &[ChainLog],
    known_contracts: &KnownContracts,
) -> Result<BlockBatch, DecodeError> {
    if block.transactions.len() != receipts.len() {
        return Err(DecodeError::ReceiptCount {
            block_number: block.number,
            transactions: block.transactions.len(),
            receipts: receipts.len(),
        });
    }

    let mut collector = DeltaCollector::default();
    let mut transactions = Vec::with_capacity(block.transactions.len());
    let mut statuses = HashMap::with_capacity(block.transactions.len());

    for (transaction, receipt) in block.transactions.iter().zip(receipts) {
        if !transaction.hash.eq_ignore_ascii_case(&receipt.transaction_hash) {
            return Err(DecodeError::ReceiptMismatch {
                transaction: transaction.hash.clone(),
                receipt: receipt.transaction_hash.clone(),
            });
        }
        check_block_hash(block, receipt.block_hash.as_deref())?;

        let status = if receipt.succeeded() {
            TxStatus::Success
        } else {
            TxStatus::Failed
        };
        statuses.insert(transaction.hash.to_lowercase(), status);

        // A failed transaction still counts as activity for its sender, but moves no value.
        let moved = match status {
            TxStatus::Success => transaction.value,
            TxStatus::Failed => TokenAmount::ZERO,
        };

        collector.add(
            &transaction.from,
            AddressDelta {
                transaction_count: 1,
                sent_count: 1,
                total_sent: moved,
                ..AddressDelta::default()
            },
        )?;

        // Sending to yourself is one transaction, not two.
        let to_other = transaction.to.as_ref().filter(|to| **to != transaction.from);
        if let (Some(to), TxStatus::Success) = (to_other, status) {
            collector.add(
                to,
                AddressDelta {
                    transaction_count: 1,
                    received_count: 1,
                    total_received: moved,
                    ..AddressDelta::default()
                },
            )?;
        }

        transactions.push(TransactionRecord {
            hash: transaction.hash.clone(),
            block_number: block.number,
            transaction_index: transaction.transaction_index as i64,
            from: transaction.from.clone(),
            to: transaction.to.clone(),
            value: transaction.value,
            status,
        });
    }

    let mut token_transfers = Vec::new();
    let mut staking_events = Vec::new();
    let mut governance_events = Vec::new();

    for log in logs {
        if log.removed {
            continue;
        }
        check_block_hash(block, log.block_hash.as_deref())?;

        match statuses.get(&log.transaction_hash.to_lowercase()) {
            Some(TxStatus::Success) => (),
            Some(TxStatus::Failed) => continue,
            None => {
                return Err(DecodeError::LogOutsideBlock {
                    block_number: block.number,
                    transaction_hash: log.transaction_hash.clone(),
                })
            }
        }

        let Some(topic) = log.topics.first().map(|topic| topic.to_lowercase()) else {
            continue;
        };

        let is_staking_contract = known_contracts.staking.as_ref() == Some(&log.address);
        let is_governance_contract = known_contracts.governance.as_ref() == Some(&log.address);

        if topic == *TRANSFER_TOPIC {
            match decode_token_transfer(block.number, log) {
                Some(transfer) => {
                    let delta = AddressDelta {
                        token_transfer_count: 1,
                        token_volume: transfer.value,
                        ..AddressDelta::default()
                    };
                    collector.add(&transfer.from, delta.clone())?;
                    collector.add(&transfer.to, delta)?;
                    token_transfers.push(transfer);
                }
                // ERC721 transfers share the topic but index the token id, skip those quietly.
                None if log.topics.len() == 4 => (),
                None => warn!(
                    block_number = block.number,
                    log_index = log.log_index,
                    "malformed transfer log, skipping"
                ),
            }
        } else if is_staking_contract && (topic == *STAKED_TOPIC || topic == *UNSTAKED_TOPIC) {
            let kind = if topic == *STAKED_TOPIC {
                StakingEventKind::Stake
            } else {
                StakingEventKind::Unstake
            };
            match decode_staking_event(block.number, kind, log) {
                Some(event) => {
                    let delta = match kind {
                        StakingEventKind::Stake => AddressDelta {
                            staking_event_count: 1,
                            staked: event.amount,
                            ..AddressDelta::default()
                        },
                        StakingEventKind::Unstake => AddressDelta {
                            staking_event_count: 1,
                            unstaked: event.amount,
                            ..AddressDelta::default()
                        },
                    };
                    collector.add(&event.staker, delta)?;
                    staking_events.push(event);
                }
                None => warn!(
                    block_number = block.number,
                    log_index = log.log_index,
                    "malformed staking log, skipping"
                ),
            }
        } else if is_governance_contract
            && (topic == *PROPOSAL_CREATED_TOPIC || topic == *VOTE_CAST_TOPIC)
        {
            let event = if topic == *PROPOSAL_CREATED_TOPIC {
                decode_proposal_created(block.number, log)
            } else {
                decode_vote_cast(block.number, log)
            };
            match event {
                Some(event) => {
                    let delta = match event.kind {
                        GovernanceEventKind::ProposalCreated => AddressDelta {
                            proposals_created: 1,
                            ..AddressDelta::default()
                        },
                        GovernanceEventKind::VoteCast => AddressDelta {
                            governance_votes: 1,
                            ..AddressDelta::default()
                        },
                    };
                    collector.add(&event.participant, delta)?;
                    governance_events.push(event);
                }
                None => warn!(
                    block_number = block.number,
                    log_index = log.log_index,
                    "malformed governance log, skipping"
                ),
            }
        }
    }

    Ok(BlockBatch {
        block: BlockRecord {
            number: block.number,
            hash: block.hash.clone(),
            parent_hash: block.parent_hash.clone(),
            timestamp: block.timestamp,
            transaction_count: block.transactions.len() as i64,
        },
        transactions,
        token_transfers,
        staking_events,
        governance_events,
        address_deltas: collector.deltas,
    })
}
