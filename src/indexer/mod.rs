//! Follows the testnet block by block and keeps the canonical store's copy of it current.
//!
//! Blocks are fetched ahead over a bounded window but committed strictly in height order, each
//! block together with the advanced `last_indexed_block`. A restarted indexer therefore resumes
//! at exactly the first block that was not committed. A block that does not extend the stored
//! chain halts the indexer, reorgs are not rolled back.

mod decode;
mod store;
mod types;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{stream::FuturesOrdered, StreamExt};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::{
    chain_reader::{BlockNumber, ChainBlock, ChainLog, ChainReader, ChainReaderError, TransactionReceipt},
    env::EnvConfig,
    store::StoreError,
    units::{Address, InvalidAddress},
};

pub use decode::{
    decode_block, event_topic, DecodeError, KnownContracts, PROPOSAL_CREATED_TOPIC, STAKED_TOPIC,
    TRANSFER_TOPIC, UNSTAKED_TOPIC, VOTE_CAST_TOPIC,
};
pub use store::*;
pub use types::*;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("chain data integrity violation: {0}")]
    DataIntegrity(String),
    #[error("cannot start at block {requested}, indexing resumes at block {resume}")]
    NonContiguousStart {
        requested: BlockNumber,
        resume: BlockNumber,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Where indexing starts when the store is empty.
    pub start_block: BlockNumber,
    pub fetch_concurrency: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub known_contracts: KnownContracts,
}

impl IndexerConfig {
    pub fn from_env(env_config: &EnvConfig) -> Result<Self, InvalidAddress> {
        let parse_contract = |contract: &Option<String>| {
            contract
                .as_deref()
                .map(|contract| contract.parse::<Address>())
                .transpose()
        };

        Ok(Self {
            start_block: env_config.start_block,
            fetch_concurrency: env_config.fetch_concurrency,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(env_config.max_backoff_secs),
            known_contracts: KnownContracts {
                staking: parse_contract(&env_config.staking_contract)?,
                governance: parse_contract(&env_config.governance_contract)?,
            },
        })
    }
}

/// Cooperative stop signal. The indexer checks it between blocks and wakes up from a retry wait
/// when it is raised.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn wait(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

struct FetchedBlock {
    block: ChainBlock,
    receipts: Vec<TransactionReceipt>,
    logs: Vec<ChainLog>,
}

async fn fetch_block<R: ChainReader + ?Sized>(
    reader: &R,
    block_number: BlockNumber,
) -> Result<Option<FetchedBlock>, ChainReaderError> {
    let Some(block) = reader.get_block_by_number(block_number).await? else {
        return Ok(None);
    };
    let receipts = reader.get_transaction_receipts(&block).await?;
    let logs = reader.get_logs(&block).await?;

    Ok(Some(FetchedBlock {
        block,
        receipts,
        logs,
    }))
}

fn check_extends_chain(
    requested: BlockNumber,
    stored_parent_hash: Option<&str>,
    block: &ChainBlock,
) -> Result<(), IndexerError> {
    if block.number != requested {
        return Err(IndexerError::DataIntegrity(format!(
            "requested block {requested}, node returned block {}",
            block.number
        )));
    }

    match stored_parent_hash {
        Some(stored_parent_hash) if stored_parent_hash != block.parent_hash => {
            Err(IndexerError::DataIntegrity(format!(
                "block {requested} has parent hash {}, but the stored block {} has hash {stored_parent_hash}",
                block.parent_hash,
                requested - 1
            )))
        }
        _ => Ok(()),
    }
}

pub struct Indexer<R, S> {
    config: IndexerConfig,
    reader: Arc<R>,
    stop_handle: StopHandle,
    store: Arc<S>,
}

impl<R, S> Indexer<R, S>
where
    R: ChainReader + Send + Sync,
    S: IndexStore + Send + Sync,
{
    pub fn new(reader: Arc<R>, store: Arc<S>, config: IndexerConfig) -> Self {
        Self {
            config,
            reader,
            stop_handle: StopHandle::default(),
            store,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    pub fn stop(&self) {
        self.stop_handle.stop();
    }

    pub async fn stats(&self) -> Result<IndexerStats, IndexerError> {
        Ok(self.store.stats().await?)
    }

    pub async fn top_addresses(
        &self,
        limit: usize,
        metric: RankingMetric,
    ) -> Result<Vec<AddressRecord>, IndexerError> {
        Ok(self.store.top_addresses(limit, metric).await?)
    }

    async fn resume_height(&self, from: Option<BlockNumber>) -> Result<BlockNumber, IndexerError> {
        let last_indexed = self.store.last_indexed_block().await?;
        let resume = last_indexed.map_or(self.config.start_block, |last| last + 1);

        match from {
            None => Ok(resume),
            Some(requested) if requested == resume || last_indexed.is_none() => Ok(requested),
            Some(requested) => Err(IndexerError::NonContiguousStart { requested, resume }),
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            current_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Indexes until stopped or until the chain data stops making sense. Returns Ok only after a
    /// stop, with every block fetched before the stop committed.
    pub async fn start(&self, from: Option<BlockNumber>) -> Result<(), IndexerError> {
        let mut next_block = self.resume_height(from).await?;
        let mut parent_hash = if next_block > 0 {
            self.store.block_hash(next_block - 1).await?
        } else {
            None
        };
        let mut backoff = self.new_backoff();
        let window_size = self.config.fetch_concurrency.max(1) as i64;

        info!(next_block, window_size, "starting indexer");

        while !self.stop_handle.is_stopped() {
            let mut window: FuturesOrdered<_> = (next_block..next_block + window_size)
                .map(|block_number| fetch_block(self.reader.as_ref(), block_number))
                .collect();
            let mut committed = 0;

            while let Some(fetched) = window.next().await {
                let fetched = match fetched {
                    Ok(Some(fetched)) => fetched,
                    Ok(None) => {
                        debug!(block_number = next_block, "block not available yet");
                        break;
                    }
                    Err(err) => {
                        warn!(block_number = next_block, %err, "failed to fetch block, retrying");
                        break;
                    }
                };

                if let Err(err) =
                    check_extends_chain(next_block, parent_hash.as_deref(), &fetched.block)
                {
                    error!(block_number = next_block, %err, "halting indexer");
                    return Err(err);
                }

                let batch = match decode_block(
                    &fetched.block,
                    &fetched.receipts,
                    &fetched.logs,
                    &self.config.known_contracts,
                ) {
                    Ok(batch) => batch,
                    Err(err) if err.is_inconsistent_fetch() => {
                        warn!(
                            block_number = next_block,
                            %err,
                            "receipts or logs do not match block, retrying"
                        );
                        break;
                    }
                    Err(err) => return Err(err.into()),
                };

                self.store.commit_block(&batch).await?;

                debug!(
                    block_number = next_block,
                    transactions = batch.transactions.len(),
                    addresses = batch.address_deltas.len(),
                    "committed block"
                );
                if next_block % 1000 == 0 {
                    info!(block_number = next_block, "indexed block");
                }

                parent_hash = Some(batch.block.hash);
                next_block += 1;
                committed += 1;

                if self.stop_handle.is_stopped() {
                    break;
                }
            }

            if committed > 0 {
                backoff.reset();
            } else if !self.stop_handle.is_stopped() {
                let wait = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                debug!(block_number = next_block, ?wait, "waiting before retrying");
                self.stop_handle.wait(wait).await;
            }
        }

        info!(next_block, "indexer stopped");

        Ok(())
    }
}
