//! Read access to the testnet through a node's JSON-RPC API.

mod types;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{stream::FuturesOrdered, TryStreamExt};
use mockall::automock;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::trace;

pub use types::*;

#[derive(Debug, Error)]
pub enum ChainReaderError {
    #[error("failed to reach node: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("node returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("failed to decode node response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("node has no receipt for transaction {0}")]
    MissingReceipt(String),
}

#[automock]
#[async_trait]
pub trait ChainReader {
    /// None when the node does not have a block at this height yet.
    async fn get_block_by_number(
        &self,
        block_number: BlockNumber,
    ) -> Result<Option<ChainBlock>, ChainReaderError>;
    /// Receipts in the same order as the block's transactions.
    async fn get_transaction_receipts(
        &self,
        block: &ChainBlock,
    ) -> Result<Vec<TransactionReceipt>, ChainReaderError>;
    /// Logs of exactly this block, selected by hash so they cannot come from a competing block
    /// at the same height.
    async fn get_logs(&self, block: &ChainBlock) -> Result<Vec<ChainLog>, ChainReaderError>;
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

pub struct ChainReaderHttp {
    client: reqwest::Client,
    next_id: AtomicU64,
    url: String,
}

impl ChainReaderHttp {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            url: url.into(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainReaderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(id, method, "sending rpc request");

        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<RpcResponse>()
            .await?;

        match response.error {
            Some(RpcError { code, message }) => Err(ChainReaderError::Rpc { code, message }),
            None => Ok(serde_json::from_value(response.result)?),
        }
    }

    async fn get_transaction_receipt(
        &self,
        transaction_hash: &str,
    ) -> Result<TransactionReceipt, ChainReaderError> {
        self.call::<Option<TransactionReceipt>>(
            "eth_getTransactionReceipt",
            json!([transaction_hash]),
        )
        .await?
        .ok_or_else(|| ChainReaderError::MissingReceipt(transaction_hash.to_string()))
    }
}

#[async_trait]
impl ChainReader for ChainReaderHttp {
    async fn get_block_by_number(
        &self,
        block_number: BlockNumber,
    ) -> Result<Option<ChainBlock>, ChainReaderError> {
        self.call(
            "eth_getBlockByNumber",
            json!([format!("{:#x}", block_number), true]),
        )
        .await
    }

    async fn get_transaction_receipts(
        &self,
        block: &ChainBlock,
    ) -> Result<Vec<TransactionReceipt>, ChainReaderError> {
        block
            .transactions
            .iter()
            .map(|transaction| self.get_transaction_receipt(&transaction.hash))
            .collect::<FuturesOrdered<_>>()
            .try_collect()
            .await
    }

    async fn get_logs(&self, block: &ChainBlock) -> Result<Vec<ChainLog>, ChainReaderError> {
        self.call("eth_getLogs", json!([{ "blockHash": block.hash }])).await
    }
}
