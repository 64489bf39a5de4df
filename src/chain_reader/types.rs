use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    json_codecs::{from_amount_hex_str, from_i64_hex_str, from_u64_hex_str, from_unix_timestamp_hex_str},
    units::{Address, TokenAmount},
};

pub type BlockNumber = i64;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    pub hash: String,
    #[serde(deserialize_with = "from_u64_hex_str")]
    pub transaction_index: u64,
    pub from: Address,
    // Contract creations have no recipient.
    pub to: Option<Address>,
    #[serde(deserialize_with = "from_amount_hex_str")]
    pub value: TokenAmount,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainBlock {
    pub hash: String,
    #[serde(deserialize_with = "from_i64_hex_str")]
    pub number: BlockNumber,
    pub parent_hash: String,
    #[serde(deserialize_with = "from_unix_timestamp_hex_str")]
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    // Pre-byzantium receipts carry a state root instead of a status.
    pub status: Option<String>,
    #[serde(default)]
    pub block_hash: Option<String>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref() != Some("0x0")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<String>,
    pub data: String,
    pub transaction_hash: String,
    #[serde(deserialize_with = "from_u64_hex_str")]
    pub log_index: u64,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub removed: bool,
}
