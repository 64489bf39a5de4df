//! The canonical store. Each pipeline stage talks to it through its own trait, `IndexStore`,
//! `ActivityStore` and `SnapshotStore`, all implemented by `PostgresStore` and by `MemoryStore`.

mod memory;

use std::str::FromStr;

use sqlx::{postgres::PgRow, PgPool, Row};
use thiserror::Error;

use crate::{
    chain_reader::BlockNumber,
    indexer::CounterOverflow,
    units::{Address, TokenAmount},
};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to decode stored {column}: {message}")]
    Decode { column: String, message: String },
    #[error("expected block {expected} to be committed next, got {got}")]
    OutOfOrder {
        expected: BlockNumber,
        got: BlockNumber,
    },
    #[error(transparent)]
    Overflow(#[from] CounterOverflow),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub struct PostgresStore {
    db_pool: PgPool,
}

impl PostgresStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub fn db_pool(&self) -> &PgPool {
        &self.db_pool
    }
}

pub(crate) fn decode_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = row.try_get(column)?;
    text.parse::<T>().map_err(|error| StoreError::Decode {
        column: column.to_string(),
        message: error.to_string(),
    })
}

pub(crate) fn decode_address(row: &PgRow, column: &str) -> Result<Address, StoreError> {
    decode_column(row, column)
}

/// NUMERIC columns are selected as `::TEXT` and parsed, u128 has no native postgres type.
pub(crate) fn decode_amount(row: &PgRow, column: &str) -> Result<TokenAmount, StoreError> {
    decode_column(row, column)
}

pub(crate) fn decode_count(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let count: i64 = row.try_get(column)?;
    u64::try_from(count).map_err(|error| StoreError::Decode {
        column: column.to_string(),
        message: error.to_string(),
    })
}
