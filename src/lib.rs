pub mod activity;
pub mod chain_reader;
pub mod db;
pub mod distribution;
pub mod env;
pub mod genesis;
pub mod indexer;
mod json_codecs;
pub mod log;
pub mod merkle;
pub mod snapshot;
pub mod store;
pub mod units;
