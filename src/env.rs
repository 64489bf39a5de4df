//! Fns to read variables from the environment more conveniently and collect the settings the
//! indexer and snapshot binaries run with.

use std::env;

use lazy_static::lazy_static;
use tracing::debug;

const SECRET_LOG_BLACKLIST: [&str; 2] = ["DATABASE_URL", "RPC_URL"];

lazy_static! {
    pub static ref ENV_CONFIG: EnvConfig = get_env_config();
}

fn obfuscate_if_secret(blacklist: &[&str], key: &str, value: &str) -> String {
    if blacklist.contains(&key) {
        let mut last_four = value.to_string();
        last_four.drain(0..value.len().saturating_sub(4));
        format!("****{last_four}")
    } else {
        value.to_string()
    }
}

/// Get an environment variable, encoding found or missing as Option, and panic otherwise.
pub fn get_env_var(key: &str) -> Option<String> {
    let var = match env::var(key) {
        Err(env::VarError::NotPresent) => None,
        Err(e) => panic!("{e}"),
        Ok(var) => Some(var),
    };

    if let Some(ref existing_var) = var {
        let output = obfuscate_if_secret(&SECRET_LOG_BLACKLIST, key, existing_var);
        debug!("env var {key}: {output}");
    } else {
        debug!("env var {key} requested but not found")
    };

    var
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    get_env_var(key).map(|var| match var.to_lowercase().as_str() {
        "true" => true,
        "false" => false,
        "t" => true,
        "f" => false,
        "1" => true,
        "0" => false,
        str => panic!("invalid bool value {str} for {key}"),
    })
}

/// Parses a numeric env var, panicking with the key in the message when it is not a number.
pub fn get_env_number<N: std::str::FromStr>(key: &str) -> Option<N> {
    get_env_var(key).map(|var| {
        var.parse::<N>()
            .unwrap_or_else(|_| panic!("invalid number {var} for {key}"))
    })
}

pub struct EnvConfig {
    pub db_url: Option<String>,
    pub eligibility_threshold: u64,
    pub fetch_concurrency: usize,
    pub governance_contract: Option<String>,
    pub log_json: bool,
    pub log_perf: bool,
    pub max_backoff_secs: u64,
    pub rpc_url: Option<String>,
    pub snapshot_pool: u128,
    pub staking_contract: Option<String>,
    pub start_block: i64,
}

pub const DEFAULT_ELIGIBILITY_THRESHOLD: u64 = 100;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;
// 50B tokens with 18 decimals.
pub const DEFAULT_SNAPSHOT_POOL: u128 = 50_000_000_000 * 1_000_000_000_000_000_000;

pub fn get_env_config() -> EnvConfig {
    EnvConfig {
        db_url: get_env_var("DATABASE_URL"),
        eligibility_threshold: get_env_number("ELIGIBILITY_THRESHOLD")
            .unwrap_or(DEFAULT_ELIGIBILITY_THRESHOLD),
        fetch_concurrency: get_env_number("INDEXER_FETCH_CONCURRENCY")
            .unwrap_or(DEFAULT_FETCH_CONCURRENCY),
        governance_contract: get_env_var("GOVERNANCE_CONTRACT"),
        log_json: get_env_bool("LOG_JSON").unwrap_or(false),
        log_perf: get_env_bool("LOG_PERF").unwrap_or(false),
        max_backoff_secs: get_env_number("INDEXER_MAX_BACKOFF_SECS")
            .unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
        rpc_url: get_env_var("RPC_URL"),
        snapshot_pool: get_env_number("SNAPSHOT_POOL").unwrap_or(DEFAULT_SNAPSHOT_POOL),
        staking_contract: get_env_var("STAKING_CONTRACT"),
        start_block: get_env_number("INDEXER_START_BLOCK").unwrap_or(0),
    }
}
