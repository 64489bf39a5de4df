//! Derives the new chain's genesis file from a finalized snapshot.
//!
//! The genesis is geth-style JSON with two extra sections. `supply` records the total supply the
//! balances must add up to, `commitment` a Merkle root over the final allocation table so anyone
//! can prove their balance against it. Generation is deterministic, the genesis timestamp comes
//! from the config.
//!
//! System contracts from the config are deployed at genesis with their code and storage. They
//! keep whatever balance the allocation table gives them and add none of their own.

mod allocations;

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    fs,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    chain_reader::BlockNumber,
    merkle::{self, MerkleError, MerkleHash, MerkleProof, MerkleTree},
    snapshot::Snapshot,
    units::{Address, TokenAmount, TOKEN_DECIMALS},
};

pub use allocations::{
    calculate_allocations, export_allocations_csv, format_allocation, share_ppm, Allocation,
    AllocationError, AllocationResult, AllocationStatistics, Tier, TierCounts, TierThresholds,
    MAX_DECIMALS,
};

const CLIQUE_VANITY_BYTES: usize = 32;
const CLIQUE_SEAL_BYTES: usize = 65;
const DEFAULT_GAS_LIMIT: u64 = 30_000_000;
const DEFAULT_CLIQUE_PERIOD: u64 = 5;
const DEFAULT_CLIQUE_EPOCH: u64 = 30_000;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("genesis is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BaselineAllocation {
    pub address: Address,
    pub amount: TokenAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_clique_period() -> u64 {
    DEFAULT_CLIQUE_PERIOD
}

fn default_clique_epoch() -> u64 {
    DEFAULT_CLIQUE_EPOCH
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CliqueConfig {
    pub signers: Vec<Address>,
    #[serde(default = "default_clique_period")]
    pub period: u64,
    #[serde(default = "default_clique_epoch")]
    pub epoch: u64,
}

/// Code and storage placed at a fixed address in the genesis state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemContract {
    pub address: Address,
    /// 0x-prefixed runtime bytecode.
    pub code: String,
    /// 32-byte slot to 32-byte value, both 0x-prefixed hex.
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_decimals() -> u32 {
    TOKEN_DECIMALS
}

/// Supply policy and chain parameters, read from a JSON file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub network: String,
    pub total_supply: TokenAmount,
    #[serde(default)]
    pub max_allocation_per_address: Option<TokenAmount>,
    #[serde(default)]
    pub baseline_allocations: Vec<BaselineAllocation>,
    #[serde(default)]
    pub unallocated_recipient: Option<Address>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(default)]
    pub clique: Option<CliqueConfig>,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default)]
    pub tiers: TierThresholds,
    #[serde(default)]
    pub system_contracts: Vec<SystemContract>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CliqueParams {
    pub period: u64,
    pub epoch: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub homestead_block: u64,
    pub eip150_block: u64,
    pub eip155_block: u64,
    pub eip158_block: u64,
    pub byzantium_block: u64,
    pub constantinople_block: u64,
    pub petersburg_block: u64,
    pub istanbul_block: u64,
    pub berlin_block: u64,
    pub london_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clique: Option<CliqueParams>,
}

impl ChainConfig {
    fn all_forks_at_genesis(chain_id: u64, clique: Option<CliqueParams>) -> Self {
        Self {
            chain_id,
            homestead_block: 0,
            eip150_block: 0,
            eip155_block: 0,
            eip158_block: 0,
            byzantium_block: 0,
            constantinople_block: 0,
            petersburg_block: 0,
            istanbul_block: 0,
            berlin_block: 0,
            london_block: 0,
            clique,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct GenesisAccount {
    /// Hex quantity.
    pub balance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<String, String>,
}

impl GenesisAccount {
    pub fn with_balance(balance: impl Into<String>) -> Self {
        Self {
            balance: balance.into(),
            code: None,
            storage: BTreeMap::new(),
        }
    }
}

fn is_hex_bytes(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|digits| digits.len() % 2 == 0 && hex::decode(digits).is_ok())
}

/// A storage slot or value, at most 32 bytes of 0x-prefixed hex.
fn is_storage_word(value: &str) -> bool {
    value.strip_prefix("0x").is_some_and(|digits| {
        !digits.is_empty()
            && digits.len() <= 64
            && digits.chars().all(|digit| digit.is_ascii_hexdigit())
    })
}

/// Problems with an account's code and storage, each prefixed with the account's key.
fn contract_violations(
    key: &str,
    code: Option<&str>,
    storage: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut violations = vec![];

    if let Some(code) = code {
        if !is_hex_bytes(code) {
            violations.push(format!("invalid code for {key}"));
        }
    }

    for (slot, value) in storage {
        if !is_storage_word(slot) {
            violations.push(format!("invalid storage slot {slot} for {key}"));
        }
        if !is_storage_word(value) {
            violations.push(format!("invalid storage value {value} for {key}"));
        }
    }

    violations
}

/// The `alloc` map. Entries are kept as read, in order and with their keys unparsed, so
/// validation can report duplicate and malformed addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenesisAlloc(pub Vec<(String, GenesisAccount)>);

impl Serialize for GenesisAlloc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (address, account) in &self.0 {
            map.serialize_entry(address, account)?;
        }
        map.end()
    }
}

struct GenesisAllocVisitor;

impl<'de> Visitor<'de> for GenesisAllocVisitor {
    type Value = GenesisAlloc;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map from addresses to accounts")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(entry) = access.next_entry::<String, GenesisAccount>()? {
            entries.push(entry);
        }
        Ok(GenesisAlloc(entries))
    }
}

impl<'de> Deserialize<'de> for GenesisAlloc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(GenesisAllocVisitor)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisSupply {
    pub total_supply: TokenAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allocation_per_address: Option<TokenAmount>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisCommitment {
    /// Root over the final allocation table, sorted by address.
    pub merkle_root: MerkleHash,
    pub snapshot_id: String,
    pub snapshot_block: BlockNumber,
    pub snapshot_merkle_root: MerkleHash,
    pub allocation_count: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisBlock {
    pub config: ChainConfig,
    pub nonce: String,
    pub timestamp: String,
    pub extra_data: String,
    pub gas_limit: String,
    pub difficulty: String,
    pub mix_hash: String,
    pub coinbase: String,
    pub number: String,
    pub parent_hash: String,
    pub alloc: GenesisAlloc,
    pub supply: GenesisSupply,
    pub commitment: GenesisCommitment,
}

impl GenesisBlock {
    /// The alloc map parsed into a table sorted by address, zero balances left out. Every entry
    /// that does not parse is reported, addresses are compared case-insensitively.
    pub fn allocation_table(&self) -> Result<Vec<(Address, TokenAmount)>, Vec<String>> {
        let mut violations = vec![];
        let mut seen = HashSet::new();
        let mut table = Vec::with_capacity(self.alloc.0.len());

        for (key, account) in &self.alloc.0 {
            if !seen.insert(key.to_lowercase()) {
                violations.push(format!("duplicate address {key}"));
                continue;
            }

            let address = key.parse::<Address>();
            // Geth reads unprefixed balances as decimal, only hex quantities are accepted here.
            let balance = account
                .balance
                .strip_prefix("0x")
                .and_then(|_| TokenAmount::from_hex_quantity(&account.balance).ok());

            violations.extend(contract_violations(
                key,
                account.code.as_deref(),
                &account.storage,
            ));

            match (address, balance) {
                (Ok(_), Some(balance)) if balance.is_zero() => {}
                (Ok(address), Some(balance)) => table.push((address, balance)),
                (address, balance) => {
                    if address.is_err() {
                        violations.push(format!("invalid address {key}"));
                    }
                    if balance.is_none() {
                        violations.push(format!(
                            "invalid balance {} for {key}",
                            account.balance
                        ));
                    }
                }
            }
        }

        if violations.is_empty() {
            table.sort_by(|(a, _), (b, _)| a.cmp(b));
            Ok(table)
        } else {
            Err(violations)
        }
    }
}

fn hex_quantity(number: u64) -> String {
    format!("{number:#x}")
}

fn clique_extra_data(signers: &[Address]) -> String {
    let mut extra_data = format!("0x{}", "00".repeat(CLIQUE_VANITY_BYTES));
    for signer in signers {
        extra_data.push_str(&signer.as_str()[2..]);
    }
    extra_data.push_str(&"00".repeat(CLIQUE_SEAL_BYTES));
    extra_data
}

/// A generated genesis together with the allocation breakdown it was built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedGenesis {
    pub genesis: GenesisBlock,
    pub allocations: AllocationResult,
}

pub fn generate_genesis(
    snapshot: &Snapshot,
    config: &GenesisConfig,
) -> Result<GeneratedGenesis, GenesisError> {
    let allocations = calculate_allocations(snapshot, config)?;

    let tree = MerkleTree::build(
        allocations
            .allocations
            .iter()
            .map(|allocation| (allocation.address.clone(), allocation.amount)),
    )?;

    let mut accounts: BTreeMap<Address, GenesisAccount> = allocations
        .allocations
        .iter()
        .map(|allocation| {
            (
                allocation.address.clone(),
                GenesisAccount::with_balance(allocation.amount.to_hex_quantity()),
            )
        })
        .collect();

    let mut violations = vec![];
    let mut deployed = HashSet::new();
    for contract in &config.system_contracts {
        if !deployed.insert(&contract.address) {
            violations.push(format!("duplicate system contract {}", contract.address));
            continue;
        }
        violations.extend(contract_violations(
            contract.address.as_str(),
            Some(contract.code.as_str()),
            &contract.storage,
        ));

        let account = accounts
            .entry(contract.address.clone())
            .or_insert_with(|| GenesisAccount::with_balance(TokenAmount::ZERO.to_hex_quantity()));
        account.code = Some(contract.code.clone());
        account.storage = contract.storage.clone();
    }
    if !violations.is_empty() {
        return Err(GenesisError::Invalid(violations));
    }

    let alloc = GenesisAlloc(
        accounts
            .into_iter()
            .map(|(address, account)| (address.to_string(), account))
            .collect(),
    );

    let (chain_config, difficulty, extra_data) = match &config.clique {
        Some(clique) => (
            ChainConfig::all_forks_at_genesis(
                config.chain_id,
                Some(CliqueParams {
                    period: clique.period,
                    epoch: clique.epoch,
                }),
            ),
            "0x1".to_string(),
            clique_extra_data(&clique.signers),
        ),
        None => (
            ChainConfig::all_forks_at_genesis(config.chain_id, None),
            "0x400000".to_string(),
            format!("0x{}", "00".repeat(CLIQUE_VANITY_BYTES)),
        ),
    };

    let genesis = GenesisBlock {
        config: chain_config,
        nonce: "0x0000000000000000".to_string(),
        timestamp: hex_quantity(config.timestamp),
        extra_data,
        gas_limit: hex_quantity(config.gas_limit),
        difficulty,
        mix_hash: format!("0x{}", "00".repeat(32)),
        coinbase: format!("0x{}", "00".repeat(20)),
        number: "0x0".to_string(),
        parent_hash: format!("0x{}", "00".repeat(32)),
        alloc,
        supply: GenesisSupply {
            total_supply: config.total_supply,
            max_allocation_per_address: config.max_allocation_per_address,
        },
        commitment: GenesisCommitment {
            merkle_root: tree.root(),
            snapshot_id: snapshot.id.clone(),
            snapshot_block: snapshot.block_height,
            snapshot_merkle_root: snapshot.merkle_root,
            allocation_count: tree.len() as u64,
        },
    };

    info!(
        network = %config.network,
        chain_id = config.chain_id,
        allocations = tree.len(),
        system_contracts = config.system_contracts.len(),
        merkle_root = %tree.root(),
        "generated genesis"
    );

    Ok(GeneratedGenesis {
        genesis,
        allocations,
    })
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub id: String,
    pub block: BlockNumber,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub merkle_root: MerkleHash,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationMetadata {
    pub total: u64,
    pub total_amount: TokenAmount,
    pub airdrop_pool: TokenAmount,
    pub unallocated: TokenAmount,
    pub merkle_root: MerkleHash,
    pub tiers: TierCounts,
}

/// Provenance of a genesis file, written next to it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisMetadata {
    pub version: String,
    pub network: String,
    pub chain_id: u64,
    pub generated_at: DateTime<Utc>,
    pub snapshot: SnapshotMetadata,
    pub allocations: AllocationMetadata,
    pub system_contracts: Vec<Address>,
}

pub fn genesis_metadata(
    snapshot: &Snapshot,
    config: &GenesisConfig,
    generated: &GeneratedGenesis,
    generated_at: DateTime<Utc>,
) -> GenesisMetadata {
    let allocations = &generated.allocations;

    GenesisMetadata {
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: config.network.clone(),
        chain_id: config.chain_id,
        generated_at,
        snapshot: SnapshotMetadata {
            id: snapshot.id.clone(),
            block: snapshot.block_height,
            created_at: snapshot.created_at,
            finalized_at: snapshot.finalized_at,
            merkle_root: snapshot.merkle_root,
        },
        allocations: AllocationMetadata {
            total: allocations.statistics.count,
            total_amount: allocations.total_allocated,
            airdrop_pool: allocations.airdrop_pool,
            unallocated: allocations.unallocated,
            merkle_root: generated.genesis.commitment.merkle_root,
            tiers: allocations.statistics.tier_counts.clone(),
        },
        system_contracts: config
            .system_contracts
            .iter()
            .map(|contract| contract.address.clone())
            .collect(),
    }
}

/// Checks everything a node or a claimant relies on and reports every violation found.
pub fn validate_genesis(genesis: &GenesisBlock) -> Result<(), GenesisError> {
    let mut violations = vec![];

    if genesis.config.chain_id == 0 {
        violations.push("chain id must be greater than 0".to_string());
    }

    if genesis
        .gas_limit
        .strip_prefix("0x")
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
        .is_none()
    {
        violations.push(format!("invalid gas limit {}", genesis.gas_limit));
    }

    if genesis.config.clique.is_some() {
        let min_length = 2 + 2 * (CLIQUE_VANITY_BYTES + CLIQUE_SEAL_BYTES);
        match genesis.extra_data.strip_prefix("0x").map(hex::decode) {
            Some(Ok(_)) if genesis.extra_data.len() < min_length => {
                violations.push(format!(
                    "clique extra data is {} characters, at least {min_length} are needed",
                    genesis.extra_data.len()
                ));
            }
            Some(Ok(bytes))
                if (bytes.len() - CLIQUE_VANITY_BYTES - CLIQUE_SEAL_BYTES) % 20 != 0 =>
            {
                violations.push("clique extra data does not hold whole signer addresses".to_string());
            }
            Some(Ok(_)) => {}
            _ => violations.push("clique extra data is not hex".to_string()),
        }
    }

    match genesis.allocation_table() {
        Err(table_violations) => violations.extend(table_violations),
        Ok(table) => {
            let amounts: Vec<TokenAmount> = table.iter().map(|(_, amount)| *amount).collect();
            match TokenAmount::checked_sum(&amounts) {
                None => violations.push("balances overflow".to_string()),
                Some(total) if total != genesis.supply.total_supply => {
                    violations.push(format!(
                        "balances sum to {total}, recorded total supply is {}",
                        genesis.supply.total_supply
                    ));
                }
                Some(_) => {}
            }

            if genesis.commitment.allocation_count != table.len() as u64 {
                violations.push(format!(
                    "allocation count is {}, alloc holds {} entries",
                    genesis.commitment.allocation_count,
                    table.len()
                ));
            }

            let root = MerkleTree::build(table)?.root();
            if root != genesis.commitment.merkle_root {
                violations.push(format!(
                    "recomputed merkle root {root} does not match recorded root {}",
                    genesis.commitment.merkle_root
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        debug!(count = violations.len(), "genesis failed validation");
        Err(GenesisError::Invalid(violations))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AllocationProof {
    pub amount: TokenAmount,
    pub proof: MerkleProof,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisProofs {
    pub merkle_root: MerkleHash,
    pub proofs: BTreeMap<Address, AllocationProof>,
}

/// Every address's proof against the genesis commitment root.
pub fn genesis_proofs(genesis: &GenesisBlock) -> Result<GenesisProofs, GenesisError> {
    let table = genesis.allocation_table().map_err(GenesisError::Invalid)?;
    let tree = MerkleTree::build(table)?;

    let proofs = tree
        .leaves()
        .iter()
        .enumerate()
        .filter_map(|(index, (address, amount))| {
            tree.proof(index).map(|proof| {
                (
                    address.clone(),
                    AllocationProof {
                        amount: *amount,
                        proof,
                    },
                )
            })
        })
        .collect();

    Ok(GenesisProofs {
        merkle_root: tree.root(),
        proofs,
    })
}

/// True when the proofs file holds a proof for `address` that shows `amount` under the
/// genesis's own commitment root.
pub fn verify_genesis_proof(
    genesis: &GenesisBlock,
    proofs: &GenesisProofs,
    address: &Address,
    amount: TokenAmount,
) -> bool {
    proofs.proofs.get(address).is_some_and(|entry| {
        merkle::verify_proof(&genesis.commitment.merkle_root, address, amount, &entry.proof)
    })
}

/// Writes the genesis as pretty JSON. An invalid genesis is never written.
pub fn export_genesis_json(genesis: &GenesisBlock, path: &Path) -> Result<(), GenesisError> {
    validate_genesis(genesis)?;
    let json = serde_json::to_string_pretty(genesis)?;
    fs::write(path, json + "\n")?;
    info!(path = %path.display(), "wrote genesis");
    Ok(())
}

pub fn load_genesis_json(path: &Path) -> Result<GenesisBlock, GenesisError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Writes the allocation table of `genesis` as CSV. Scores come from the snapshot the genesis
/// was built from, when one is at hand.
pub fn export_genesis_allocations_csv(
    genesis: &GenesisBlock,
    snapshot: Option<&Snapshot>,
    path: &Path,
) -> Result<(), GenesisError> {
    let table = genesis.allocation_table().map_err(GenesisError::Invalid)?;
    let scores: BTreeMap<&Address, u64> = snapshot
        .map(|snapshot| {
            snapshot
                .leaves
                .iter()
                .map(|leaf| (&leaf.address, leaf.score))
                .collect()
        })
        .unwrap_or_default();

    let rows: Vec<(Address, TokenAmount, u64)> = table
        .iter()
        .map(|(address, amount)| {
            let score = scores.get(address).copied().unwrap_or(0);
            (address.clone(), *amount, score)
        })
        .collect();

    export_allocations_csv(&rows, genesis.supply.total_supply, path)?;

    Ok(())
}

#[cfg(test)]
pub mod tests {
    use chrono::{TimeZone, Utc};

    use crate::{
        merkle::EMPTY_ROOT,
        snapshot::{SnapshotLeaf, SnapshotStatus},
    };

    use super::*;

    pub fn address(last_byte: u8) -> Address {
        format!("0x{:040x}", last_byte).parse().unwrap()
    }

    /// Finalized snapshot with leaves `(address byte, score, amount)`, bytes ascending.
    pub fn finalized_snapshot(leaves: &[(u8, u64, u128)]) -> Snapshot {
        let leaves: Vec<SnapshotLeaf> = leaves
            .iter()
            .enumerate()
            .map(|(index, (byte, score, amount))| SnapshotLeaf {
                address: address(*byte),
                amount: TokenAmount(*amount),
                score: *score,
                index: index as u64,
            })
            .collect();
        let tree = MerkleTree::build(
            leaves
                .iter()
                .map(|leaf| (leaf.address.clone(), leaf.amount)),
        )
        .unwrap();

        Snapshot {
            id: "snapshot-1".to_string(),
            block_height: 1_000,
            merkle_root: tree.root(),
            total_allocated: TokenAmount(leaves.iter().map(|leaf| leaf.amount.0).sum()),
            eligible_count: leaves.len() as u64,
            total_addresses: leaves.len() as u64 + 2,
            eligibility_threshold: 10,
            leaves,
            status: SnapshotStatus::Finalized,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            finalized_at: Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap()),
        }
    }

    pub fn test_config(total_supply: u128) -> GenesisConfig {
        GenesisConfig {
            chain_id: 4242,
            network: "testnet-genesis".to_string(),
            total_supply: TokenAmount(total_supply),
            max_allocation_per_address: None,
            baseline_allocations: vec![],
            unallocated_recipient: None,
            gas_limit: DEFAULT_GAS_LIMIT,
            timestamp: 1_700_000_000,
            clique: None,
            decimals: 18,
            tiers: TierThresholds::default(),
            system_contracts: vec![],
        }
    }

    fn generated() -> GenesisBlock {
        let snapshot = finalized_snapshot(&[(1, 10, 100), (2, 20, 200), (3, 30, 300)]);
        let config = GenesisConfig {
            baseline_allocations: vec![BaselineAllocation {
                address: address(0xab),
                amount: TokenAmount(100_000),
                label: Some("foundation".to_string()),
            }],
            clique: Some(CliqueConfig {
                signers: vec![address(7)],
                period: 5,
                epoch: 30_000,
            }),
            ..test_config(1_000_000)
        };

        generate_genesis(&snapshot, &config).unwrap().genesis
    }

    fn violations(genesis: &GenesisBlock) -> Vec<String> {
        match validate_genesis(genesis) {
            Err(GenesisError::Invalid(violations)) => violations,
            other => panic!("expected validation to fail, got {other:?}"),
        }
    }

    #[test]
    fn generate_genesis_test() {
        let genesis = generated();

        let balances: Vec<(&str, &str)> = genesis
            .alloc
            .0
            .iter()
            .map(|(address, account)| (address.as_str(), account.balance.as_str()))
            .collect();
        assert_eq!(
            balances,
            vec![
                ("0x0000000000000000000000000000000000000001", "0x249f0"),
                ("0x0000000000000000000000000000000000000002", "0x493e0"),
                ("0x0000000000000000000000000000000000000003", "0x6ddd0"),
                ("0x00000000000000000000000000000000000000ab", "0x186a0"),
            ]
        );
        assert_eq!(genesis.config.chain_id, 4242);
        assert_eq!(genesis.config.london_block, 0);
        assert_eq!(
            genesis.config.clique,
            Some(CliqueParams {
                period: 5,
                epoch: 30_000
            })
        );
        assert_eq!(genesis.difficulty, "0x1");
        assert_eq!(genesis.gas_limit, "0x1c9c380");
        assert_eq!(genesis.timestamp, "0x6553f100");
        assert_eq!(
            genesis.extra_data,
            format!(
                "0x{}{}{}",
                "00".repeat(32),
                &address(7).as_str()[2..],
                "00".repeat(65)
            )
        );
        assert_eq!(genesis.commitment.allocation_count, 4);
        assert_eq!(genesis.commitment.snapshot_id, "snapshot-1");
        assert_eq!(genesis.commitment.snapshot_block, 1_000);
        assert_ne!(genesis.commitment.merkle_root, EMPTY_ROOT);
        assert_eq!(genesis.supply.total_supply, TokenAmount(1_000_000));

        validate_genesis(&genesis).unwrap();
    }

    #[test]
    fn generate_is_deterministic_test() {
        assert_eq!(generated(), generated());
    }

    #[test]
    fn generate_rejects_draft_test() {
        let mut snapshot = finalized_snapshot(&[(1, 10, 100)]);
        snapshot.status = SnapshotStatus::Draft;
        snapshot.finalized_at = None;

        let result = generate_genesis(&snapshot, &test_config(1_000));

        assert!(matches!(
            result,
            Err(GenesisError::Allocation(AllocationError::SnapshotNotFinalized(_)))
        ));
    }

    #[test]
    fn tampered_balance_test() {
        let mut genesis = generated();
        genesis.alloc.0[0].1.balance = "0x1".to_string();

        let violations = violations(&genesis);

        assert!(violations.iter().any(|v| v.starts_with("balances sum to")));
        assert!(violations.iter().any(|v| v.starts_with("recomputed merkle root")));
    }

    #[test]
    fn duplicate_address_test() {
        let mut genesis = generated();
        genesis.alloc.0.push((
            "0x00000000000000000000000000000000000000AB".to_string(),
            GenesisAccount::with_balance("0x0"),
        ));

        let violations = violations(&genesis);

        assert_eq!(
            violations,
            vec!["duplicate address 0x00000000000000000000000000000000000000AB".to_string()]
        );
    }

    #[test]
    fn malformed_entries_test() {
        let mut genesis = generated();
        genesis.alloc.0.push((
            "0x1234".to_string(),
            GenesisAccount::with_balance("0x0"),
        ));
        genesis.alloc.0.push((
            address(0xcd).to_string(),
            GenesisAccount::with_balance("1000"),
        ));
        genesis.config.chain_id = 0;
        genesis.extra_data = "0x00".to_string();

        let violations = violations(&genesis);

        assert!(violations.contains(&"invalid address 0x1234".to_string()));
        assert!(violations.contains(&format!(
            "invalid balance 1000 for {}",
            address(0xcd)
        )));
        assert!(violations.contains(&"chain id must be greater than 0".to_string()));
        assert!(violations
            .iter()
            .any(|v| v.starts_with("clique extra data is 4 characters")));
    }

    #[test]
    fn root_mismatch_test() {
        let mut genesis = generated();
        genesis.commitment.merkle_root = EMPTY_ROOT;

        let violations = violations(&genesis);

        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("recomputed merkle root"));
    }

    #[test]
    fn export_json_round_trip_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        let genesis = generated();

        export_genesis_json(&genesis, &path).unwrap();
        let loaded = load_genesis_json(&path).unwrap();

        assert_eq!(loaded, genesis);
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["alloc"][address(0xab).as_str()]["balance"], "0x186a0");
        assert_eq!(json["supply"]["totalSupply"], "1000000");
        assert_eq!(json["config"]["eip155Block"], 0);
    }

    #[test]
    fn export_refuses_invalid_genesis_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        let mut genesis = generated();
        genesis.supply.total_supply = TokenAmount(1);

        let result = export_genesis_json(&genesis, &path);

        assert!(matches!(result, Err(GenesisError::Invalid(_))));
        assert!(!path.exists());
    }

    #[test]
    fn genesis_proofs_test() {
        let genesis = generated();
        let proofs = genesis_proofs(&genesis).unwrap();

        assert_eq!(proofs.merkle_root, genesis.commitment.merkle_root);
        assert_eq!(proofs.proofs.len(), 4);
        for (address, entry) in &proofs.proofs {
            assert!(verify_genesis_proof(&genesis, &proofs, address, entry.amount));
        }

        assert!(!verify_genesis_proof(
            &genesis,
            &proofs,
            &address(1),
            TokenAmount(150_001)
        ));
        assert!(!verify_genesis_proof(
            &genesis,
            &proofs,
            &address(9),
            TokenAmount(0)
        ));
    }

    #[test]
    fn export_allocations_csv_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allocations.csv");
        let snapshot = finalized_snapshot(&[(1, 10, 100), (2, 20, 200), (3, 30, 300)]);
        let genesis = generated();

        export_genesis_allocations_csv(&genesis, Some(&snapshot), &path).unwrap();

        let csv = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "address,amount,score,share_ppm",
                "0x0000000000000000000000000000000000000001,150000,10,150000",
                "0x0000000000000000000000000000000000000002,300000,20,300000",
                "0x0000000000000000000000000000000000000003,450000,30,450000",
                "0x00000000000000000000000000000000000000ab,100000,0,100000",
            ]
        );
    }

    #[test]
    fn config_defaults_test() {
        let config: GenesisConfig = serde_json::from_str(
            r#"{
                "chainId": 7,
                "network": "devnet",
                "totalSupply": "1000",
                "timestamp": 0,
                "clique": { "signers": ["0x0000000000000000000000000000000000000007"] }
            }"#,
        )
        .unwrap();

        assert_eq!(config.gas_limit, 30_000_000);
        assert_eq!(config.decimals, 18);
        assert_eq!(config.max_allocation_per_address, None);
        let clique = config.clique.unwrap();
        assert_eq!(clique.period, 5);
        assert_eq!(clique.epoch, 30_000);
    }

    #[test]
    fn empty_snapshot_zero_supply_test() {
        let snapshot = finalized_snapshot(&[]);

        let generated = generate_genesis(&snapshot, &test_config(0)).unwrap();

        assert!(generated.genesis.alloc.0.is_empty());
        assert_eq!(generated.genesis.commitment.merkle_root, EMPTY_ROOT);
        assert_eq!(generated.genesis.commitment.allocation_count, 0);
        assert_eq!(generated.allocations.statistics, AllocationStatistics::default());
        validate_genesis(&generated.genesis).unwrap();
        assert!(genesis_proofs(&generated.genesis).unwrap().proofs.is_empty());
    }

    #[test]
    fn empty_snapshot_baseline_only_test() {
        let snapshot = finalized_snapshot(&[]);
        let config = GenesisConfig {
            baseline_allocations: vec![
                BaselineAllocation {
                    address: address(0xf1),
                    amount: TokenAmount(300),
                    label: Some("team".to_string()),
                },
                BaselineAllocation {
                    address: address(0xf0),
                    amount: TokenAmount(700),
                    label: Some("treasury".to_string()),
                },
            ],
            ..test_config(1_000)
        };

        let generated = generate_genesis(&snapshot, &config).unwrap();

        assert_eq!(generated.allocations.airdrop_pool, TokenAmount::ZERO);
        assert_eq!(generated.allocations.unallocated, TokenAmount::ZERO);
        assert_eq!(
            generated.genesis.allocation_table().unwrap(),
            vec![
                (address(0xf0), TokenAmount(700)),
                (address(0xf1), TokenAmount(300)),
            ]
        );
        assert_eq!(generated.genesis.commitment.allocation_count, 2);
        validate_genesis(&generated.genesis).unwrap();
    }

    fn contracts_config() -> GenesisConfig {
        GenesisConfig {
            system_contracts: vec![
                SystemContract {
                    address: address(2),
                    code: "0x6080".to_string(),
                    storage: BTreeMap::new(),
                    label: None,
                },
                SystemContract {
                    address: address(0x42),
                    code: "0x60016000".to_string(),
                    storage: BTreeMap::from([("0x0".to_string(), "0x01".to_string())]),
                    label: Some("registry".to_string()),
                },
            ],
            ..test_config(600)
        }
    }

    #[test]
    fn system_contracts_test() {
        let snapshot = finalized_snapshot(&[(1, 10, 100), (2, 20, 200), (3, 30, 300)]);

        let genesis = generate_genesis(&snapshot, &contracts_config())
            .unwrap()
            .genesis;

        let keys: Vec<String> = genesis.alloc.0.iter().map(|(key, _)| key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                address(1).to_string(),
                address(2).to_string(),
                address(3).to_string(),
                address(0x42).to_string(),
            ]
        );
        let funded = &genesis.alloc.0[1].1;
        assert_eq!(funded.balance, "0xc8");
        assert_eq!(funded.code.as_deref(), Some("0x6080"));
        let registry = &genesis.alloc.0[3].1;
        assert_eq!(registry.balance, "0x0");
        assert_eq!(registry.storage.get("0x0").map(String::as_str), Some("0x01"));

        // Contracts add no supply and stay out of the commitment.
        assert_eq!(genesis.commitment.allocation_count, 3);
        validate_genesis(&genesis).unwrap();

        let json = serde_json::to_value(&genesis).unwrap();
        assert_eq!(json["alloc"][address(0x42).as_str()]["code"], "0x60016000");
        assert_eq!(json["alloc"][address(0x42).as_str()]["storage"]["0x0"], "0x01");
        assert!(json["alloc"][address(1).as_str()].get("code").is_none());
        let loaded: GenesisBlock = serde_json::from_value(json).unwrap();
        assert_eq!(loaded, genesis);
    }

    #[test]
    fn invalid_system_contract_test() {
        let snapshot = finalized_snapshot(&[(1, 10, 100)]);
        let mut config = contracts_config();
        config.system_contracts[0].code = "6080".to_string();
        config.system_contracts.push(config.system_contracts[1].clone());

        let result = generate_genesis(&snapshot, &config);

        match result {
            Err(GenesisError::Invalid(violations)) => assert_eq!(
                violations,
                vec![
                    format!("invalid code for {}", address(2)),
                    format!("duplicate system contract {}", address(0x42)),
                ]
            ),
            other => panic!("expected an invalid config, got {other:?}"),
        }
    }

    #[test]
    fn tampered_storage_test() {
        let snapshot = finalized_snapshot(&[(1, 10, 100), (2, 20, 200), (3, 30, 300)]);
        let mut genesis = generate_genesis(&snapshot, &contracts_config())
            .unwrap()
            .genesis;
        genesis.alloc.0[3]
            .1
            .storage
            .insert("0xzz".to_string(), "0x".to_string());

        let violations = violations(&genesis);

        assert_eq!(
            violations,
            vec![
                format!("invalid storage slot 0xzz for {}", address(0x42)),
                format!("invalid storage value 0x for {}", address(0x42)),
            ]
        );
    }

    #[test]
    fn genesis_metadata_test() {
        let snapshot = finalized_snapshot(&[(1, 100, 100), (2, 600, 200), (3, 6_000, 300)]);
        let config = contracts_config();
        let generated = generate_genesis(&snapshot, &config).unwrap();
        let generated_at = Utc.timestamp_opt(1_700_000_500, 0).unwrap();

        let metadata = genesis_metadata(&snapshot, &config, &generated, generated_at);

        assert_eq!(metadata.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(metadata.network, "testnet-genesis");
        assert_eq!(metadata.chain_id, 4242);
        assert_eq!(metadata.snapshot.id, "snapshot-1");
        assert_eq!(metadata.snapshot.block, 1_000);
        assert_eq!(metadata.snapshot.merkle_root, snapshot.merkle_root);
        assert_eq!(metadata.allocations.total, 3);
        assert_eq!(metadata.allocations.total_amount, TokenAmount(600));
        assert_eq!(
            metadata.allocations.merkle_root,
            generated.genesis.commitment.merkle_root
        );
        assert_eq!(
            metadata.allocations.tiers,
            TierCounts {
                bronze: 1,
                silver: 1,
                gold: 0,
                platinum: 1,
            }
        );
        assert_eq!(metadata.system_contracts, vec![address(2), address(0x42)]);

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["generatedAt"], "2023-11-14T22:21:40Z");
        assert_eq!(json["allocations"]["totalAmount"], "600");
    }
}
