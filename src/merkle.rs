//! Binary Merkle tree over `(address, amount)` allocations.
//!
//! - leaf: `SHA256(0x00 || address (20 bytes) || amount (32 bytes BE) || index (8 bytes BE))`
//! - node: `SHA256(0x01 || left || right)`, the left child holds the lower index
//! - odd node count at any level: the last node is paired with itself
//! - empty tree: 32 zero bytes
//!
//! Leaves are ordered by address and a leaf's index is its position in that order, so the same
//! set of allocations always produces the same root no matter how it was collected.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::units::{Address, TokenAmount};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(into = "String")]
#[serde(try_from = "String")]
pub struct MerkleHash(pub [u8; 32]);

pub const EMPTY_ROOT: MerkleHash = MerkleHash([0u8; 32]);

impl Display for MerkleHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, Error)]
#[error("invalid merkle hash {0}, expected 0x followed by 64 hex characters")]
pub struct InvalidMerkleHash(String);

impl FromStr for MerkleHash {
    type Err = InvalidMerkleHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| InvalidMerkleHash(s.to_string()))?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| InvalidMerkleHash(s.to_string()))?;
        Ok(MerkleHash(bytes))
    }
}

impl TryFrom<String> for MerkleHash {
    type Error = InvalidMerkleHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MerkleHash> for String {
    fn from(hash: MerkleHash) -> Self {
        hash.to_string()
    }
}

fn finalize(hasher: Sha256) -> MerkleHash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    MerkleHash(out)
}

pub fn leaf_hash(address: &Address, amount: TokenAmount, index: u64) -> MerkleHash {
    let mut amount_word = [0u8; 32];
    amount_word[16..].copy_from_slice(&amount.0.to_be_bytes());

    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(address.to_bytes());
    hasher.update(amount_word);
    hasher.update(index.to_be_bytes());
    finalize(hasher)
}

pub fn node_hash(left: &MerkleHash, right: &MerkleHash) -> MerkleHash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.0);
    hasher.update(right.0);
    finalize(hasher)
}

/// Sibling hashes from the leaf up. Bit `n` of `index` says whether the running hash is the
/// right child at level `n`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MerkleProof {
    pub index: u64,
    pub siblings: Vec<MerkleHash>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("address {0} appears more than once in the allocation set")]
    DuplicateAddress(Address),
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    leaves: Vec<(Address, TokenAmount)>,
    // levels[0] holds the leaf hashes, the last level holds the root.
    levels: Vec<Vec<MerkleHash>>,
}

impl MerkleTree {
    pub fn build(
        allocations: impl IntoIterator<Item = (Address, TokenAmount)>,
    ) -> Result<Self, MerkleError> {
        let mut leaves: Vec<(Address, TokenAmount)> = allocations.into_iter().collect();
        leaves.sort_by(|(a, _), (b, _)| a.cmp(b));

        if let Some(pair) = leaves.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(MerkleError::DuplicateAddress(pair[0].0.clone()));
        }

        let leaf_hashes: Vec<MerkleHash> = leaves
            .iter()
            .enumerate()
            .map(|(index, (address, amount))| leaf_hash(address, *amount, index as u64))
            .collect();

        let mut levels = vec![leaf_hashes];
        while let Some(current) = levels.last().filter(|level| level.len() > 1) {
            let parents = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [last] => node_hash(last, last),
                    _ => unreachable!("chunks of two hold one or two nodes"),
                })
                .collect();
            levels.push(parents);
        }

        Ok(Self { leaves, levels })
    }

    pub fn root(&self) -> MerkleHash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(EMPTY_ROOT)
    }

    pub fn leaves(&self) -> &[(Address, TokenAmount)] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.leaves
            .binary_search_by(|(leaf_address, _)| leaf_address.cmp(address))
            .ok()
    }

    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaves.len() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = level.get(position ^ 1).unwrap_or(&level[position]);
            siblings.push(*sibling);
            position /= 2;
        }

        Some(MerkleProof {
            index: index as u64,
            siblings,
        })
    }
}

/// True when walking `proof` from the leaf for `(address, amount)` ends at `root`.
pub fn verify_proof(
    root: &MerkleHash,
    address: &Address,
    amount: TokenAmount,
    proof: &MerkleProof,
) -> bool {
    if proof.siblings.len() >= 64 {
        return false;
    }

    let mut hash = leaf_hash(address, amount, proof.index);
    let mut position = proof.index;
    for sibling in &proof.siblings {
        hash = if position & 1 == 0 {
            node_hash(&hash, sibling)
        } else {
            node_hash(sibling, &hash)
        };
        position >>= 1;
    }

    // Index bits beyond the tree height would let one leaf verify under several indices.
    position == 0 && hash == *root
}
