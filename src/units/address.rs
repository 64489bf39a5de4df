use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address: {0}, expected 0x followed by 40 hex characters")]
pub struct InvalidAddress(pub String);

/// An account address, always stored lowercase so that ordering and equality are canonical.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(into = "String")]
#[serde(try_from = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        // Checked on construction.
        hex::decode_to_slice(&self.0[2..], &mut bytes)
            .expect("expect address to hold 40 validated hex characters");
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Address(format!("0x{}", hex::encode(bytes)))
    }

    /// Reads the address packed in the low 20 bytes of a 32 byte ABI word or log topic.
    pub fn from_word(word: &[u8]) -> Option<Self> {
        if word.len() != 32 || word[..12].iter().any(|byte| *byte != 0) {
            return None;
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Some(Address::from_bytes(&bytes))
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| InvalidAddress(s.to_string()))?;

        if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidAddress(s.to_string()));
        }

        Ok(Address(format!("0x{}", digits.to_lowercase())))
    }
}

impl TryFrom<String> for Address {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(Address(address): Address) -> Self {
        address
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lowercases_test() {
        let address: Address = "0xABCDEF0000000000000000000000000000000001".parse().unwrap();
        assert_eq!(
            address.as_str(),
            "0xabcdef0000000000000000000000000000000001"
        );
    }

    #[test]
    fn parse_rejects_malformed_test() {
        assert!("abcdef0000000000000000000000000000000001"
            .parse::<Address>()
            .is_err());
        assert!("0xabc".parse::<Address>().is_err());
        assert!("0xzzcdef0000000000000000000000000000000001"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn from_word_test() {
        let mut word = [0u8; 32];
        word[31] = 0x01;
        word[12] = 0xab;
        let address = Address::from_word(&word).unwrap();
        assert_eq!(
            address.as_str(),
            "0xab00000000000000000000000000000000000001"
        );

        word[0] = 1;
        assert_eq!(Address::from_word(&word), None);
    }

    #[test]
    fn bytes_round_trip_test() {
        let address: Address = "0x00000000000000000000000000000000000000ff".parse().unwrap();
        assert_eq!(Address::from_bytes(&address.to_bytes()), address);
    }
}
