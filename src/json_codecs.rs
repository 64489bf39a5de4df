//! Serde helpers for the JSON-RPC hex quantity encoding, `"0x1b4"`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer};

use crate::units::TokenAmount;

fn strip_hex_prefix<'a, E: de::Error>(s: &'a str) -> Result<&'a str, E> {
    s.strip_prefix("0x").ok_or_else(|| {
        de::Error::invalid_value(de::Unexpected::Str(s), &"a 0x prefixed hex quantity")
    })
}

pub fn from_u64_hex_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let digits = strip_hex_prefix(&s)?;
    u64::from_str_radix(digits, 16).map_err(|error| {
        de::Error::invalid_value(
            de::Unexpected::Str(&format!("unexpected value: {}, error: {}", s, error)),
            &"a hex quantity e.g. \"0x1b4\", which fits within u64",
        )
    })
}

pub fn from_i64_hex_str<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = from_u64_hex_str(deserializer)?;
    i64::try_from(number).map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Unsigned(number),
            &"a hex quantity which fits within i64",
        )
    })
}

pub fn from_amount_hex_str<'de, D>(deserializer: D) -> Result<TokenAmount, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    strip_hex_prefix::<D::Error>(&s)?;
    TokenAmount::from_hex_quantity(&s).map_err(|error| {
        de::Error::invalid_value(
            de::Unexpected::Str(&format!("unexpected value: {}, error: {}", s, error)),
            &"a hex quantity e.g. \"0xde0b6b3a7640000\", which fits within u128",
        )
    })
}

pub fn from_unix_timestamp_hex_str<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let timestamp = from_i64_hex_str(deserializer)?;
    Utc.timestamp_opt(timestamp, 0).single().ok_or_else(|| {
        de::Error::invalid_value(
            de::Unexpected::Signed(timestamp),
            &"a unix timestamp in seconds",
        )
    })
}
