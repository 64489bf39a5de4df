use std::{
    fmt::Display,
    num::ParseIntError,
    ops::{Add, Sub},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::WEI_PER_TOKEN;

/// A balance or volume in the chain's smallest unit. Serializes as a decimal string so JSON
/// consumers never lose precision.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(into = "String")]
#[serde(try_from = "String")]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub fn from_tokens(tokens: u128) -> Self {
        Self(tokens * WEI_PER_TOKEN)
    }

    pub fn checked_add(self, TokenAmount(rhs): TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(rhs).map(TokenAmount)
    }

    pub fn checked_sub(self, TokenAmount(rhs): TokenAmount) -> Option<TokenAmount> {
        self.0.checked_sub(rhs).map(TokenAmount)
    }

    pub fn saturating_sub(self, TokenAmount(rhs): TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(rhs))
    }

    /// Sums amounts, returning None on overflow.
    pub fn checked_sum<'a>(amounts: impl IntoIterator<Item = &'a TokenAmount>) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(TokenAmount::ZERO, |acc, amount| acc.checked_add(*amount))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Geth style hex quantity, `0x0` for zero, no leading zeroes otherwise.
    pub fn to_hex_quantity(&self) -> String {
        format!("{:#x}", self.0)
    }

    pub fn from_hex_quantity(quantity: &str) -> Result<Self, ParseIntError> {
        let digits = quantity
            .strip_prefix("0x")
            .or_else(|| quantity.strip_prefix("0X"))
            .unwrap_or(quantity);
        u128::from_str_radix(digits, 16).map(TokenAmount)
    }

    /// Human readable amount: whole tokens with thousands separators and up to four fractional
    /// digits, e.g. `1,234.5000`.
    pub fn format(&self, decimals: u32) -> String {
        // Past 38 decimals the divisor exceeds u128, every amount is a pure fraction.
        let (whole, fraction) = match 10u128.checked_pow(decimals) {
            Some(divisor) => (self.0 / divisor, self.0 % divisor),
            None => (0, self.0),
        };

        let digits = whole.to_string();
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, digit) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(digit);
        }

        if fraction == 0 {
            return grouped;
        }

        let fraction_str = format!("{:0>width$}", fraction, width = decimals as usize);
        let shown = &fraction_str[..fraction_str.len().min(4)];
        format!("{grouped}.{shown}")
    }
}

impl Add<TokenAmount> for TokenAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.checked_add(rhs)
            .expect("caused overflow in token amount addition")
    }
}

impl Sub<TokenAmount> for TokenAmount {
    type Output = Self;

    fn sub(self, rhs: TokenAmount) -> Self::Output {
        self.checked_sub(rhs)
            .expect("caused underflow in token amount subtraction")
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let TokenAmount(amount) = self;
        write!(f, "{amount}")
    }
}

impl From<TokenAmount> for String {
    fn from(TokenAmount(amount): TokenAmount) -> Self {
        amount.to_string()
    }
}

impl FromStr for TokenAmount {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u128>().map(TokenAmount)
    }
}

impl TryFrom<String> for TokenAmount {
    type Error = ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse::<u128>().map(TokenAmount)
    }
}

impl From<u128> for TokenAmount {
    fn from(amount: u128) -> Self {
        TokenAmount(amount)
    }
}
