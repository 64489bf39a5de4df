//! Exact proportional splitting of an amount over integer weights.
//!
//! Every share is floored, then the units lost to flooring go one at a time to the entries with
//! the largest residual fraction, ties to the lowest address. The shares always sum to the total.
//! When every weight is zero the total is split equally.

use thiserror::Error;

use crate::units::{Address, TokenAmount};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("sum of weights does not fit in u64")]
    WeightOverflow,
    #[error("sum of shares does not fit in u128")]
    AmountOverflow,
}

/// Sum of a set of shares, an error rather than a fallback when it overflows.
pub fn checked_total<'a>(
    shares: impl IntoIterator<Item = &'a TokenAmount>,
) -> Result<TokenAmount, DistributionError> {
    TokenAmount::checked_sum(shares).ok_or(DistributionError::AmountOverflow)
}

pub fn split_proportionally(
    total: TokenAmount,
    weights: &[(&Address, u64)],
) -> Result<Vec<TokenAmount>, DistributionError> {
    if weights.is_empty() {
        return Ok(vec![]);
    }

    let all_zero = weights.iter().all(|(_, weight)| *weight == 0);
    let weight_of = |weight: u64| if all_zero { 1 } else { weight };

    let weight_sum = weights
        .iter()
        .try_fold(0u64, |sum, (_, weight)| sum.checked_add(weight_of(*weight)))
        .ok_or(DistributionError::WeightOverflow)?;
    let weight_sum = u128::from(weight_sum);

    // total * w / W without overflowing: total = q * W + r, so the share is w * q + (w * r) / W.
    // w * r < W * W, which fits in u128 as W fits in u64.
    let quotient = total.0 / weight_sum;
    let remainder = total.0 % weight_sum;

    let mut shares = Vec::with_capacity(weights.len());
    let mut residuals = Vec::with_capacity(weights.len());
    for (index, (_, weight)) in weights.iter().enumerate() {
        let weight = u128::from(weight_of(*weight));
        let scaled_remainder = weight * remainder;
        shares.push(weight * quotient + scaled_remainder / weight_sum);
        residuals.push((scaled_remainder % weight_sum, index));
    }

    let floored: u128 = shares.iter().sum();
    let mut undistributed = total.0 - floored;

    residuals.sort_by(|(residual_a, index_a), (residual_b, index_b)| {
        residual_b
            .cmp(residual_a)
            .then_with(|| weights[*index_a].0.cmp(weights[*index_b].0))
    });

    for (_, index) in residuals {
        if undistributed == 0 {
            break;
        }
        shares[index] += 1;
        undistributed -= 1;
    }

    Ok(shares.into_iter().map(TokenAmount).collect())
}
