//! Market and agent inputs for the scorer.

use flip_core::SCALE;

/// Success rate assumed for an agent with no history (98%).
pub const DEFAULT_AGENT_SUCCESS_RATE: u128 = 980_000;

/// Price volatility as the coefficient of variation, scaled by [`SCALE`].
///
/// Uses the population variance and an integer square root. Returns zero with
/// fewer than two samples or a zero mean.
pub fn price_volatility(prices: &[u128]) -> u128 {
    if prices.len() < 2 {
        return 0;
    }
    let n = prices.len() as u128;
    let sum = prices.iter().fold(0u128, |acc, p| acc.saturating_add(*p));
    let mean = sum / n;
    if mean == 0 {
        return 0;
    }

    let variance = prices
        .iter()
        .map(|p| {
            let diff = p.abs_diff(mean);
            diff.saturating_mul(diff)
        })
        .fold(0u128, |acc, sq| acc.saturating_add(sq))
        / n;

    isqrt(variance).saturating_mul(SCALE) / mean
}

/// Fraction of completed settlements, scaled by [`SCALE`].
pub fn agent_success_rate(completed: u64, total: u64) -> u128 {
    if total == 0 {
        return DEFAULT_AGENT_SUCCESS_RATE;
    }
    completed as u128 * SCALE / total as u128
}

/// Floor square root.
fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = x / 2 + (x & 1);
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}
