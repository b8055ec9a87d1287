//! Time-weighted points formula.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

/// Wei per whole ether
static WEI_PER_ETH: Lazy<U256> = Lazy::new(|| U256::from(10u64).pow(U256::from(18u64)));

/// Length of one accrual interval in minutes
const INTERVAL_MINUTES: i64 = 10;

/// Computes the points awarded for an event.
///
/// `points = floor(amount_wei / 1e18) * floor(elapsed_minutes / 10) * multiplier`
///
/// Events younger than one interval, amounts below one ether, amounts that
/// don't fit an `i64`, and products that overflow or turn negative all yield 0.
pub(crate) fn compute(
    multiplier: i64,
    amount_wei: U256,
    event_timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let elapsed_minutes = (now - event_timestamp).num_minutes().max(0);
    let intervals = elapsed_minutes / INTERVAL_MINUTES;

    let eth_amount = amount_wei / *WEI_PER_ETH;
    if eth_amount > U256::from(i64::MAX as u64) {
        return 0;
    }
    let Ok(eth_amount) = u64::try_from(eth_amount) else {
        return 0;
    };

    (eth_amount as i64)
        .checked_mul(intervals)
        .and_then(|p| p.checked_mul(multiplier))
        .filter(|p| *p >= 0)
        .unwrap_or(0)
}
