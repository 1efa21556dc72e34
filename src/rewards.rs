//! Reward accrual engine
//!
//! Pure, deterministic functions over integer base units. Every intermediate
//! product is computed in `u128` with checked multiplication; a balance of
//! 10^18 units at 10_000 bps over a century stays below 10^32, far inside the
//! `u128` range, and anything larger surfaces as
//! [`LedgerError::ArithmeticOverflow`] instead of wrapping.
//!
//! Fractions are floored. Short elapsed times or small balances accrue zero.

use chrono::{DateTime, Utc};

use crate::amount::Amount;
use crate::clock::elapsed_secs;
use crate::error::{LedgerError, Result};

/// 365 days; no leap-year adjustment
pub const SECONDS_PER_YEAR: u128 = 31_536_000;

/// 100% in basis points
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Result of one accrual step. Persist `amount` and `accrued_at` together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    pub amount: Amount,
    pub accrued_at: DateTime<Utc>,
    pub elapsed_secs: u64,
}

/// `balance * rate_bps * elapsed / (10000 * SECONDS_PER_YEAR)`
pub fn accrued_amount(balance: Amount, rate_bps: u32, elapsed_secs: u64) -> Result<Amount> {
    let numerator = balance
        .units()
        .checked_mul(rate_bps as u128)
        .and_then(|v| v.checked_mul(elapsed_secs as u128))
        .ok_or(LedgerError::ArithmeticOverflow("reward accrual"))?;

    Ok(Amount::new(numerator / (BPS_DENOMINATOR * SECONDS_PER_YEAR)))
}

/// Accrue from `last_accrual` up to `now`
pub fn accrue(
    balance: Amount,
    rate_bps: u32,
    last_accrual: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Accrual> {
    let elapsed = elapsed_secs(last_accrual, now);
    let amount = accrued_amount(balance, rate_bps, elapsed)?;
    // Never move the accrual marker backwards on clock skew
    let accrued_at = if now > last_accrual { now } else { last_accrual };

    Ok(Accrual {
        amount,
        accrued_at,
        elapsed_secs: elapsed,
    })
}

/// Fraction of a year elapsed, in basis points (floored)
pub fn time_factor_bps(secs_since_epoch_start: u64) -> u128 {
    (secs_since_epoch_start as u128).saturating_mul(BPS_DENOMINATOR) / SECONDS_PER_YEAR
}

/// Portion of a withdrawal that may be released after waiting
/// `secs_since_epoch_start` into the current epoch.
///
/// `amount * apr_bps * time_factor_bps / 10^8`, capped at `amount`.
pub fn eligible_withdrawal(amount: Amount, apr_bps: u32, secs_since_epoch_start: u64) -> Result<Amount> {
    let time_factor = time_factor_bps(secs_since_epoch_start);
    let numerator = amount
        .units()
        .checked_mul(apr_bps as u128)
        .and_then(|v| v.checked_mul(time_factor))
        .ok_or(LedgerError::ArithmeticOverflow("partial fulfillment"))?;

    let eligible = numerator / (BPS_DENOMINATOR * BPS_DENOMINATOR);
    Ok(Amount::new(eligible.min(amount.units())))
}

/// Minimum collateral for a borrow of `amount` at `ratio_bps`
pub fn required_collateral(amount: Amount, ratio_bps: u32) -> Result<Amount> {
    amount
        .units()
        .checked_mul(ratio_bps as u128)
        .map(|v| Amount::new(v / BPS_DENOMINATOR))
        .ok_or(LedgerError::ArithmeticOverflow("collateral requirement"))
}
