//! Whole-statement consistency checks, run before any write.

use super::allocator::{invalid_reading, Allocation};
use super::rate::MAX_MONEY;
use crate::error::BillingError;
use rust_decimal::Decimal;

/// The statement figures allocations are checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementTotals {
    pub total_usage: i64,
    pub balance: Decimal,
}

/// Reject statement figures the rate cannot be derived from.
pub fn validate_totals(total_usage: i64, balance: Decimal) -> Result<(), BillingError> {
    if total_usage <= 0 {
        return Err(BillingError::validation(
            "Total usage must be greater than zero",
        ));
    }
    if balance < Decimal::ZERO {
        return Err(BillingError::validation("Balance cannot be negative"));
    }
    if balance > MAX_MONEY {
        return Err(BillingError::validation(
            "Balance exceeds the maximum amount",
        ));
    }
    Ok(())
}

/// Balance left once every sub-meter payment is taken out.
pub fn main_payment_amount(balance: Decimal, allocations: &[Allocation]) -> Decimal {
    balance - allocations.iter().map(|a| a.payment_amount).sum::<Decimal>()
}

/// Check an allocation set against its statement.
///
/// Order: per-item usage is non-negative, summed usage fits the total, and
/// the main payment left over is non-negative.
pub fn validate(totals: StatementTotals, allocations: &[Allocation]) -> Result<(), BillingError> {
    if let Some(bad) = allocations.iter().find(|a| a.incremental_usage < 0) {
        return Err(invalid_reading(&bad.label));
    }

    let used = allocations
        .iter()
        .try_fold(0i64, |sum, a| sum.checked_add(a.incremental_usage));
    if used.map_or(true, |used| used > totals.total_usage) {
        return Err(BillingError::validation(
            "Sub meter usage exceeds total usage",
        ));
    }

    if main_payment_amount(totals.balance, allocations) < Decimal::ZERO {
        return Err(BillingError::validation("Main payment cannot be negative"));
    }

    Ok(())
}
