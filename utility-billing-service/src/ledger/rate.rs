//! Per-unit rate and money rounding.

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places kept for money and rates.
pub const MONEY_DP: u32 = 2;

/// Largest amount a `NUMERIC(14,2)` money column holds.
pub const MAX_MONEY: Decimal = Decimal::from_parts(276_447_231, 23_283, 0, false, MONEY_DP);

/// Round to cents, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// `balance / total_usage` rounded to cents.
///
/// Returns `None` for zero usage. Callers reject non-positive usage before
/// asking for a rate.
pub fn calculate_rate(balance: Decimal, total_usage: i64) -> Option<Decimal> {
    balance
        .checked_div(Decimal::from(total_usage))
        .map(round_money)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn rounds_down_below_midpoint() {
        assert_eq!(calculate_rate(d("500.75"), 1000), Some(d("0.50")));
    }

    #[test]
    fn rounds_midpoint_away_from_zero() {
        assert_eq!(calculate_rate(d("1.25"), 10), Some(d("0.13")));
        assert_eq!(calculate_rate(d("100"), 3), Some(d("33.33")));
    }

    #[test]
    fn exact_rate_is_unchanged() {
        assert_eq!(calculate_rate(d("200"), 1000), Some(d("0.20")));
    }

    #[test]
    fn max_money_fills_a_numeric_14_2_column() {
        assert_eq!(MAX_MONEY, d("999999999999.99"));
    }

    #[test]
    fn zero_usage_has_no_rate() {
        assert_eq!(calculate_rate(d("42.00"), 0), None);
    }

    #[test]
    fn rate_matches_rounded_quotient_across_inputs() {
        for (balance, usage) in [("0.01", 7), ("99.99", 13), ("1234.56", 789), ("5", 2)] {
            let balance = d(balance);
            let expected = (balance / Decimal::from(usage))
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            assert_eq!(calculate_rate(balance, usage), Some(expected));
        }
    }
}
