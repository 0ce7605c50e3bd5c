//! Return metrics over a billing history.

use crate::error::BillingError;
use crate::models::{ExtendedStatement, SummaryMetrics};
use rust_decimal::Decimal;

const DAYS_PER_MONTH: i64 = 30;

fn out_of_range() -> BillingError {
    BillingError::validation("Billing history totals are out of range")
}

fn checked_sum<I>(values: I) -> Result<Decimal, BillingError>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .ok_or_else(out_of_range)
}

fn checked_total(statement: &ExtendedStatement) -> Result<Decimal, BillingError> {
    checked_sum(
        std::iter::once(statement.main_payment_amount())
            .chain(statement.sub_meters.iter().map(|s| s.payment_amount())),
    )
}

fn checked_returns(statement: &ExtendedStatement) -> Result<Decimal, BillingError> {
    checked_sum(statement.sub_meters.iter().map(|s| s.payment_amount()))
}

/// `part / whole * 100`, or zero when `whole` is not positive.
fn percent_of(part: Decimal, whole: Decimal) -> Result<Decimal, BillingError> {
    if whole <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    part.checked_div(whole)
        .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
        .ok_or_else(out_of_range)
}

/// Summarize a history ordered most recent first.
///
/// Values are exact; [`SummaryMetrics::rounded`] gives the presented form.
/// An empty history yields all-zero metrics.
pub fn summarize(history: &[ExtendedStatement]) -> Result<SummaryMetrics, BillingError> {
    let (Some(latest), Some(earliest)) = (history.first(), history.last()) else {
        return Ok(SummaryMetrics::default());
    };

    let invested = checked_sum(
        history
            .iter()
            .map(checked_total)
            .collect::<Result<Vec<_>, _>>()?,
    )?;
    let total_returns = checked_sum(
        history
            .iter()
            .map(checked_returns)
            .collect::<Result<Vec<_>, _>>()?,
    )?;

    let total_days = (latest.statement.period_date - earliest.statement.period_date)
        .num_days()
        .max(1);
    let total_days = Decimal::from(total_days);
    let months = total_days / Decimal::from(DAYS_PER_MONTH);

    let (period_payment_change, period_payment_change_pct) = match history.get(1) {
        Some(previous) => {
            let prev_total = checked_total(previous)?;
            let change = prev_total
                .checked_sub(checked_total(latest)?)
                .ok_or_else(out_of_range)?;
            (change, percent_of(change, prev_total)?)
        }
        None => (Decimal::ZERO, Decimal::ZERO),
    };

    Ok(SummaryMetrics {
        current: latest.statement.balance,
        invested,
        total_returns,
        net_returns: percent_of(total_returns, invested)?,
        one_day_returns: checked_returns(latest)?,
        average_daily_return: total_returns
            .checked_div(total_days)
            .ok_or_else(out_of_range)?,
        average_monthly_return: total_returns
            .checked_div(months)
            .ok_or_else(out_of_range)?,
        period_payment_change,
        period_payment_change_pct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingStatement, BillingStatus, Payment, SubMeter, SubMeterWithPayment};
    use chrono::{NaiveDate, Utc};
    use std::str::FromStr;
    use uuid::Uuid;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn payment(amount: &str, date: NaiveDate) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            amount: d(amount),
            payment_date: date,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn entry(date: &str, balance: &str, main: &str, subs: &[&str]) -> ExtendedStatement {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        let main_payment = payment(main, date);
        let statement_id = Uuid::new_v4();
        ExtendedStatement {
            statement: BillingStatement {
                statement_id,
                owner_id: Uuid::nil(),
                period_date: date,
                total_usage: 1000,
                balance: d(balance),
                status: BillingStatus::Paid,
                pay_per_unit: d("0.20"),
                main_payment_id: main_payment.payment_id,
                version: 1,
                created_utc: Utc::now(),
                updated_utc: Utc::now(),
            },
            main_payment: Some(main_payment),
            sub_meters: subs
                .iter()
                .enumerate()
                .map(|(i, amount)| {
                    let p = payment(amount, date);
                    SubMeterWithPayment {
                        sub_meter: SubMeter {
                            sub_meter_id: Uuid::new_v4(),
                            statement_id,
                            label: format!("Meter {}", i),
                            reading: 100,
                            previous_reading: Some(0),
                            incremental_usage: 100,
                            payment_id: p.payment_id,
                            created_utc: Utc::now(),
                            updated_utc: Utc::now(),
                        },
                        payment: Some(p),
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn empty_history_is_all_zero() {
        assert_eq!(summarize(&[]).unwrap(), SummaryMetrics::default());
    }

    #[test]
    fn two_periods() {
        let history = vec![
            entry("2024-02-15", "600.00", "550.00", &["30.00", "20.00"]),
            entry("2024-01-16", "80.00", "70.00", &["10.00"]),
        ];
        let m = summarize(&history).unwrap().rounded();

        assert_eq!(m.current, d("600.00"));
        assert_eq!(m.one_day_returns, d("50.00"));
        assert_eq!(m.invested, d("680.00"));
        assert_eq!(m.total_returns, d("60.00"));
        assert_eq!(m.period_payment_change, d("-520.00"));
        assert_eq!(m.period_payment_change_pct, d("-650.00"));
        assert_eq!(m.net_returns, d("8.82"));
        assert_eq!(m.average_daily_return, d("2.00"));
        assert_eq!(m.average_monthly_return, d("60.00"));
    }

    #[test]
    fn single_period_uses_one_day_span() {
        let history = vec![entry("2024-03-01", "100.00", "90.00", &["10.00"])];
        let m = summarize(&history).unwrap().rounded();

        assert_eq!(m.average_daily_return, d("10.00"));
        assert_eq!(m.average_monthly_return, d("300.00"));
        assert_eq!(m.period_payment_change, Decimal::ZERO);
        assert_eq!(m.period_payment_change_pct, Decimal::ZERO);
    }

    #[test]
    fn zero_payments_do_not_divide() {
        let history = vec![
            entry("2024-02-01", "0.00", "0.00", &[]),
            entry("2024-01-01", "0.00", "0.00", &[]),
        ];
        let m = summarize(&history).unwrap().rounded();
        assert_eq!(m.net_returns, Decimal::ZERO);
        assert_eq!(m.period_payment_change_pct, Decimal::ZERO);
    }

    #[test]
    fn ratios_are_exact_until_rounded() {
        let history = vec![
            entry("2024-02-15", "600.00", "550.00", &["30.00", "20.00"]),
            entry("2024-01-16", "80.00", "70.00", &["10.00"]),
        ];
        let m = summarize(&history).unwrap();

        assert_eq!(m.net_returns, d("60") / d("680") * Decimal::ONE_HUNDRED);
        assert_ne!(m.net_returns, d("8.82"));
        assert_eq!(m.rounded().net_returns, d("8.82"));
    }

    #[test]
    fn totals_past_decimal_range_are_rejected() {
        let max = Decimal::MAX.to_string();
        let history = vec![
            entry("2024-02-15", "1.00", &max, &[]),
            entry("2024-01-16", "1.00", &max, &[]),
        ];

        let err = summarize(&history).unwrap_err();
        assert_eq!(err.to_string(), "Billing history totals are out of range");
    }
}
