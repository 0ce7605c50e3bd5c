//! Derived return metrics over a billing history.

use crate::ledger::round_money;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of an account's billing history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetrics {
    /// Balance of the most recent statement.
    pub current: Decimal,
    /// All payments, main and sub.
    pub invested: Decimal,
    /// Sub-meter payments only.
    pub total_returns: Decimal,
    /// `total_returns / invested` as a percentage.
    pub net_returns: Decimal,
    /// Sub-meter payments of the most recent period.
    pub one_day_returns: Decimal,
    pub average_daily_return: Decimal,
    pub average_monthly_return: Decimal,
    /// Previous period's total payment minus the latest period's.
    pub period_payment_change: Decimal,
    pub period_payment_change_pct: Decimal,
}

impl SummaryMetrics {
    /// Derived ratios and averages rounded to cents for display.
    pub fn rounded(&self) -> Self {
        Self {
            net_returns: round_money(self.net_returns),
            average_daily_return: round_money(self.average_daily_return),
            average_monthly_return: round_money(self.average_monthly_return),
            period_payment_change_pct: round_money(self.period_payment_change_pct),
            ..self.clone()
        }
    }
}

/// Optional date window over a history, inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl HistoryFilter {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Read query over stored statements, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementQuery {
    pub filter: HistoryFilter,
    /// `None` returns every matching statement.
    pub limit: Option<i64>,
    /// Cursor: return statements ordered after this one.
    pub after: Option<Uuid>,
}
