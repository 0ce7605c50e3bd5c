//! Billing statement, payment and sub-meter records.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment state of a billing statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingStatus {
    Paid,
    Pending,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl BillingStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Pending => "pending",
            Self::NotApplicable => "n/a",
        }
    }

    /// Parse the database representation.
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "paid" => Some(Self::Paid),
            "pending" => Some(Self::Pending),
            "n/a" => Some(Self::NotApplicable),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A monetary allocation, owned by one statement or one sub meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// One billing period of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingStatement {
    pub statement_id: Uuid,
    pub owner_id: Uuid,
    pub period_date: NaiveDate,
    pub total_usage: i64,
    pub balance: Decimal,
    pub status: BillingStatus,
    pub pay_per_unit: Decimal,
    pub main_payment_id: Uuid,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// A sub-metered usage channel inside one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubMeter {
    pub sub_meter_id: Uuid,
    pub statement_id: Uuid,
    pub label: String,
    pub reading: i64,
    /// Reading of the same label in the prior period. `None` when this row
    /// is the label's first occurrence and only records a baseline.
    pub previous_reading: Option<i64>,
    pub incremental_usage: i64,
    pub payment_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubMeterWithPayment {
    #[serde(flatten)]
    pub sub_meter: SubMeter,
    pub payment: Option<Payment>,
}

impl SubMeterWithPayment {
    pub fn payment_amount(&self) -> Decimal {
        self.payment
            .as_ref()
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }
}

/// A statement together with its main payment and sub meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedStatement {
    #[serde(flatten)]
    pub statement: BillingStatement,
    pub main_payment: Option<Payment>,
    pub sub_meters: Vec<SubMeterWithPayment>,
}

impl ExtendedStatement {
    /// Assemble from loose rows. Payments are looked up by id; sub meters
    /// are ordered by creation time, then label.
    pub fn from_parts<F>(
        statement: BillingStatement,
        sub_meters: Vec<SubMeter>,
        mut payment_for: F,
    ) -> Self
    where
        F: FnMut(Uuid) -> Option<Payment>,
    {
        let main_payment = payment_for(statement.main_payment_id);
        let sub_meters = sub_meters
            .into_iter()
            .map(|sub_meter| SubMeterWithPayment {
                payment: payment_for(sub_meter.payment_id),
                sub_meter,
            })
            .collect();

        let mut extended = Self {
            statement,
            main_payment,
            sub_meters,
        };
        extended.sort_sub_meters();
        extended
    }

    /// Order sub meters by creation time, then label.
    pub fn sort_sub_meters(&mut self) {
        self.sub_meters.sort_by(|a, b| {
            a.sub_meter
                .created_utc
                .cmp(&b.sub_meter.created_utc)
                .then_with(|| a.sub_meter.label.cmp(&b.sub_meter.label))
        });
    }

    pub fn main_payment_amount(&self) -> Decimal {
        self.main_payment
            .as_ref()
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }

    /// Sum of every sub-meter payment in this period.
    pub fn sub_payment_total(&self) -> Decimal {
        self.sub_meters.iter().map(|s| s.payment_amount()).sum()
    }

    /// Main payment plus all sub payments.
    pub fn total_payment(&self) -> Decimal {
        self.main_payment_amount() + self.sub_payment_total()
    }

    /// Every payment row this statement owns.
    pub fn owned_payment_ids(&self) -> Vec<Uuid> {
        std::iter::once(self.statement.main_payment_id)
            .chain(self.sub_meters.iter().map(|s| s.sub_meter.payment_id))
            .collect()
    }
}

/// Input for inserting a payment row.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: Decimal,
    pub payment_date: NaiveDate,
}

/// Input for inserting a statement row.
#[derive(Debug, Clone)]
pub struct NewStatement {
    pub owner_id: Uuid,
    pub period_date: NaiveDate,
    pub total_usage: i64,
    pub balance: Decimal,
    pub status: BillingStatus,
    pub pay_per_unit: Decimal,
    pub main_payment_id: Uuid,
}

/// Input for inserting a sub-meter row.
#[derive(Debug, Clone)]
pub struct NewSubMeter {
    pub statement_id: Uuid,
    pub label: String,
    pub reading: i64,
    pub previous_reading: Option<i64>,
    pub incremental_usage: i64,
    pub payment_id: Uuid,
}

/// Changed statement columns. `None` leaves the column as stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementChanges {
    pub period_date: Option<NaiveDate>,
    pub total_usage: Option<i64>,
    pub balance: Option<Decimal>,
    pub status: Option<BillingStatus>,
    pub pay_per_unit: Option<Decimal>,
}

impl StatementChanges {
    pub fn is_empty(&self) -> bool {
        self.period_date.is_none()
            && self.total_usage.is_none()
            && self.balance.is_none()
            && self.status.is_none()
            && self.pay_per_unit.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubMeterChanges {
    pub label: Option<String>,
    pub reading: Option<i64>,
    pub previous_reading: Option<i64>,
    pub incremental_usage: Option<i64>,
}

impl SubMeterChanges {
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.reading.is_none()
            && self.previous_reading.is_none()
            && self.incremental_usage.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentChanges {
    pub amount: Option<Decimal>,
    pub payment_date: Option<NaiveDate>,
}

impl PaymentChanges {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.payment_date.is_none()
    }
}
