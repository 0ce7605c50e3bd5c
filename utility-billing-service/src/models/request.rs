//! Inputs and outcomes of ledger operations.

use super::{BillingStatus, ExtendedStatement};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A sub-meter reading submitted with a new statement.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubMeterInput {
    #[validate(length(min = 1, max = 64, message = "Sub meter label must be 1-64 characters"))]
    pub label: String,
    #[validate(range(min = 0, message = "Sub meter reading cannot be negative"))]
    pub reading: i64,
}

/// Input for recording a new billing period.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateStatementRequest {
    pub date: NaiveDate,
    #[validate(range(min = 1, message = "Total usage must be greater than zero"))]
    pub total_usage: i64,
    pub balance: Decimal,
    pub status: BillingStatus,
    #[serde(default)]
    #[validate(nested)]
    pub sub_meters: Vec<SubMeterInput>,
}

/// A batch of already-parsed statements, recorded oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImportStatementsRequest {
    #[validate(
        length(min = 1, max = 500, message = "Import must contain 1-500 statements"),
        nested
    )]
    pub statements: Vec<CreateStatementRequest>,
}

/// A sub-meter in an update. Items without an id are new sub meters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubMeterUpdateInput {
    #[serde(default)]
    pub sub_meter_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64, message = "Sub meter label must be 1-64 characters"))]
    pub label: String,
    #[validate(range(min = 0, message = "Sub meter reading cannot be negative"))]
    pub reading: i64,
}

/// Partial update of a statement. Absent fields keep their stored value;
/// an absent `sub_meters` leaves the sub-meter set untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateStatementRequest {
    /// Taken from the request path when called over HTTP.
    #[serde(default)]
    pub statement_id: Uuid,
    /// When set, the update is rejected unless the stored version matches.
    #[serde(default)]
    pub expected_version: Option<i32>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    #[validate(range(min = 1, message = "Total usage must be greater than zero"))]
    pub total_usage: Option<i64>,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub status: Option<BillingStatus>,
    #[serde(default)]
    #[validate(nested)]
    pub sub_meters: Option<Vec<SubMeterUpdateInput>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
}

/// A page of statements, most recent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementPage {
    pub statements: Vec<ExtendedStatement>,
    pub next_page_token: Option<Uuid>,
}

/// Result of one item of a batch import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImportOutcome {
    Created {
        index: usize,
        date: NaiveDate,
        statement_id: Uuid,
    },
    Rejected {
        index: usize,
        date: NaiveDate,
        reason: String,
    },
}

impl ImportOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Created { index, .. } | Self::Rejected { index, .. } => *index,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}
