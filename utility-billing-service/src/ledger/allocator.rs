//! Sub-meter usage and payment allocation.
//!
//! A sub meter is billed for the usage since its baseline, the reading of
//! the same label in the prior period. A label seen for the first time only
//! records its baseline and is billed nothing.

use super::rate::{round_money, MAX_MONEY};
use crate::error::BillingError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A labelled cumulative reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterReading {
    pub label: String,
    pub reading: i64,
}

impl MeterReading {
    pub fn new(label: impl Into<String>, reading: i64) -> Self {
        Self {
            label: label.into(),
            reading,
        }
    }
}

/// Usage and payment computed for one sub meter in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub label: String,
    pub reading: i64,
    pub previous_reading: Option<i64>,
    pub incremental_usage: i64,
    pub payment_amount: Decimal,
}

pub(crate) fn invalid_reading(label: &str) -> BillingError {
    BillingError::validation(format!("Invalid reading for sub meter \"{}\"", label))
}

/// Reject a submission naming the same label twice.
pub fn ensure_unique_labels<'a, I>(labels: I) -> Result<(), BillingError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for label in labels {
        if !seen.insert(label) {
            return Err(BillingError::validation(format!(
                "Duplicate sub meter label \"{}\"",
                label
            )));
        }
    }
    Ok(())
}

/// Allocate a single reading against an optional baseline.
pub fn allocate_one(
    label: &str,
    reading: i64,
    baseline: Option<i64>,
    rate: Decimal,
) -> Result<Allocation, BillingError> {
    if reading < 0 {
        return Err(invalid_reading(label));
    }

    let (incremental_usage, payment_amount) = match baseline {
        None => (0, Decimal::ZERO),
        Some(previous) => {
            let usage = reading - previous;
            if usage < 0 {
                return Err(invalid_reading(label));
            }
            let payment = Decimal::from(usage)
                .checked_mul(rate)
                .map(round_money)
                .filter(|p| *p <= MAX_MONEY)
                .ok_or_else(|| {
                    BillingError::validation(format!(
                        "Payment for sub meter \"{}\" exceeds the maximum amount",
                        label
                    ))
                })?;
            (usage, payment)
        }
    };

    Ok(Allocation {
        label: label.to_string(),
        reading,
        previous_reading: baseline,
        incremental_usage,
        payment_amount,
    })
}

/// Allocate every submitted reading against the previous period's readings,
/// matched by label.
///
/// Fails on the first invalid reading; no partial list is returned.
pub fn allocate(
    submitted: &[MeterReading],
    previous: &[MeterReading],
    rate: Decimal,
) -> Result<Vec<Allocation>, BillingError> {
    ensure_unique_labels(submitted.iter().map(|m| m.label.as_str()))?;

    let baselines: HashMap<&str, i64> = previous
        .iter()
        .map(|m| (m.label.as_str(), m.reading))
        .collect();

    submitted
        .iter()
        .map(|m| {
            allocate_one(
                &m.label,
                m.reading,
                baselines.get(m.label.as_str()).copied(),
                rate,
            )
        })
        .collect()
}
