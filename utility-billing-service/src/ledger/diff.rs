//! Change detection for statement updates.
//!
//! Statement fields are compared one by one into a typed
//! [`StatementChanges`]. Sub meters are matched to the stored set by id,
//! never by label: the stored row already anchors identity and baseline.

use super::allocator::{allocate_one, ensure_unique_labels, Allocation, MeterReading};
use super::rate::calculate_rate;
use crate::error::BillingError;
use crate::models::{
    BillingStatement, StatementChanges, SubMeterChanges, SubMeterUpdateInput, SubMeterWithPayment,
    UpdateStatementRequest,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Fields of `request` that differ from `existing`.
///
/// The per-unit rate is recomputed only when balance or usage changes.
pub fn diff_statement(
    existing: &BillingStatement,
    request: &UpdateStatementRequest,
) -> StatementChanges {
    let mut changes = StatementChanges {
        period_date: request.date.filter(|d| *d != existing.period_date),
        total_usage: request.total_usage.filter(|u| *u != existing.total_usage),
        balance: request.balance.filter(|b| *b != existing.balance),
        status: request.status.filter(|s| *s != existing.status),
        pay_per_unit: None,
    };

    if changes.total_usage.is_some() || changes.balance.is_some() {
        let balance = changes.balance.unwrap_or(existing.balance);
        let total_usage = changes.total_usage.unwrap_or(existing.total_usage);
        changes.pay_per_unit =
            calculate_rate(balance, total_usage).filter(|r| *r != existing.pay_per_unit);
    }

    changes
}

/// Whether a submitted sub-meter set differs from the stored one.
pub fn sub_meters_changed(
    existing: &[SubMeterWithPayment],
    submitted: &[SubMeterUpdateInput],
) -> bool {
    if existing.len() != submitted.len() {
        return true;
    }

    let stored: HashMap<Uuid, &SubMeterWithPayment> = existing
        .iter()
        .map(|s| (s.sub_meter.sub_meter_id, s))
        .collect();

    submitted.iter().any(|item| {
        let Some(id) = item.sub_meter_id else {
            return true;
        };
        match stored.get(&id) {
            None => true,
            Some(current) => {
                current.sub_meter.label != item.label || current.sub_meter.reading != item.reading
            }
        }
    })
}

/// A stored sub meter that disappears from the statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSubMeter {
    pub sub_meter_id: Uuid,
    pub payment_id: Uuid,
}

/// A stored sub meter that stays, possibly with new values.
#[derive(Debug, Clone, PartialEq)]
pub struct KeptSubMeter {
    pub sub_meter_id: Uuid,
    pub payment_id: Uuid,
    pub changes: SubMeterChanges,
    /// New payment amount, when it differs from the stored one.
    pub payment_amount: Option<Decimal>,
    pub allocation: Allocation,
}

/// Writes needed to bring the stored sub meters in line with a submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubMeterPlan {
    pub removed: Vec<RemovedSubMeter>,
    pub kept: Vec<KeptSubMeter>,
    pub added: Vec<Allocation>,
}

impl SubMeterPlan {
    /// Keep every stored sub meter exactly as it is.
    pub fn unchanged(existing: &[SubMeterWithPayment]) -> Self {
        Self {
            kept: existing
                .iter()
                .map(|s| KeptSubMeter {
                    sub_meter_id: s.sub_meter.sub_meter_id,
                    payment_id: s.sub_meter.payment_id,
                    changes: SubMeterChanges::default(),
                    payment_amount: None,
                    allocation: stored_allocation(s),
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Allocations of the resulting sub-meter set.
    pub fn allocations(&self) -> Vec<Allocation> {
        self.kept
            .iter()
            .map(|k| k.allocation.clone())
            .chain(self.added.iter().cloned())
            .collect()
    }
}

fn stored_allocation(s: &SubMeterWithPayment) -> Allocation {
    Allocation {
        label: s.sub_meter.label.clone(),
        reading: s.sub_meter.reading,
        previous_reading: s.sub_meter.previous_reading,
        incremental_usage: s.sub_meter.incremental_usage,
        payment_amount: s.payment_amount(),
    }
}

/// Plan the sub-meter writes of an update.
///
/// Kept sub meters with an unchanged reading keep their stored allocation.
/// A changed reading is billed from the reading it replaces, which becomes
/// the row's new baseline. New sub meters are allocated against `prior`, the previous period's
/// readings, by label.
pub fn plan_sub_meters(
    existing: &[SubMeterWithPayment],
    submitted: &[SubMeterUpdateInput],
    prior: &[MeterReading],
    rate: Decimal,
) -> Result<SubMeterPlan, BillingError> {
    ensure_unique_labels(submitted.iter().map(|s| s.label.as_str()))?;

    let stored: HashMap<Uuid, &SubMeterWithPayment> = existing
        .iter()
        .map(|s| (s.sub_meter.sub_meter_id, s))
        .collect();
    let baselines: HashMap<&str, i64> = prior
        .iter()
        .map(|m| (m.label.as_str(), m.reading))
        .collect();

    let mut plan = SubMeterPlan::default();
    let mut submitted_ids = HashSet::new();

    for item in submitted {
        let Some(id) = item.sub_meter_id else {
            let baseline = baselines.get(item.label.as_str()).copied();
            plan.added
                .push(allocate_one(&item.label, item.reading, baseline, rate)?);
            continue;
        };

        if !submitted_ids.insert(id) {
            return Err(BillingError::validation(format!(
                "Sub meter {} submitted more than once",
                id
            )));
        }
        let current = stored.get(&id).ok_or_else(|| {
            BillingError::validation(format!(
                "Sub meter {} does not belong to this billing statement",
                id
            ))
        })?;

        let mut changes = SubMeterChanges::default();
        if current.sub_meter.label != item.label {
            changes.label = Some(item.label.clone());
        }

        let (allocation, payment_amount) = if current.sub_meter.reading == item.reading {
            let mut allocation = stored_allocation(current);
            allocation.label = item.label.clone();
            (allocation, None)
        } else {
            let baseline = current.sub_meter.reading;
            let allocation = allocate_one(&item.label, item.reading, Some(baseline), rate)?;
            changes.reading = Some(item.reading);
            if current.sub_meter.previous_reading != Some(baseline) {
                changes.previous_reading = Some(baseline);
            }
            if allocation.incremental_usage != current.sub_meter.incremental_usage {
                changes.incremental_usage = Some(allocation.incremental_usage);
            }
            let amount = Some(allocation.payment_amount)
                .filter(|a| *a != current.payment_amount());
            (allocation, amount)
        };

        plan.kept.push(KeptSubMeter {
            sub_meter_id: id,
            payment_id: current.sub_meter.payment_id,
            changes,
            payment_amount,
            allocation,
        });
    }

    plan.removed = existing
        .iter()
        .filter(|s| !submitted_ids.contains(&s.sub_meter.sub_meter_id))
        .map(|s| RemovedSubMeter {
            sub_meter_id: s.sub_meter.sub_meter_id,
            payment_id: s.sub_meter.payment_id,
        })
        .collect();

    Ok(plan)
}
