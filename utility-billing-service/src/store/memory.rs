//! In-process ledger store.
//!
//! A transaction holds the store's lock for its whole lifetime and works on
//! a copy of the tables; commit swaps the copy in. Writers are therefore
//! fully serialized, which stands in for row locking.

use super::{LedgerStore, LedgerTransaction};
use crate::error::BillingError;
use crate::models::{
    BillingStatement, ExtendedStatement, NewPayment, NewStatement, NewSubMeter, Payment,
    PaymentChanges, StatementChanges, StatementQuery, SubMeter, SubMeterChanges,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};
use uuid::Uuid;

/// A store operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Begin,
    InsertPayment,
    UpdatePayment,
    DeletePayments,
    InsertStatement,
    UpdateStatement,
    DeleteStatement,
    InsertSubMeter,
    UpdateSubMeter,
    DeleteSubMeters,
    Commit,
}

/// Committed row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub payments: usize,
    pub statements: usize,
    pub sub_meters: usize,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    payments: HashMap<Uuid, Payment>,
    statements: HashMap<Uuid, BillingStatement>,
    sub_meters: HashMap<Uuid, SubMeter>,
}

impl Tables {
    fn extend(&self, statement: &BillingStatement) -> ExtendedStatement {
        let sub_meters = self
            .sub_meters
            .values()
            .filter(|s| s.statement_id == statement.statement_id)
            .cloned()
            .collect();
        ExtendedStatement::from_parts(statement.clone(), sub_meters, |id| {
            self.payments.get(&id).cloned()
        })
    }

    /// Statements of `owner_id`, most recent period first.
    fn ordered(&self, owner_id: Uuid) -> Vec<&BillingStatement> {
        let mut statements: Vec<_> = self
            .statements
            .values()
            .filter(|s| s.owner_id == owner_id)
            .collect();
        statements.sort_by_key(|s| Reverse((s.period_date, s.created_utc, s.statement_id)));
        statements
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    fail_on: Option<FailPoint>,
}

/// Ledger store kept in memory.
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `point` fail until cleared.
    pub async fn fail_on(&self, point: FailPoint) {
        self.inner.lock().await.fail_on = Some(point);
    }

    pub async fn clear_failure(&self) {
        self.inner.lock().await.fail_on = None;
    }

    /// Write operations issued so far, committed or not.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn counts(&self) -> TableCounts {
        let inner = self.inner.lock().await;
        TableCounts {
            payments: inner.tables.payments.len(),
            statements: inner.tables.statements.len(),
            sub_meters: inner.tables.sub_meters.len(),
        }
    }
}

fn injected(point: FailPoint) -> BillingError {
    BillingError::infrastructure("Injected store failure", format!("{:?}", point))
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn health_check(&self) -> Result<(), BillingError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, BillingError> {
        let guard = self.inner.clone().lock_owned().await;
        if guard.fail_on == Some(FailPoint::Begin) {
            return Err(injected(FailPoint::Begin));
        }
        let working = guard.tables.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            writes: self.writes.clone(),
        }))
    }

    #[instrument(skip(self, query), fields(owner_id = %owner_id))]
    async fn list_statements(
        &self,
        owner_id: Uuid,
        query: &StatementQuery,
    ) -> Result<Vec<ExtendedStatement>, BillingError> {
        let inner = self.inner.lock().await;
        let tables = &inner.tables;

        let ordered = tables.ordered(owner_id);
        let start = match query.after {
            Some(cursor) => ordered
                .iter()
                .position(|s| s.statement_id == cursor)
                .map_or(ordered.len(), |i| i + 1),
            None => 0,
        };
        let limit = query
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(0));

        Ok(ordered[start..]
            .iter()
            .filter(|s| query.filter.contains(s.period_date))
            .take(limit)
            .map(|s| tables.extend(s))
            .collect())
    }

    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    async fn get_statement(
        &self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<ExtendedStatement>, BillingError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tables
            .statements
            .get(&statement_id)
            .filter(|s| s.owner_id == owner_id)
            .map(|s| inner.tables.extend(s)))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Inner>,
    working: Tables,
    writes: Arc<AtomicU64>,
}

impl MemoryTransaction {
    /// Count a write, failing it when `point` is armed.
    fn write(&self, point: FailPoint) -> Result<(), BillingError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.guard.fail_on == Some(point) {
            return Err(injected(point));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn latest_statement_on_or_before(
        &mut self,
        owner_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<Option<ExtendedStatement>, BillingError> {
        Ok(self
            .working
            .ordered(owner_id)
            .into_iter()
            .find(|s| s.period_date <= date && Some(s.statement_id) != exclude)
            .map(|s| self.working.extend(s)))
    }

    async fn lock_statement(
        &mut self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<ExtendedStatement>, BillingError> {
        Ok(self
            .working
            .statements
            .get(&statement_id)
            .filter(|s| s.owner_id == owner_id)
            .map(|s| self.working.extend(s)))
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, BillingError> {
        self.write(FailPoint::InsertPayment)?;
        let now = Utc::now();
        let row = Payment {
            payment_id: Uuid::new_v4(),
            amount: payment.amount,
            payment_date: payment.payment_date,
            created_utc: now,
            updated_utc: now,
        };
        self.working.payments.insert(row.payment_id, row.clone());
        Ok(row)
    }

    async fn update_payment(
        &mut self,
        payment_id: Uuid,
        changes: &PaymentChanges,
    ) -> Result<Option<Payment>, BillingError> {
        self.write(FailPoint::UpdatePayment)?;
        let Some(row) = self.working.payments.get_mut(&payment_id) else {
            return Ok(None);
        };
        if let Some(amount) = changes.amount {
            row.amount = amount;
        }
        if let Some(date) = changes.payment_date {
            row.payment_date = date;
        }
        row.updated_utc = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn delete_payments(&mut self, payment_ids: &[Uuid]) -> Result<u64, BillingError> {
        self.write(FailPoint::DeletePayments)?;
        let referenced = payment_ids.iter().find(|id| {
            self.working
                .statements
                .values()
                .any(|s| s.main_payment_id == **id)
                || self.working.sub_meters.values().any(|s| s.payment_id == **id)
        });
        if let Some(id) = referenced {
            return Err(BillingError::infrastructure(
                "Failed to delete payments",
                format!("payment {} is still referenced", id),
            ));
        }
        let removed = payment_ids
            .iter()
            .filter(|id| self.working.payments.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn insert_statement(
        &mut self,
        statement: &NewStatement,
    ) -> Result<BillingStatement, BillingError> {
        self.write(FailPoint::InsertStatement)?;
        if !self.working.payments.contains_key(&statement.main_payment_id) {
            return Err(BillingError::reference(format!(
                "Main payment {} does not exist",
                statement.main_payment_id
            )));
        }
        let now = Utc::now();
        let row = BillingStatement {
            statement_id: Uuid::new_v4(),
            owner_id: statement.owner_id,
            period_date: statement.period_date,
            total_usage: statement.total_usage,
            balance: statement.balance,
            status: statement.status,
            pay_per_unit: statement.pay_per_unit,
            main_payment_id: statement.main_payment_id,
            version: 1,
            created_utc: now,
            updated_utc: now,
        };
        self.working.statements.insert(row.statement_id, row.clone());
        Ok(row)
    }

    async fn update_statement(
        &mut self,
        statement_id: Uuid,
        changes: &StatementChanges,
    ) -> Result<Option<BillingStatement>, BillingError> {
        self.write(FailPoint::UpdateStatement)?;
        let Some(row) = self.working.statements.get_mut(&statement_id) else {
            return Ok(None);
        };
        if let Some(date) = changes.period_date {
            row.period_date = date;
        }
        if let Some(usage) = changes.total_usage {
            row.total_usage = usage;
        }
        if let Some(balance) = changes.balance {
            row.balance = balance;
        }
        if let Some(status) = changes.status {
            row.status = status;
        }
        if let Some(rate) = changes.pay_per_unit {
            row.pay_per_unit = rate;
        }
        row.version += 1;
        row.updated_utc = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn delete_statement(&mut self, statement_id: Uuid) -> Result<bool, BillingError> {
        self.write(FailPoint::DeleteStatement)?;
        let removed = self.working.statements.remove(&statement_id).is_some();
        if removed {
            self.working
                .sub_meters
                .retain(|_, s| s.statement_id != statement_id);
        }
        Ok(removed)
    }

    async fn insert_sub_meter(&mut self, sub_meter: &NewSubMeter) -> Result<SubMeter, BillingError> {
        self.write(FailPoint::InsertSubMeter)?;
        if !self.working.statements.contains_key(&sub_meter.statement_id) {
            return Err(BillingError::reference(format!(
                "Billing statement {} does not exist",
                sub_meter.statement_id
            )));
        }
        let label_taken = self
            .working
            .sub_meters
            .values()
            .any(|s| s.statement_id == sub_meter.statement_id && s.label == sub_meter.label);
        if label_taken {
            return Err(BillingError::validation(format!(
                "Duplicate sub meter label \"{}\"",
                sub_meter.label
            )));
        }
        let now = Utc::now();
        let row = SubMeter {
            sub_meter_id: Uuid::new_v4(),
            statement_id: sub_meter.statement_id,
            label: sub_meter.label.clone(),
            reading: sub_meter.reading,
            previous_reading: sub_meter.previous_reading,
            incremental_usage: sub_meter.incremental_usage,
            payment_id: sub_meter.payment_id,
            created_utc: now,
            updated_utc: now,
        };
        self.working.sub_meters.insert(row.sub_meter_id, row.clone());
        Ok(row)
    }

    async fn update_sub_meter(
        &mut self,
        sub_meter_id: Uuid,
        changes: &SubMeterChanges,
    ) -> Result<Option<SubMeter>, BillingError> {
        self.write(FailPoint::UpdateSubMeter)?;
        let Some(row) = self.working.sub_meters.get_mut(&sub_meter_id) else {
            return Ok(None);
        };
        if let Some(label) = &changes.label {
            row.label = label.clone();
        }
        if let Some(reading) = changes.reading {
            row.reading = reading;
        }
        if let Some(previous) = changes.previous_reading {
            row.previous_reading = Some(previous);
        }
        if let Some(usage) = changes.incremental_usage {
            row.incremental_usage = usage;
        }
        row.updated_utc = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn delete_sub_meters(&mut self, sub_meter_ids: &[Uuid]) -> Result<u64, BillingError> {
        self.write(FailPoint::DeleteSubMeters)?;
        let removed = sub_meter_ids
            .iter()
            .filter(|id| self.working.sub_meters.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), BillingError> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        if guard.fail_on == Some(FailPoint::Commit) {
            return Err(injected(FailPoint::Commit));
        }
        guard.tables = working;
        debug!("Memory transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BillingStatus;
    use rust_decimal::Decimal;

    async fn seed(tx: &mut Box<dyn LedgerTransaction>, owner_id: Uuid) -> BillingStatement {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let payment = tx
            .insert_payment(&NewPayment {
                amount: Decimal::new(10000, 2),
                payment_date: date,
            })
            .await
            .unwrap();
        tx.insert_statement(&NewStatement {
            owner_id,
            period_date: date,
            total_usage: 500,
            balance: Decimal::new(10000, 2),
            status: BillingStatus::Pending,
            pay_per_unit: Decimal::new(20, 2),
            main_payment_id: payment.payment_id,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            seed(&mut tx, Uuid::new_v4()).await;
        }
        assert_eq!(store.counts().await, TableCounts::default());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn committed_rows_are_visible_to_owner_only() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        let statement = seed(&mut tx, owner).await;
        tx.commit().await.unwrap();

        let found = store.get_statement(owner, statement.statement_id).await.unwrap();
        assert_eq!(found.unwrap().main_payment_amount(), Decimal::new(10000, 2));
        let other = store
            .get_statement(Uuid::new_v4(), statement.statement_id)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn fail_point_aborts_the_write() {
        let store = MemoryStore::new();
        store.fail_on(FailPoint::InsertStatement).await;
        let mut tx = store.begin().await.unwrap();
        let payment = tx
            .insert_payment(&NewPayment {
                amount: Decimal::ONE,
                payment_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            })
            .await
            .unwrap();
        let err = tx
            .insert_statement(&NewStatement {
                owner_id: Uuid::new_v4(),
                period_date: payment.payment_date,
                total_usage: 1,
                balance: Decimal::ONE,
                status: BillingStatus::Paid,
                pay_per_unit: Decimal::ONE,
                main_payment_id: payment.payment_id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn referenced_payment_cannot_be_deleted() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let statement = seed(&mut tx, Uuid::new_v4()).await;
        let result = tx.delete_payments(&[statement.main_payment_id]).await;
        assert!(result.is_err());
    }
}
