//! Persistence seam for the ledger.
//!
//! [`LedgerStore`] hands out [`LedgerTransaction`]s. A transaction is owned
//! by one in-flight operation; dropping it without [`LedgerTransaction::commit`]
//! rolls every write back.

mod memory;

pub use memory::{FailPoint, MemoryStore, TableCounts};

use crate::error::BillingError;
use crate::models::{
    BillingStatement, ExtendedStatement, NewPayment, NewStatement, NewSubMeter, Payment,
    PaymentChanges, StatementChanges, StatementQuery, SubMeter, SubMeterChanges,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

/// A transactional store of statements, sub meters and payments.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn health_check(&self) -> Result<(), BillingError>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, BillingError>;

    /// Statements of one owner, most recent period first.
    async fn list_statements(
        &self,
        owner_id: Uuid,
        query: &StatementQuery,
    ) -> Result<Vec<ExtendedStatement>, BillingError>;

    async fn get_statement(
        &self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<ExtendedStatement>, BillingError>;
}

/// Reads and writes inside one open transaction.
///
/// Writes are issued in foreign-key order by the caller: payments before
/// the rows referencing them, and referencing rows deleted first.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// The owner's most recent statement dated on or before `date`, latest
    /// created first on ties.
    async fn latest_statement_on_or_before(
        &mut self,
        owner_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<Option<ExtendedStatement>, BillingError>;

    /// Load a statement for writing. Concurrent writers to the same
    /// statement wait until this transaction ends.
    async fn lock_statement(
        &mut self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<ExtendedStatement>, BillingError>;

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, BillingError>;

    async fn update_payment(
        &mut self,
        payment_id: Uuid,
        changes: &PaymentChanges,
    ) -> Result<Option<Payment>, BillingError>;

    async fn delete_payments(&mut self, payment_ids: &[Uuid]) -> Result<u64, BillingError>;

    async fn insert_statement(
        &mut self,
        statement: &NewStatement,
    ) -> Result<BillingStatement, BillingError>;

    /// Apply `changes` and bump the statement's version.
    async fn update_statement(
        &mut self,
        statement_id: Uuid,
        changes: &StatementChanges,
    ) -> Result<Option<BillingStatement>, BillingError>;

    async fn delete_statement(&mut self, statement_id: Uuid) -> Result<bool, BillingError>;

    async fn insert_sub_meter(&mut self, sub_meter: &NewSubMeter) -> Result<SubMeter, BillingError>;

    async fn update_sub_meter(
        &mut self,
        sub_meter_id: Uuid,
        changes: &SubMeterChanges,
    ) -> Result<Option<SubMeter>, BillingError>;

    async fn delete_sub_meters(&mut self, sub_meter_ids: &[Uuid]) -> Result<u64, BillingError>;

    async fn commit(self: Box<Self>) -> Result<(), BillingError>;
}
