//! Domain models for utility-billing-service.

mod request;
mod statement;
mod summary;

pub use request::{
    CreateStatementRequest, DeleteOutcome, ImportOutcome, ImportStatementsRequest, StatementPage,
    SubMeterInput, SubMeterUpdateInput, UpdateStatementRequest,
};
pub use statement::{
    BillingStatement, BillingStatus, ExtendedStatement, NewPayment, NewStatement, NewSubMeter,
    Payment, PaymentChanges, StatementChanges, SubMeter, SubMeterChanges, SubMeterWithPayment,
};
pub use summary::{HistoryFilter, StatementQuery, SummaryMetrics};
