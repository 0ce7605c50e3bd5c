//! Services module for utility-billing-service.

pub mod database;
pub mod events;
pub mod ledger;
pub mod metrics;

pub use database::Database;
pub use events::{spawn_event_logger, LedgerEvent, LedgerEventPublisher};
pub use ledger::BillingLedger;
pub use metrics::{get_metrics, init_metrics, record_error, record_statement_operation};
