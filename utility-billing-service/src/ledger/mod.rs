//! Pure billing computations: rate, allocation, consistency checks,
//! update diffing and summary metrics. Nothing here touches the store.

pub mod allocator;
pub mod diff;
pub mod rate;
pub mod summary;
pub mod validator;

pub use allocator::{allocate, allocate_one, ensure_unique_labels, Allocation, MeterReading};
pub use diff::{
    diff_statement, plan_sub_meters, sub_meters_changed, KeptSubMeter, RemovedSubMeter,
    SubMeterPlan,
};
pub use rate::{calculate_rate, round_money, MAX_MONEY};
pub use summary::summarize;
pub use validator::{main_payment_amount, validate, validate_totals, StatementTotals};
