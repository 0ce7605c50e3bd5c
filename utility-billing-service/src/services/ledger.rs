//! Billing ledger operations.
//!
//! Every write runs in one store transaction. All validation happens before
//! the first write; any error after that drops the transaction, which rolls
//! it back.

use crate::error::BillingError;
use crate::ledger::{
    allocate, calculate_rate, diff_statement, main_payment_amount, plan_sub_meters, summarize,
    sub_meters_changed, validate, validate_totals, MeterReading, StatementTotals, SubMeterPlan,
};
use crate::models::{
    CreateStatementRequest, DeleteOutcome, ExtendedStatement, HistoryFilter, ImportOutcome,
    NewPayment, NewStatement, NewSubMeter, PaymentChanges, StatementPage, StatementQuery,
    SubMeterWithPayment, SummaryMetrics, UpdateStatementRequest,
};
use crate::services::events::{LedgerEvent, LedgerEventPublisher};
use crate::services::metrics::{record_error, record_statement_operation};
use crate::store::LedgerStore;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// The billing ledger over an injected store.
#[derive(Clone)]
pub struct BillingLedger {
    store: Arc<dyn LedgerStore>,
    events: Option<LedgerEventPublisher>,
}

fn readings_of(statement: &ExtendedStatement) -> Vec<MeterReading> {
    statement
        .sub_meters
        .iter()
        .map(|s| MeterReading::new(s.sub_meter.label.clone(), s.sub_meter.reading))
        .collect()
}

fn ensure_label(label: &str) -> Result<(), BillingError> {
    if label.trim().is_empty() {
        return Err(BillingError::validation("Sub meter label cannot be empty"));
    }
    Ok(())
}

fn rate_for(balance: Decimal, total_usage: i64) -> Result<Decimal, BillingError> {
    calculate_rate(balance, total_usage)
        .ok_or_else(|| BillingError::validation("Total usage must be greater than zero"))
}

fn statement_not_found(statement_id: Uuid) -> BillingError {
    BillingError::NotFound(format!("Billing statement {} not found", statement_id))
}

/// Reject a stored statement whose payment rows are gone.
fn ensure_references(existing: &ExtendedStatement) -> Result<(), BillingError> {
    let statement_id = existing.statement.statement_id;
    if existing.main_payment.is_none() {
        return Err(BillingError::reference(format!(
            "Billing statement {} has no main payment",
            statement_id
        )));
    }
    if let Some(orphan) = existing.sub_meters.iter().find(|s| s.payment.is_none()) {
        return Err(BillingError::reference(format!(
            "Sub meter \"{}\" of billing statement {} has no payment",
            orphan.sub_meter.label, statement_id
        )));
    }
    Ok(())
}

fn observe<T>(operation: &str, outcome: &str, result: &Result<T, BillingError>) {
    match result {
        Ok(_) => record_statement_operation(operation, outcome),
        Err(e) => {
            record_error(e.kind(), operation);
            match e {
                BillingError::Infrastructure(_) | BillingError::Reference(_) => {
                    tracing::error!(operation, error = %e, "Ledger operation failed")
                }
                _ => warn!(operation, error = %e, "Ledger operation rejected"),
            }
        }
    }
}

impl BillingLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            events: None,
        }
    }

    /// Publish post-commit events to `publisher`.
    pub fn with_events(mut self, publisher: LedgerEventPublisher) -> Self {
        self.events = Some(publisher);
        self
    }

    fn publish(&self, event: LedgerEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    pub async fn health_check(&self) -> Result<(), BillingError> {
        self.store.health_check().await
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Record a new billing period.
    #[instrument(skip(self, request), fields(owner_id = %owner_id, period_date = %request.date))]
    pub async fn create_statement(
        &self,
        owner_id: Uuid,
        request: &CreateStatementRequest,
    ) -> Result<ExtendedStatement, BillingError> {
        let result = self.create_inner(owner_id, request).await;
        observe("create", "created", &result);

        if let Ok(created) = &result {
            info!(
                statement_id = %created.statement.statement_id,
                sub_meters = created.sub_meters.len(),
                pay_per_unit = %created.statement.pay_per_unit,
                "Billing statement created"
            );
            self.publish(LedgerEvent::StatementCreated {
                owner_id,
                statement_id: created.statement.statement_id,
                sub_meter_count: created.sub_meters.len(),
            });
        }
        result
    }

    async fn create_inner(
        &self,
        owner_id: Uuid,
        request: &CreateStatementRequest,
    ) -> Result<ExtendedStatement, BillingError> {
        validate_totals(request.total_usage, request.balance)?;
        for sub in &request.sub_meters {
            ensure_label(&sub.label)?;
        }
        let rate = rate_for(request.balance, request.total_usage)?;

        let mut tx = self.store.begin().await?;

        let previous = tx
            .latest_statement_on_or_before(owner_id, request.date, None)
            .await?
            .map(|s| readings_of(&s))
            .unwrap_or_default();

        let submitted: Vec<MeterReading> = request
            .sub_meters
            .iter()
            .map(|s| MeterReading::new(s.label.clone(), s.reading))
            .collect();
        let allocations = allocate(&submitted, &previous, rate)?;
        validate(
            StatementTotals {
                total_usage: request.total_usage,
                balance: request.balance,
            },
            &allocations,
        )?;

        let main_payment = tx
            .insert_payment(&NewPayment {
                amount: main_payment_amount(request.balance, &allocations),
                payment_date: request.date,
            })
            .await?;

        let statement = tx
            .insert_statement(&NewStatement {
                owner_id,
                period_date: request.date,
                total_usage: request.total_usage,
                balance: request.balance,
                status: request.status,
                pay_per_unit: rate,
                main_payment_id: main_payment.payment_id,
            })
            .await?;

        let mut sub_meters = Vec::with_capacity(allocations.len());
        for allocation in &allocations {
            let payment = tx
                .insert_payment(&NewPayment {
                    amount: allocation.payment_amount,
                    payment_date: request.date,
                })
                .await?;
            let sub_meter = tx
                .insert_sub_meter(&NewSubMeter {
                    statement_id: statement.statement_id,
                    label: allocation.label.clone(),
                    reading: allocation.reading,
                    previous_reading: allocation.previous_reading,
                    incremental_usage: allocation.incremental_usage,
                    payment_id: payment.payment_id,
                })
                .await?;
            sub_meters.push(SubMeterWithPayment {
                sub_meter,
                payment: Some(payment),
            });
        }

        tx.commit().await?;

        let mut created = ExtendedStatement {
            statement,
            main_payment: Some(main_payment),
            sub_meters,
        };
        created.sort_sub_meters();
        Ok(created)
    }

    // -------------------------------------------------------------------------
    // Update
    // -------------------------------------------------------------------------

    /// Apply a partial update.
    ///
    /// An update that changes nothing returns the stored statement and
    /// performs no writes.
    #[instrument(skip(self, request), fields(owner_id = %owner_id, statement_id = %request.statement_id))]
    pub async fn update_statement(
        &self,
        owner_id: Uuid,
        request: &UpdateStatementRequest,
    ) -> Result<ExtendedStatement, BillingError> {
        let result = self.update_inner(owner_id, request).await;
        let outcome = match &result {
            Ok((_, true)) => "updated",
            _ => "unchanged",
        };
        observe("update", outcome, &result);

        result.map(|(statement, changed)| {
            if changed {
                info!(
                    version = statement.statement.version,
                    sub_meters = statement.sub_meters.len(),
                    "Billing statement updated"
                );
                self.publish(LedgerEvent::StatementUpdated {
                    owner_id,
                    statement_id: statement.statement.statement_id,
                    version: statement.statement.version,
                });
            } else {
                info!("Billing statement unchanged");
            }
            statement
        })
    }

    async fn update_inner(
        &self,
        owner_id: Uuid,
        request: &UpdateStatementRequest,
    ) -> Result<(ExtendedStatement, bool), BillingError> {
        let statement_id = request.statement_id;
        if let Some(items) = &request.sub_meters {
            for item in items {
                ensure_label(&item.label)?;
            }
        }

        let mut tx = self.store.begin().await?;

        let existing = tx
            .lock_statement(owner_id, statement_id)
            .await?
            .ok_or_else(|| statement_not_found(statement_id))?;
        ensure_references(&existing)?;

        if let Some(expected) = request.expected_version {
            if expected != existing.statement.version {
                return Err(BillingError::Conflict(format!(
                    "Billing statement {} is at version {}, not {}",
                    statement_id, existing.statement.version, expected
                )));
            }
        }

        let changes = diff_statement(&existing.statement, request);
        let submitted = request
            .sub_meters
            .as_deref()
            .filter(|items| sub_meters_changed(&existing.sub_meters, items));

        if changes.is_empty() && submitted.is_none() {
            return Ok((existing, false));
        }

        let total_usage = changes.total_usage.unwrap_or(existing.statement.total_usage);
        let balance = changes.balance.unwrap_or(existing.statement.balance);
        let period_date = changes.period_date.unwrap_or(existing.statement.period_date);
        validate_totals(total_usage, balance)?;
        let rate = changes
            .pay_per_unit
            .unwrap_or(existing.statement.pay_per_unit);

        let plan = match submitted {
            Some(items) => {
                let prior = if items.iter().any(|i| i.sub_meter_id.is_none()) {
                    tx.latest_statement_on_or_before(owner_id, period_date, Some(statement_id))
                        .await?
                        .map(|s| readings_of(&s))
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                plan_sub_meters(&existing.sub_meters, items, &prior, rate)?
            }
            None => SubMeterPlan::unchanged(&existing.sub_meters),
        };

        let allocations = plan.allocations();
        validate(StatementTotals { total_usage, balance }, &allocations)?;
        let main_amount = main_payment_amount(balance, &allocations);

        // Writes, in foreign-key order.
        if !plan.removed.is_empty() {
            let sub_meter_ids: Vec<Uuid> = plan.removed.iter().map(|r| r.sub_meter_id).collect();
            let payment_ids: Vec<Uuid> = plan.removed.iter().map(|r| r.payment_id).collect();
            tx.delete_sub_meters(&sub_meter_ids).await?;
            tx.delete_payments(&payment_ids).await?;
        }

        let statement = tx
            .update_statement(statement_id, &changes)
            .await?
            .ok_or_else(|| statement_not_found(statement_id))?;

        let stored: HashMap<Uuid, &SubMeterWithPayment> = existing
            .sub_meters
            .iter()
            .map(|s| (s.sub_meter.sub_meter_id, s))
            .collect();

        let mut sub_meters = Vec::with_capacity(plan.kept.len() + plan.added.len());
        for kept in &plan.kept {
            let current = stored.get(&kept.sub_meter_id).ok_or_else(|| {
                BillingError::reference(format!("Sub meter {} vanished", kept.sub_meter_id))
            })?;

            let sub_meter = if kept.changes.is_empty() {
                current.sub_meter.clone()
            } else {
                tx.update_sub_meter(kept.sub_meter_id, &kept.changes)
                    .await?
                    .ok_or_else(|| {
                        BillingError::reference(format!(
                            "Sub meter {} vanished",
                            kept.sub_meter_id
                        ))
                    })?
            };

            let payment_changes = PaymentChanges {
                amount: kept.payment_amount,
                payment_date: changes.period_date,
            };
            let payment = if payment_changes.is_empty() {
                current.payment.clone()
            } else {
                let updated = tx
                    .update_payment(kept.payment_id, &payment_changes)
                    .await?
                    .ok_or_else(|| {
                        BillingError::reference(format!(
                            "Payment {} of sub meter \"{}\" is missing",
                            kept.payment_id, sub_meter.label
                        ))
                    })?;
                Some(updated)
            };

            sub_meters.push(SubMeterWithPayment { sub_meter, payment });
        }

        for allocation in &plan.added {
            let payment = tx
                .insert_payment(&NewPayment {
                    amount: allocation.payment_amount,
                    payment_date: period_date,
                })
                .await?;
            let sub_meter = tx
                .insert_sub_meter(&NewSubMeter {
                    statement_id,
                    label: allocation.label.clone(),
                    reading: allocation.reading,
                    previous_reading: allocation.previous_reading,
                    incremental_usage: allocation.incremental_usage,
                    payment_id: payment.payment_id,
                })
                .await?;
            sub_meters.push(SubMeterWithPayment {
                sub_meter,
                payment: Some(payment),
            });
        }

        let main_changes = PaymentChanges {
            amount: Some(main_amount).filter(|a| *a != existing.main_payment_amount()),
            payment_date: changes.period_date,
        };
        let main_payment = if main_changes.is_empty() {
            existing.main_payment.clone()
        } else {
            let updated = tx
                .update_payment(statement.main_payment_id, &main_changes)
                .await?
                .ok_or_else(|| {
                    BillingError::reference(format!(
                        "Main payment {} of billing statement {} is missing",
                        statement.main_payment_id, statement_id
                    ))
                })?;
            Some(updated)
        };

        tx.commit().await?;

        let mut updated = ExtendedStatement {
            statement,
            main_payment,
            sub_meters,
        };
        updated.sort_sub_meters();
        Ok((updated, true))
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Delete a statement with its sub meters and every payment it owns.
    ///
    /// A statement that does not exist yields `deleted: false`.
    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    pub async fn delete_statement(
        &self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<DeleteOutcome, BillingError> {
        let result = self.delete_inner(owner_id, statement_id).await;
        let outcome = match &result {
            Ok(DeleteOutcome { deleted: true }) => "deleted",
            _ => "not_found",
        };
        observe("delete", outcome, &result);

        if let Ok(DeleteOutcome { deleted: true }) = &result {
            info!("Billing statement deleted");
            self.publish(LedgerEvent::StatementDeleted {
                owner_id,
                statement_id,
            });
        }
        result
    }

    async fn delete_inner(
        &self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<DeleteOutcome, BillingError> {
        let mut tx = self.store.begin().await?;

        let Some(existing) = tx.lock_statement(owner_id, statement_id).await? else {
            return Ok(DeleteOutcome { deleted: false });
        };

        let sub_meter_ids: Vec<Uuid> = existing
            .sub_meters
            .iter()
            .map(|s| s.sub_meter.sub_meter_id)
            .collect();
        if !sub_meter_ids.is_empty() {
            tx.delete_sub_meters(&sub_meter_ids).await?;
        }
        let deleted = tx.delete_statement(statement_id).await?;
        tx.delete_payments(&existing.owned_payment_ids()).await?;

        tx.commit().await?;
        Ok(DeleteOutcome { deleted })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    pub async fn get_statement(
        &self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<ExtendedStatement, BillingError> {
        self.store
            .get_statement(owner_id, statement_id)
            .await?
            .ok_or_else(|| statement_not_found(statement_id))
    }

    /// One page of statements, most recent period first.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn list_statements(
        &self,
        owner_id: Uuid,
        page_size: Option<i64>,
        page_token: Option<Uuid>,
    ) -> Result<StatementPage, BillingError> {
        let limit = page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let mut statements = self
            .store
            .list_statements(
                owner_id,
                &StatementQuery {
                    filter: HistoryFilter::default(),
                    limit: Some(limit + 1),
                    after: page_token,
                },
            )
            .await?;

        let next_page_token = if statements.len() as i64 > limit {
            statements.truncate(limit as usize);
            statements.last().map(|s| s.statement.statement_id)
        } else {
            None
        };

        Ok(StatementPage {
            statements,
            next_page_token,
        })
    }

    /// Summary metrics over the owner's history, optionally windowed.
    #[instrument(skip(self, filter), fields(owner_id = %owner_id))]
    pub async fn summarize_history(
        &self,
        owner_id: Uuid,
        filter: &HistoryFilter,
    ) -> Result<SummaryMetrics, BillingError> {
        let history = self
            .store
            .list_statements(
                owner_id,
                &StatementQuery {
                    filter: filter.clone(),
                    ..StatementQuery::default()
                },
            )
            .await?;

        summarize(&history)
    }

    // -------------------------------------------------------------------------
    // Import
    // -------------------------------------------------------------------------

    /// Record a batch of statements oldest first, so each one's sub meters
    /// are billed against the one before it.
    ///
    /// Each item is its own transaction. A rejected item does not stop the
    /// batch; a store failure does.
    #[instrument(skip(self, items), fields(owner_id = %owner_id, count = items.len()))]
    pub async fn import_statements(
        &self,
        owner_id: Uuid,
        items: &[CreateStatementRequest],
    ) -> Result<Vec<ImportOutcome>, BillingError> {
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by_key(|&i| items[i].date);

        let mut outcomes = Vec::with_capacity(items.len());
        for index in order {
            let item = &items[index];
            match self.create_statement(owner_id, item).await {
                Ok(created) => outcomes.push(ImportOutcome::Created {
                    index,
                    date: item.date,
                    statement_id: created.statement.statement_id,
                }),
                Err(e @ BillingError::Infrastructure(_)) => return Err(e),
                Err(e) => outcomes.push(ImportOutcome::Rejected {
                    index,
                    date: item.date,
                    reason: e.to_string(),
                }),
            }
        }

        let created = outcomes.iter().filter(|o| o.is_created()).count();
        info!(
            created,
            rejected = outcomes.len() - created,
            "Billing statement import finished"
        );

        outcomes.sort_by_key(ImportOutcome::index);
        Ok(outcomes)
    }
}
