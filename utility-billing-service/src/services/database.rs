//! PostgreSQL ledger store.

use crate::error::BillingError;
use crate::models::{
    BillingStatement, BillingStatus, ExtendedStatement, NewPayment, NewStatement, NewSubMeter,
    Payment, PaymentChanges, StatementChanges, StatementQuery, SubMeter, SubMeterChanges,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::store::{LedgerStore, LedgerTransaction};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const STATEMENT_COLUMNS: &str = "statement_id, owner_id, period_date, total_usage, balance, \
     status, pay_per_unit, main_payment_id, version, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, amount, payment_date, created_utc, updated_utc";

const SUB_METER_COLUMNS: &str = "sub_meter_id, statement_id, label, reading, previous_reading, \
     incremental_usage, payment_id, created_utc, updated_utc";

#[derive(Debug, FromRow)]
struct StatementRow {
    statement_id: Uuid,
    owner_id: Uuid,
    period_date: NaiveDate,
    total_usage: i64,
    balance: Decimal,
    status: String,
    pay_per_unit: Decimal,
    main_payment_id: Uuid,
    version: i32,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<StatementRow> for BillingStatement {
    type Error = BillingError;

    fn try_from(row: StatementRow) -> Result<Self, Self::Error> {
        let status = BillingStatus::from_db(&row.status).ok_or_else(|| {
            BillingError::reference(format!(
                "Billing statement {} has unknown status '{}'",
                row.statement_id, row.status
            ))
        })?;

        Ok(Self {
            statement_id: row.statement_id,
            owner_id: row.owner_id,
            period_date: row.period_date,
            total_usage: row.total_usage,
            balance: row.balance,
            status,
            pay_per_unit: row.pay_per_unit,
            main_payment_id: row.main_payment_id,
            version: row.version,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

fn into_statements(rows: Vec<StatementRow>) -> Result<Vec<BillingStatement>, BillingError> {
    rows.into_iter().map(BillingStatement::try_from).collect()
}

/// Map a failed write, keeping constraint violations apart from outages.
fn write_error(context: &str, e: sqlx::Error) -> BillingError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            BillingError::Conflict(format!("{}: row already exists", context))
        }
        sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
            BillingError::reference(format!("{}: referenced row is missing", context))
        }
        sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
            BillingError::validation(format!("{}: value out of range", context))
        }
        _ => BillingError::infrastructure(context, e),
    }
}

/// Attach sub meters and payments to loaded statements, keeping their order.
async fn extend_statements(
    conn: &mut PgConnection,
    statements: Vec<BillingStatement>,
) -> Result<Vec<ExtendedStatement>, BillingError> {
    if statements.is_empty() {
        return Ok(Vec::new());
    }

    let statement_ids: Vec<Uuid> = statements.iter().map(|s| s.statement_id).collect();
    let sub_meters = sqlx::query_as::<_, SubMeter>(&format!(
        "SELECT {} FROM sub_meters WHERE statement_id = ANY($1)",
        SUB_METER_COLUMNS
    ))
    .bind(&statement_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::infrastructure("Failed to load sub meters", e))?;

    let payment_ids: Vec<Uuid> = statements
        .iter()
        .map(|s| s.main_payment_id)
        .chain(sub_meters.iter().map(|s| s.payment_id))
        .collect();
    let payments: HashMap<Uuid, Payment> = sqlx::query_as::<_, Payment>(&format!(
        "SELECT {} FROM payments WHERE payment_id = ANY($1)",
        PAYMENT_COLUMNS
    ))
    .bind(&payment_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::infrastructure("Failed to load payments", e))?
    .into_iter()
    .map(|p| (p.payment_id, p))
    .collect();

    let mut by_statement: HashMap<Uuid, Vec<SubMeter>> = HashMap::new();
    for sub_meter in sub_meters {
        by_statement
            .entry(sub_meter.statement_id)
            .or_default()
            .push(sub_meter);
    }

    Ok(statements
        .into_iter()
        .map(|statement| {
            let sub_meters = by_statement
                .remove(&statement.statement_id)
                .unwrap_or_default();
            ExtendedStatement::from_parts(statement, sub_meters, |id| payments.get(&id).cloned())
        })
        .collect())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "utility-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), BillingError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::infrastructure("Health check failed", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, BillingError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::infrastructure("Failed to begin transaction", e))?;
        Ok(Box::new(PgLedgerTransaction { tx }))
    }

    #[instrument(skip(self, query), fields(owner_id = %owner_id))]
    async fn list_statements(
        &self,
        owner_id: Uuid,
        query: &StatementQuery,
    ) -> Result<Vec<ExtendedStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_statements"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| BillingError::infrastructure("Failed to acquire connection", e))?;

        let rows = sqlx::query_as::<_, StatementRow>(&format!(
            r#"
            SELECT {}
            FROM billing_statements
            WHERE owner_id = $1
              AND ($2::date IS NULL OR period_date >= $2)
              AND ($3::date IS NULL OR period_date <= $3)
              AND ($4::uuid IS NULL OR (period_date, created_utc, statement_id) < (
                    SELECT period_date, created_utc, statement_id
                    FROM billing_statements
                    WHERE owner_id = $1 AND statement_id = $4))
            ORDER BY period_date DESC, created_utc DESC, statement_id DESC
            LIMIT $5
            "#,
            STATEMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(query.filter.from)
        .bind(query.filter.to)
        .bind(query.after)
        .bind(query.limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| BillingError::infrastructure("Failed to list billing statements", e))?;

        let statements = extend_statements(&mut conn, into_statements(rows)?).await?;

        timer.observe_duration();

        Ok(statements)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    async fn get_statement(
        &self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<ExtendedStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_statement"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| BillingError::infrastructure("Failed to acquire connection", e))?;

        let row = sqlx::query_as::<_, StatementRow>(&format!(
            "SELECT {} FROM billing_statements WHERE owner_id = $1 AND statement_id = $2",
            STATEMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(statement_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| BillingError::infrastructure("Failed to get billing statement", e))?;

        let statement = match row {
            Some(row) => extend_statements(&mut conn, vec![row.try_into()?])
                .await?
                .pop(),
            None => None,
        };

        timer.observe_duration();

        Ok(statement)
    }
}

/// An open PostgreSQL transaction. Dropped without commit, it rolls back.
struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    #[instrument(skip(self), fields(owner_id = %owner_id, date = %date))]
    async fn latest_statement_on_or_before(
        &mut self,
        owner_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<Option<ExtendedStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_statement"])
            .start_timer();

        let row = sqlx::query_as::<_, StatementRow>(&format!(
            r#"
            SELECT {}
            FROM billing_statements
            WHERE owner_id = $1
              AND period_date <= $2
              AND ($3::uuid IS NULL OR statement_id <> $3)
            ORDER BY period_date DESC, created_utc DESC, statement_id DESC
            LIMIT 1
            "#,
            STATEMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(date)
        .bind(exclude)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::infrastructure("Failed to load baseline statement", e))?;

        let statement = match row {
            Some(row) => extend_statements(&mut self.tx, vec![row.try_into()?])
                .await?
                .pop(),
            None => None,
        };

        timer.observe_duration();

        Ok(statement)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    async fn lock_statement(
        &mut self,
        owner_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<ExtendedStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_statement"])
            .start_timer();

        let row = sqlx::query_as::<_, StatementRow>(&format!(
            "SELECT {} FROM billing_statements WHERE owner_id = $1 AND statement_id = $2 FOR UPDATE",
            STATEMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(statement_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::infrastructure("Failed to lock billing statement", e))?;

        let statement = match row {
            Some(row) => extend_statements(&mut self.tx, vec![row.try_into()?])
                .await?
                .pop(),
            None => None,
        };

        timer.observe_duration();

        Ok(statement)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let row = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, amount, payment_date)
            VALUES ($1, $2, $3)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(payment.amount)
        .bind(payment.payment_date)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| write_error("Failed to insert payment", e))?;

        timer.observe_duration();

        Ok(row)
    }

    async fn update_payment(
        &mut self,
        payment_id: Uuid,
        changes: &PaymentChanges,
    ) -> Result<Option<Payment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payment"])
            .start_timer();

        let row = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET amount = COALESCE($2, amount),
                payment_date = COALESCE($3, payment_date),
                updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(changes.amount)
        .bind(changes.payment_date)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| write_error("Failed to update payment", e))?;

        timer.observe_duration();

        Ok(row)
    }

    async fn delete_payments(&mut self, payment_ids: &[Uuid]) -> Result<u64, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_payments"])
            .start_timer();

        let result = sqlx::query("DELETE FROM payments WHERE payment_id = ANY($1)")
            .bind(payment_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| write_error("Failed to delete payments", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    async fn insert_statement(
        &mut self,
        statement: &NewStatement,
    ) -> Result<BillingStatement, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_statement"])
            .start_timer();

        let row = sqlx::query_as::<_, StatementRow>(&format!(
            r#"
            INSERT INTO billing_statements
                (statement_id, owner_id, period_date, total_usage, balance, status, pay_per_unit, main_payment_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            STATEMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(statement.owner_id)
        .bind(statement.period_date)
        .bind(statement.total_usage)
        .bind(statement.balance)
        .bind(statement.status.as_str())
        .bind(statement.pay_per_unit)
        .bind(statement.main_payment_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| write_error("Failed to insert billing statement", e))?;

        timer.observe_duration();

        row.try_into()
    }

    async fn update_statement(
        &mut self,
        statement_id: Uuid,
        changes: &StatementChanges,
    ) -> Result<Option<BillingStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_statement"])
            .start_timer();

        let row = sqlx::query_as::<_, StatementRow>(&format!(
            r#"
            UPDATE billing_statements
            SET period_date = COALESCE($2, period_date),
                total_usage = COALESCE($3, total_usage),
                balance = COALESCE($4, balance),
                status = COALESCE($5, status),
                pay_per_unit = COALESCE($6, pay_per_unit),
                version = version + 1,
                updated_utc = NOW()
            WHERE statement_id = $1
            RETURNING {}
            "#,
            STATEMENT_COLUMNS
        ))
        .bind(statement_id)
        .bind(changes.period_date)
        .bind(changes.total_usage)
        .bind(changes.balance)
        .bind(changes.status.map(|s| s.as_str()))
        .bind(changes.pay_per_unit)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| write_error("Failed to update billing statement", e))?;

        timer.observe_duration();

        row.map(BillingStatement::try_from).transpose()
    }

    async fn delete_statement(&mut self, statement_id: Uuid) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_statement"])
            .start_timer();

        let result = sqlx::query("DELETE FROM billing_statements WHERE statement_id = $1")
            .bind(statement_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| write_error("Failed to delete billing statement", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    async fn insert_sub_meter(&mut self, sub_meter: &NewSubMeter) -> Result<SubMeter, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_sub_meter"])
            .start_timer();

        let row = sqlx::query_as::<_, SubMeter>(&format!(
            r#"
            INSERT INTO sub_meters
                (sub_meter_id, statement_id, label, reading, previous_reading, incremental_usage, payment_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            SUB_METER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(sub_meter.statement_id)
        .bind(&sub_meter.label)
        .bind(sub_meter.reading)
        .bind(sub_meter.previous_reading)
        .bind(sub_meter.incremental_usage)
        .bind(sub_meter.payment_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| write_error("Failed to insert sub meter", e))?;

        timer.observe_duration();

        Ok(row)
    }

    async fn update_sub_meter(
        &mut self,
        sub_meter_id: Uuid,
        changes: &SubMeterChanges,
    ) -> Result<Option<SubMeter>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_sub_meter"])
            .start_timer();

        let row = sqlx::query_as::<_, SubMeter>(&format!(
            r#"
            UPDATE sub_meters
            SET label = COALESCE($2, label),
                reading = COALESCE($3, reading),
                incremental_usage = COALESCE($4, incremental_usage),
                previous_reading = COALESCE($5, previous_reading),
                updated_utc = NOW()
            WHERE sub_meter_id = $1
            RETURNING {}
            "#,
            SUB_METER_COLUMNS
        ))
        .bind(sub_meter_id)
        .bind(changes.label.as_deref())
        .bind(changes.reading)
        .bind(changes.incremental_usage)
        .bind(changes.previous_reading)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| write_error("Failed to update sub meter", e))?;

        timer.observe_duration();

        Ok(row)
    }

    async fn delete_sub_meters(&mut self, sub_meter_ids: &[Uuid]) -> Result<u64, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_sub_meters"])
            .start_timer();

        let result = sqlx::query("DELETE FROM sub_meters WHERE sub_meter_id = ANY($1)")
            .bind(sub_meter_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| write_error("Failed to delete sub meters", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), BillingError> {
        self.tx
            .commit()
            .await
            .map_err(|e| write_error("Failed to commit transaction", e))
    }
}
