//! Postgres-backed invoice store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) on `invoices` | `23505` | `AlreadyExists` | `create` with a reused id |
//! | Database (unique violation) on `invoice_transitions` | `23505` | `VersionConflict` | Two writers raced past the version check |
//! | Database (other) | Any other | `Backend` | Constraint or SQL failure |
//! | PoolClosed / IO / other | N/A | `Backend` | Connection-level failures |
//!
//! ## Thread Safety
//!
//! `PostgresInvoiceStore` is `Send + Sync`; all connection handling is the pool's.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use payrecon_core::{CustomerId, Currency, ExpectedVersion, InvoiceId, Money};
use payrecon_invoicing::{
    Invoice, InvoiceParts, InvoiceStatus, PaymentMethod, SignalSource, StatusChange,
    TransitionRecord,
};

use super::r#trait::{InvoiceStore, StoreError};
use crate::config::ReconcileConfig;

/// DDL for the two tables this store needs. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS invoices (
    invoice_id        TEXT PRIMARY KEY,
    customer_id       TEXT NOT NULL,
    amount            BIGINT NOT NULL CHECK (amount > 0),
    currency          TEXT NOT NULL,
    payment_method    TEXT,
    status            TEXT NOT NULL,
    gateway_reference TEXT,
    order_reference   TEXT,
    version           BIGINT NOT NULL CHECK (version >= 1),
    created_at        TIMESTAMPTZ NOT NULL,
    expires_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS invoices_customer_idx ON invoices (customer_id, created_at DESC);
CREATE INDEX IF NOT EXISTS invoices_gateway_reference_idx ON invoices (gateway_reference);
CREATE INDEX IF NOT EXISTS invoices_order_reference_idx ON invoices (order_reference, created_at DESC);
CREATE INDEX IF NOT EXISTS invoices_open_idx ON invoices (expires_at)
    WHERE status IN ('pending', 'awaiting_confirmation');

CREATE TABLE IF NOT EXISTS invoice_transitions (
    invoice_id       TEXT NOT NULL REFERENCES invoices (invoice_id),
    version          BIGINT NOT NULL,
    from_status      TEXT NOT NULL,
    to_status        TEXT NOT NULL,
    source           TEXT NOT NULL,
    source_reference TEXT,
    reason           TEXT NOT NULL,
    applied_at       TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (invoice_id, version)
);
"#;

const INVOICE_COLUMNS: &str = "invoice_id, customer_id, amount, currency, payment_method, status, \
     gateway_reference, order_reference, version, created_at, expires_at, updated_at";

/// Postgres-backed invoice store.
///
/// `conditional_update` runs one transaction:
/// 1. `UPDATE invoices ... WHERE invoice_id = $1 AND version = $expected RETURNING version`
/// 2. `INSERT INTO invoice_transitions` at the returned version
/// 3. commit
///
/// Zero rows from step 1 means the version moved (or the invoice is gone); the
/// transaction is dropped and nothing is written. The `(invoice_id, version)`
/// primary key on the history table is a second line against double writes.
#[derive(Debug, Clone)]
pub struct PostgresInvoiceStore {
    pool: Arc<PgPool>,
}

impl PostgresInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small default pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Connect to `DATABASE_URL` and create the schema if missing.
    pub async fn from_config(config: &ReconcileConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::backend("DATABASE_URL is not set"))?;
        let store = Self::connect(url).await?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_invoices(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Invoice>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(invoice_from_row).collect()
    }

    async fn current_version(&self, invoice_id: &InvoiceId) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT version FROM invoices WHERE invoice_id = $1")
            .bind(invoice_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;
        row.map(|r| {
            r.try_get::<i64, _>("version")
                .map_err(|e| StoreError::backend(format!("failed to read version: {e}")))
                .and_then(|v| from_bigint("version", v))
        })
        .transpose()
    }
}

#[async_trait]
impl InvoiceStore for PostgresInvoiceStore {
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id()), err)]
    async fn create(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let parts = invoice.clone().into_parts();
        let amount = to_bigint("amount", parts.total.amount)?;
        let version = to_bigint("version", parts.version)?;
        sqlx::query(&format!(
            "INSERT INTO invoices ({INVOICE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(parts.invoice_id.as_str())
        .bind(parts.customer_id.as_str())
        .bind(amount)
        .bind(parts.total.currency.code())
        .bind(parts.payment_method.map(PaymentMethod::as_str))
        .bind(parts.status.as_str())
        .bind(parts.gateway_reference.as_deref())
        .bind(parts.order_reference.as_deref())
        .bind(version)
        .bind(parts.created_at)
        .bind(parts.expires_at)
        .bind(parts.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(parts.invoice_id.clone())
            } else {
                map_sqlx_error("create", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn load(&self, invoice_id: &InvoiceId) -> Result<Invoice, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1"
        ))
        .bind(invoice_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        match row {
            Some(row) => invoice_from_row(&row),
            None => Err(StoreError::NotFound(invoice_id.clone())),
        }
    }

    #[instrument(
        skip(self, change, record),
        fields(invoice_id = %invoice_id, expected_version = ?expected_version, to_status = %change.to_status),
        err
    )]
    async fn conditional_update(
        &self,
        invoice_id: &InvoiceId,
        expected_version: ExpectedVersion,
        change: &StatusChange,
        record: &TransitionRecord,
    ) -> Result<u64, StoreError> {
        let expected = match expected_version {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(to_bigint("version", v)?),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $3,
                gateway_reference = COALESCE(gateway_reference, $4),
                payment_method = COALESCE($5, payment_method),
                updated_at = $6,
                version = version + 1
            WHERE invoice_id = $1 AND ($2::BIGINT IS NULL OR version = $2)
            RETURNING version
            "#,
        )
        .bind(invoice_id.as_str())
        .bind(expected)
        .bind(change.to_status.as_str())
        .bind(change.gateway_reference.as_deref())
        .bind(change.payment_method.map(PaymentMethod::as_str))
        .bind(change.at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_invoice", e))?;

        let Some(updated) = updated else {
            // Dropping `tx` rolls back; nothing was written.
            drop(tx);
            return match self.current_version(invoice_id).await? {
                None => Err(StoreError::NotFound(invoice_id.clone())),
                Some(actual) => {
                    debug!(actual, "version moved under conditional update");
                    Err(StoreError::VersionConflict {
                        invoice_id: invoice_id.clone(),
                        expected: expected_version,
                        actual,
                    })
                }
            };
        };

        let new_version: i64 = updated
            .try_get("version")
            .map_err(|e| StoreError::backend(format!("failed to read version: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO invoice_transitions (
                invoice_id, version, from_status, to_status,
                source, source_reference, reason, applied_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(invoice_id.as_str())
        .bind(new_version)
        .bind(record.from_status.as_str())
        .bind(record.to_status.as_str())
        .bind(record.source.as_str())
        .bind(record.source_reference.as_deref())
        .bind(&record.reason)
        .bind(record.applied_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::VersionConflict {
                    invoice_id: invoice_id.clone(),
                    expected: expected_version,
                    actual: new_version.unsigned_abs(),
                }
            } else {
                map_sqlx_error("insert_transition", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        from_bigint("version", new_version)
    }

    #[instrument(skip(self), err)]
    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE gateway_reference = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut found = self
            .fetch_invoices(
                "find_by_gateway_reference",
                sqlx::query(&sql).bind(gateway_reference),
            )
            .await?;
        Ok(found.pop())
    }

    #[instrument(skip(self), fields(customer_id = %customer_id), err)]
    async fn list_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Invoice>, StoreError> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE customer_id = $1 ORDER BY created_at DESC"
        );
        self.fetch_invoices(
            "list_by_customer",
            sqlx::query(&sql).bind(customer_id.as_str()),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<Invoice>, StoreError> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE order_reference = $1 \
             ORDER BY created_at DESC"
        );
        self.fetch_invoices(
            "list_by_order_reference",
            sqlx::query(&sql).bind(order_reference),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_open(&self) -> Result<Vec<Invoice>, StoreError> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE status IN ('pending', 'awaiting_confirmation') ORDER BY expires_at ASC"
        );
        self.fetch_invoices("list_open", sqlx::query(&sql)).await
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn history(&self, invoice_id: &InvoiceId) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.invoice_id, t.version, t.from_status, t.to_status,
                   t.source, t.source_reference, t.reason, t.applied_at,
                   i.order_reference
            FROM invoice_transitions t
            JOIN invoices i ON i.invoice_id = t.invoice_id
            WHERE t.invoice_id = $1
            ORDER BY t.version ASC
            "#,
        )
        .bind(invoice_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        rows.iter().map(record_from_row).collect()
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::backend(format!("failed to read column {name}: {e}")))
}

fn parse<T>(name: &str, value: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::backend(format!("corrupt {name} '{value}': {e}")))
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, StoreError> {
    let amount: i64 = column(row, "amount")?;
    let currency: String = column(row, "currency")?;
    let amount = from_bigint("amount", amount)?;
    let total = Currency::parse(&currency)
        .and_then(|currency| Money::new(amount, currency))
        .map_err(|e| StoreError::backend(format!("corrupt amount: {e}")))?;

    let payment_method: Option<String> = column(row, "payment_method")?;
    let status: String = column(row, "status")?;
    let invoice_id: String = column(row, "invoice_id")?;
    let customer_id: String = column(row, "customer_id")?;
    let version: i64 = column(row, "version")?;

    Ok(Invoice::restore(InvoiceParts {
        invoice_id: parse("invoice_id", &invoice_id)?,
        customer_id: parse("customer_id", &customer_id)?,
        total,
        payment_method: payment_method
            .as_deref()
            .map(|m| parse("payment_method", m))
            .transpose()?,
        status: parse("status", &status)?,
        gateway_reference: column(row, "gateway_reference")?,
        order_reference: column(row, "order_reference")?,
        version: from_bigint("version", version)?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        expires_at: column::<DateTime<Utc>>(row, "expires_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    }))
}

fn record_from_row(row: &PgRow) -> Result<TransitionRecord, StoreError> {
    let invoice_id: String = column(row, "invoice_id")?;
    let from_status: String = column(row, "from_status")?;
    let to_status: String = column(row, "to_status")?;
    let source: String = column(row, "source")?;
    let version: i64 = column(row, "version")?;

    Ok(TransitionRecord {
        invoice_id: parse("invoice_id", &invoice_id)?,
        from_status: parse::<InvoiceStatus>("from_status", &from_status)?,
        to_status: parse::<InvoiceStatus>("to_status", &to_status)?,
        source: SignalSource::try_from(source)
            .map_err(|e| StoreError::backend(format!("corrupt source: {e}")))?,
        source_reference: column(row, "source_reference")?,
        reason: column(row, "reason")?,
        applied_at: column(row, "applied_at")?,
        version: from_bigint("version", version)?,
        order_reference: column(row, "order_reference")?,
    })
}

/// `BIGINT` columns hold values the domain keeps as `u64`.
fn to_bigint(name: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::validation(format!("{name} {value} exceeds the BIGINT range")))
}

fn from_bigint(name: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::backend(format!("corrupt {name} {value}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::backend(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("?"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
