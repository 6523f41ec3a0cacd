//! SQLite-backed `AllocationStore`, fronted by a bounded `r2d2` connection
//! pool (recommended default ~25 active / ~5 idle connections) so the store
//! never becomes an accidental single point of serialization under
//! concurrent callers.
//!
//! Every operation that must be atomic (insert-or-AlreadyExists, claim-or-
//! WindowContended) runs inside a single SQLite transaction and relies on a
//! UNIQUE index for the actual coordination — see DESIGN.md.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{PipelineError, PipelineResult};
use crate::models::{Allocation, NewAllocation, Side};
use crate::store::AllocationStore;

/// SQLite allows only one writer at a time; without a busy timeout a second
/// connection that hits a write lock held by `try_insert_allocation` or
/// `try_claim_batch_window` fails immediately with `SQLITE_BUSY` instead of
/// waiting for the constraint check that should produce `AlreadyExists`/
/// `WindowContended`. Applied per-connection via `with_init` below, since
/// `PRAGMA`s in `SCHEMA_SQL` only run once against the connection used for
/// setup, not against every connection the pool later hands out.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_execution_id INTEGER NOT NULL UNIQUE,
    is_open INTEGER NOT NULL,
    status TEXT NOT NULL,
    side TEXT NOT NULL,
    destination TEXT NOT NULL,
    security_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    portfolio_id TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    quantity TEXT NOT NULL,
    limit_price TEXT,
    quantity_filled TEXT NOT NULL,
    total_amount TEXT NOT NULL,
    average_price TEXT NOT NULL,
    received_timestamp INTEGER NOT NULL,
    sent_timestamp INTEGER NOT NULL,
    last_fill_timestamp INTEGER,
    ready_to_send_timestamp INTEGER NOT NULL,
    version INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_allocations_ready_to_send
    ON allocations(ready_to_send_timestamp, id);

CREATE TABLE IF NOT EXISTS batch_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time INTEGER NOT NULL UNIQUE,
    previous_start_time INTEGER NOT NULL UNIQUE,
    version INTEGER NOT NULL
);
"#;

pub struct SqliteAllocationStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAllocationStore {
    pub fn new(path: &str, max_pool_size: u32) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));
        let pool = Pool::builder()
            .max_size(max_pool_size)
            .min_idle(Some(max_pool_size.min(5)))
            .connection_timeout(Duration::from_secs(30))
            .idle_timeout(Some(Duration::from_secs(300)))
            .build(manager)?;

        pool.get()?.execute_batch(SCHEMA_SQL)?;
        Ok(Self { pool })
    }
}

fn micros_of(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn dt_of(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
}

fn is_unique_violation(err: &rusqlite::Error, column_hint: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == ErrorCode::ConstraintViolation
                && msg
                    .as_ref()
                    .map(|m| m.contains(column_hint))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn row_to_allocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
    let side_str: String = row.get("side")?;
    let side = match side_str.as_str() {
        "BUY" => Side::Buy,
        _ => Side::Sell,
    };
    let limit_price: Option<String> = row.get("limit_price")?;
    let last_fill: Option<i64> = row.get("last_fill_timestamp")?;
    let trade_date: String = row.get("trade_date")?;

    Ok(Allocation {
        id: row.get("id")?,
        external_execution_id: row.get("external_execution_id")?,
        is_open: row.get::<_, i64>("is_open")? != 0,
        status: row.get("status")?,
        side,
        destination: row.get("destination")?,
        security_id: row.get("security_id")?,
        ticker: row.get("ticker")?,
        portfolio_id: row.get("portfolio_id")?,
        trade_date: chrono::NaiveDate::parse_from_str(&trade_date, "%Y-%m-%d")
            .unwrap_or_else(|_| chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        quantity: decimal_from_col(row, "quantity")?,
        limit_price: limit_price.and_then(|s| rust_decimal::Decimal::from_str(&s).ok()),
        quantity_filled: decimal_from_col(row, "quantity_filled")?,
        total_amount: decimal_from_col(row, "total_amount")?,
        average_price: decimal_from_col(row, "average_price")?,
        received_timestamp: dt_of(row.get("received_timestamp")?),
        sent_timestamp: dt_of(row.get("sent_timestamp")?),
        last_fill_timestamp: last_fill.map(dt_of),
        ready_to_send_timestamp: dt_of(row.get("ready_to_send_timestamp")?),
        version: row.get("version")?,
    })
}

fn decimal_from_col(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<rust_decimal::Decimal> {
    let raw: String = row.get(name)?;
    rust_decimal::Decimal::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl AllocationStore for SqliteAllocationStore {
    async fn try_insert_allocation(
        &self,
        draft: NewAllocation,
    ) -> PipelineResult<(i64, DateTime<Utc>)> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;
            let tx = conn
                .transaction()
                .map_err(|e| PipelineError::Transient(e.to_string()))?;

            let prev_max: Option<i64> = tx
                .query_row(
                    "SELECT MAX(ready_to_send_timestamp) FROM allocations",
                    [],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| PipelineError::Transient(e.to_string()))?
                .flatten();

            let mut micros = Utc::now().timestamp_micros();
            if let Some(prev) = prev_max {
                if micros <= prev {
                    micros = prev + 1;
                }
            }

            let result = tx.execute(
                "INSERT INTO allocations (
                    external_execution_id, is_open, status, side, destination,
                    security_id, ticker, portfolio_id, trade_date, quantity,
                    limit_price, quantity_filled, total_amount, average_price,
                    received_timestamp, sent_timestamp, last_fill_timestamp,
                    ready_to_send_timestamp, version
                ) VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, 1)",
                params![
                    draft.external_execution_id,
                    draft.status,
                    draft.side.as_str(),
                    draft.destination,
                    draft.security_id,
                    draft.ticker,
                    draft.portfolio_id,
                    draft.trade_date.format("%Y-%m-%d").to_string(),
                    draft.quantity.to_string(),
                    draft.limit_price.map(|d| d.to_string()),
                    draft.quantity_filled.to_string(),
                    draft.total_amount.to_string(),
                    draft.average_price.to_string(),
                    micros_of(draft.received_timestamp),
                    micros_of(draft.sent_timestamp),
                    draft.last_fill_timestamp.map(micros_of),
                    micros,
                ],
            );

            match result {
                Ok(_) => {
                    let id = tx.last_insert_rowid();
                    tx.commit()
                        .map_err(|e| PipelineError::Transient(e.to_string()))?;
                    Ok((id, dt_of(micros)))
                }
                Err(e) if is_unique_violation(&e, "external_execution_id") => {
                    Err(PipelineError::AlreadyExists)
                }
                Err(e) => Err(PipelineError::Transient(e.to_string())),
            }
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn find_by_external_execution_id(
        &self,
        external_execution_id: i64,
    ) -> PipelineResult<Allocation> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;
            conn.query_row(
                "SELECT * FROM allocations WHERE external_execution_id = ?1",
                params![external_execution_id],
                row_to_allocation,
            )
            .optional()
            .map_err(|e| PipelineError::Transient(e.to_string()))?
            .ok_or(PipelineError::NotFound)
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn find_by_id(&self, id: i64) -> PipelineResult<Allocation> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;
            conn.query_row(
                "SELECT * FROM allocations WHERE id = ?1",
                params![id],
                row_to_allocation,
            )
            .optional()
            .map_err(|e| PipelineError::Transient(e.to_string()))?
            .ok_or(PipelineError::NotFound)
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn list_paged(&self, limit: i64, offset: i64) -> PipelineResult<(Vec<Allocation>, i64)> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;

            let total: i64 = conn
                .query_row("SELECT COUNT(*) FROM allocations", [], |r| r.get(0))
                .map_err(|e| PipelineError::Transient(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT * FROM allocations ORDER BY id ASC LIMIT ?1 OFFSET ?2",
                )
                .map_err(|e| PipelineError::Transient(e.to_string()))?;
            let rows = stmt
                .query_map(params![limit, offset], row_to_allocation)
                .map_err(|e| PipelineError::Transient(e.to_string()))?;
            let mut page = Vec::new();
            for row in rows {
                page.push(row.map_err(|e| PipelineError::Transient(e.to_string()))?);
            }
            Ok((page, total))
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn select_for_window(
        &self,
        prev: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<Allocation>> {
        let pool = self.pool.clone();
        let (prev_micros, now_micros) = (micros_of(prev), micros_of(now));
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM allocations
                     WHERE ready_to_send_timestamp >= ?1 AND ready_to_send_timestamp < ?2
                     ORDER BY ready_to_send_timestamp ASC, id ASC",
                )
                .map_err(|e| PipelineError::Transient(e.to_string()))?;
            let rows = stmt
                .query_map(params![prev_micros, now_micros], row_to_allocation)
                .map_err(|e| PipelineError::Transient(e.to_string()))?;
            let mut selection = Vec::new();
            for row in rows {
                selection.push(row.map_err(|e| PipelineError::Transient(e.to_string()))?);
            }
            Ok(selection)
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn try_claim_batch_window(&self) -> PipelineResult<(DateTime<Utc>, DateTime<Utc>)> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;
            let tx = conn
                .transaction()
                .map_err(|e| PipelineError::Transient(e.to_string()))?;

            let prev_max: Option<i64> = tx
                .query_row("SELECT MAX(start_time) FROM batch_history", [], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(|e| PipelineError::Transient(e.to_string()))?
                .flatten();
            let prev = prev_max.unwrap_or(0); // epoch

            let mut now_micros = Utc::now().timestamp_micros();
            if now_micros <= prev {
                now_micros = prev + 1;
            }

            let result = tx.execute(
                "INSERT INTO batch_history (start_time, previous_start_time, version)
                 VALUES (?1, ?2, 1)",
                params![now_micros, prev],
            );

            match result {
                Ok(_) => {
                    tx.commit()
                        .map_err(|e| PipelineError::Transient(e.to_string()))?;
                    debug!(prev, now = now_micros, "claimed batch window");
                    Ok((dt_of(prev), dt_of(now_micros)))
                }
                Err(e)
                    if is_unique_violation(&e, "start_time")
                        || is_unique_violation(&e, "previous_start_time") =>
                {
                    warn!("batch window claim lost the race");
                    Err(PipelineError::WindowContended)
                }
                Err(e) => Err(PipelineError::Transient(e.to_string())),
            }
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn get_max_batch_start(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Transient(format!("pool exhausted: {e}")))?;
            let max: Option<i64> = conn
                .query_row("SELECT MAX(start_time) FROM batch_history", [], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(|e| PipelineError::Transient(e.to_string()))?
                .flatten();
            Ok(max.map(dt_of))
        })
        .await
        .map_err(|e| PipelineError::Fatal(format!("blocking task panicked: {e}")))?
    }
}
