#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-store-sqlite** – SQLite storage driver for robofleet.
//!
//! One database file per tenant under a data directory, opened into one
//! `sqlx` pool each. The driver provides the idempotent upsert contract of
//! the persistence writer: batches apply as one transaction per
//! (database, table), rows update only the columns they carry, oversized
//! batches are split, and transient failures are retried with the standard
//! backoff. A per-(database, table) async lock serializes writers to the
//! same table while leaving writers to different tables concurrent.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::query::Query;
use sqlx::{Row as SqlxRow, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use robofleet_store_core::{
    schema_for, Column, ColumnType, RecordBatch, StoreError, TableSchema, TelemetryStore,
};
use robofleet_types::{BackoffPolicy, DatabaseId, Row};

/// Upper bound on rows per transaction; larger batches are split.
const MAX_BATCH_ROWS: usize = 1000;

//─────────────────────────────
//  SQLite store
//─────────────────────────────

/// Multi-tenant SQLite store.
#[derive(Debug)]
pub struct SqliteStore {
    pools: DashMap<DatabaseId, SqlitePool>,
    table_locks: DashMap<(DatabaseId, String), Arc<Mutex<()>>>,
    backoff: BackoffPolicy,
}

impl SqliteStore {
    /// Opens (creating if missing) one database file per tenant database
    /// under `data_dir` and runs the fixed-schema migration on each.
    pub async fn open(data_dir: impl AsRef<Path>, databases: &[DatabaseId]) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let store = Self::empty();
        for database in databases {
            let options = SqliteConnectOptions::new()
                .filename(data_dir.join(format!("{database}.db")))
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new().connect_with(options).await?;
            migrate(&pool).await?;
            store.pools.insert(database.clone(), pool);
        }
        debug!(databases = databases.len(), "sqlite store opened");
        Ok(store)
    }

    /// Opens one in-memory database per tenant database. Useful for tests;
    /// the single-connection pool keeps each `:memory:` database coherent.
    pub async fn in_memory(databases: &[DatabaseId]) -> anyhow::Result<Self> {
        let store = Self::empty();
        for database in databases {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?;
            migrate(&pool).await?;
            store.pools.insert(database.clone(), pool);
        }
        Ok(store)
    }

    fn empty() -> Self {
        Self {
            pools: DashMap::new(),
            table_locks: DashMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Closes every pool.
    pub async fn close(&self) {
        for entry in self.pools.iter() {
            entry.value().close().await;
        }
    }

    fn pool(&self, database: &str) -> Result<SqlitePool, StoreError> {
        self.pools
            .get(database)
            .map(|p| p.clone())
            .ok_or_else(|| StoreError::UnknownDatabase(database.to_string()))
    }

    /// The serialization lock for one (database, table).
    fn lock_for(&self, database: &str, table: &str) -> Arc<Mutex<()>> {
        self.table_locks
            .entry((database.to_string(), table.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Applies one chunk of rows inside a single transaction, retrying
    /// transient failures with the standard backoff.
    async fn apply_chunk(
        &self,
        pool: &SqlitePool,
        schema: &TableSchema,
        rows: &[Row],
    ) -> Result<(), StoreError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_apply_chunk(pool, schema, rows).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && self.backoff.allows_retry(attempts) => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        table = schema.name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient write failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_apply_chunk(
        &self,
        pool: &SqlitePool,
        schema: &TableSchema,
        rows: &[Row],
    ) -> Result<(), StoreError> {
        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;
        for row in rows {
            let plan = UpsertPlan::build(schema, row)?;
            let mut query = sqlx::query(&plan.sql);
            for (column, value) in &plan.bindings {
                query = bind_value(query, column, value)?;
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_err)?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }
}

//─────────────────────────────
//  Trait implementation
//─────────────────────────────

#[async_trait]
impl TelemetryStore for SqliteStore {
    async fn upsert_batch(&self, batch: &RecordBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let schema = schema_for(&batch.table)
            .ok_or_else(|| StoreError::UnknownTable(batch.table.clone()))?;
        let pool = self.pool(&batch.database)?;

        let lock = self.lock_for(&batch.database, &batch.table);
        let _guard = lock.lock().await;

        for chunk in batch.rows.chunks(MAX_BATCH_ROWS) {
            self.apply_chunk(&pool, schema, chunk).await?;
        }
        debug!(
            database = %batch.database,
            table = %batch.table,
            rows = batch.rows.len(),
            "batch upserted"
        );
        Ok(())
    }

    async fn get_by_primary_key(
        &self,
        database: &str,
        table: &str,
        key: &Row,
    ) -> Result<Option<Row>, StoreError> {
        let schema =
            schema_for(table).ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let pool = self.pool(database)?;

        let mut sql = format!("SELECT {} FROM {} WHERE ", column_list(schema), schema.name);
        let mut bindings: Vec<(&Column, Value)> = Vec::new();
        for (i, key_column) in schema.primary_key.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            sql.push_str(key_column);
            sql.push_str(" = ?");
            let column = schema
                .column(key_column)
                .ok_or_else(|| StoreError::Backend(format!("schema lacks {key_column}")))?;
            let value = key.get(*key_column).cloned().ok_or_else(|| {
                StoreError::Constraint(format!("lookup key misses column {key_column}"))
            })?;
            bindings.push((column, value));
        }

        let mut query = sqlx::query(&sql);
        for (column, value) in &bindings {
            query = bind_value(query, column, value)?;
        }
        let row = query.fetch_optional(&pool).await.map_err(map_sqlx_err)?;
        row.map(|r| row_from_sqlite(schema, &r)).transpose()
    }

    async fn promote_completed_tasks(
        &self,
        database: &str,
        rows: &[Row],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let completed = schema_for("robot_tasks")
            .ok_or_else(|| StoreError::UnknownTable("robot_tasks".to_string()))?;
        let pool = self.pool(database)?;

        // Fixed acquisition order keeps concurrent promoters deadlock-free.
        let completed_lock = self.lock_for(database, "robot_tasks");
        let ongoing_lock = self.lock_for(database, "mnt_ongoing_tasks");
        let _completed_guard = completed_lock.lock().await;
        let _ongoing_guard = ongoing_lock.lock().await;

        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;
        for row in rows {
            let plan = UpsertPlan::build(completed, row)?;
            let mut query = sqlx::query(&plan.sql);
            for (column, value) in &plan.bindings {
                query = bind_value(query, column, value)?;
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_err)?;

            let mut delete = sqlx::query(
                "DELETE FROM mnt_ongoing_tasks WHERE serial = ? AND task_name = ? AND started_at = ?",
            );
            for key_column in completed.primary_key {
                let column = completed
                    .column(key_column)
                    .ok_or_else(|| StoreError::Backend(format!("schema lacks {key_column}")))?;
                let value = row.get(*key_column).cloned().ok_or_else(|| {
                    StoreError::Constraint(format!("task row misses key column {key_column}"))
                })?;
                delete = bind_value(delete, column, &value)?;
            }
            delete.execute(&mut *tx).await.map_err(map_sqlx_err)?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        debug!(database, rows = rows.len(), "completed tasks promoted");
        Ok(())
    }

    async fn sweep_ongoing_tasks(
        &self,
        database: &str,
        known_serials: &[String],
        cutoff: i64,
    ) -> Result<u64, StoreError> {
        let pool = self.pool(database)?;
        let lock = self.lock_for(database, "mnt_ongoing_tasks");
        let _guard = lock.lock().await;

        let mut sql = String::from("DELETE FROM mnt_ongoing_tasks WHERE started_at < ?");
        if known_serials.is_empty() {
            // With no known serials every ongoing row is orphaned.
            sql.push_str(" OR 1 = 1");
        } else {
            let placeholders = vec!["?"; known_serials.len()].join(", ");
            sql.push_str(&format!(" OR serial NOT IN ({placeholders})"));
        }

        let mut query = sqlx::query(&sql).bind(cutoff);
        for serial in known_serials {
            query = query.bind(serial.as_str());
        }
        let result = query.execute(&pool).await.map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn last_notification(
        &self,
        database: &str,
        serial: &str,
        trigger: &str,
    ) -> Result<Option<i64>, StoreError> {
        let pool = self.pool(database)?;
        let row = sqlx::query(
            "SELECT sent_at FROM notifications_log WHERE serial = ? AND trigger_kind = ?",
        )
        .bind(serial)
        .bind(trigger)
        .fetch_optional(&pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.map(|r| r.get::<i64, _>("sent_at")))
    }

    async fn record_notification(
        &self,
        database: &str,
        serial: &str,
        trigger: &str,
        severity: &str,
        title: &str,
        message: &str,
        sent_at: i64,
    ) -> Result<(), StoreError> {
        let pool = self.pool(database)?;
        let lock = self.lock_for(database, "notifications_log");
        let _guard = lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO notifications_log (serial, trigger_kind, severity, title, message, sent_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(serial, trigger_kind) DO UPDATE SET
                severity = excluded.severity,
                title = excluded.title,
                message = excluded.message,
                sent_at = excluded.sent_at
            "#,
        )
        .bind(serial)
        .bind(trigger)
        .bind(severity)
        .bind(title)
        .bind(message)
        .bind(sent_at)
        .execute(&pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn record_incident_report(
        &self,
        database: &str,
        report: &Row,
        timeline_entry: &Row,
    ) -> Result<(), StoreError> {
        let report_schema = schema_for("mnt_robot_event_reports")
            .ok_or_else(|| StoreError::UnknownTable("mnt_robot_event_reports".to_string()))?;
        let timeline_schema = schema_for("mnt_robot_report_timeline")
            .ok_or_else(|| StoreError::UnknownTable("mnt_robot_report_timeline".to_string()))?;
        let pool = self.pool(database)?;

        let report_lock = self.lock_for(database, "mnt_robot_event_reports");
        let timeline_lock = self.lock_for(database, "mnt_robot_report_timeline");
        let _report_guard = report_lock.lock().await;
        let _timeline_guard = timeline_lock.lock().await;

        let mut tx = pool.begin().await.map_err(map_sqlx_err)?;
        for (schema, row) in [(report_schema, report), (timeline_schema, timeline_entry)] {
            let plan = UpsertPlan::build(schema, row)?;
            let mut query = sqlx::query(&plan.sql);
            for (column, value) in &plan.bindings {
                query = bind_value(query, column, value)?;
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_err)?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }
}

//─────────────────────────────
//  SQL construction
//─────────────────────────────

/// A prepared upsert for one row: SQL text plus bindings in order.
struct UpsertPlan<'a> {
    sql: String,
    bindings: Vec<(&'a Column, Value)>,
}

impl<'a> UpsertPlan<'a> {
    /// Builds the `INSERT … ON CONFLICT DO UPDATE` statement covering
    /// exactly the columns the row carries; absent columns stay untouched
    /// on update.
    fn build(schema: &'a TableSchema, row: &Row) -> Result<Self, StoreError> {
        let mut columns: Vec<&Column> = Vec::new();
        for column in schema.columns {
            if row.contains_key(column.name) {
                columns.push(column);
            }
        }
        for key_column in schema.primary_key {
            if !row.contains_key(*key_column) {
                return Err(StoreError::Constraint(format!(
                    "row for {} misses key column {key_column}",
                    schema.name
                )));
            }
        }

        let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !schema.is_key_column(c.name))
            .map(|c| format!("{} = excluded.{}", c.name, c.name))
            .collect();

        let conflict_clause = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            schema.name,
            names.join(", "),
            placeholders,
            schema.primary_key.join(", "),
            conflict_clause,
        );

        let bindings = columns
            .into_iter()
            .map(|c| (c, row.get(c.name).cloned().unwrap_or(Value::Null)))
            .collect();
        Ok(Self { sql, bindings })
    }
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Binds one JSON value with the column's declared type.
fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    column: &Column,
    value: &Value,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, StoreError> {
    let mismatch = || {
        StoreError::Constraint(format!(
            "column {} expects {:?}, got {value}",
            column.name, column.kind
        ))
    };
    let query = match column.kind {
        ColumnType::Text => match value {
            Value::Null => query.bind(None::<String>),
            Value::String(s) => query.bind(Some(s.clone())),
            _ => return Err(mismatch()),
        },
        ColumnType::Integer => match value {
            Value::Null => query.bind(None::<i64>),
            Value::Number(n) => {
                let int = n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .ok_or_else(mismatch)?;
                query.bind(Some(int))
            }
            _ => return Err(mismatch()),
        },
        ColumnType::Real => match value {
            Value::Null => query.bind(None::<f64>),
            Value::Number(n) => query.bind(Some(n.as_f64().ok_or_else(mismatch)?)),
            _ => return Err(mismatch()),
        },
        ColumnType::Json => match value {
            Value::Null => query.bind(None::<String>),
            other => {
                let text = serde_json::to_string(other)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                query.bind(Some(text))
            }
        },
    };
    Ok(query)
}

/// Reads one SQLite row back into the shared row representation.
fn row_from_sqlite(schema: &TableSchema, row: &SqliteRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for column in schema.columns {
        let value = match column.kind {
            ColumnType::Text => row
                .try_get::<Option<String>, _>(column.name)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(column.name)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .map(|i| Value::Number(i.into()))
                .unwrap_or(Value::Null),
            ColumnType::Real => row
                .try_get::<Option<f64>, _>(column.name)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnType::Json => row
                .try_get::<Option<String>, _>(column.name)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
                .unwrap_or(Value::Null),
        };
        out.insert(column.name.to_string(), value);
    }
    Ok(out)
}

/// Runs the fixed-schema migration on one pool.
async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    for schema in robofleet_store_core::all_schemas() {
        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                let sql_type = match c.kind {
                    ColumnType::Text | ColumnType::Json => "TEXT",
                    ColumnType::Integer => "INTEGER",
                    ColumnType::Real => "REAL",
                };
                format!("{} {}", c.name, sql_type)
            })
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            schema.name,
            columns.join(", "),
            schema.primary_key.join(", "),
        );
        sqlx::query(&ddl).execute(pool).await?;
    }
    Ok(())
}

/// Classifies driver errors per the writer's failure contract.
fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            if message.contains("locked") || message.contains("busy") {
                StoreError::Transient(message)
            } else if message.contains("constraint") {
                StoreError::Constraint(message)
            } else {
                StoreError::Backend(message)
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
