#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-store-core** – Core storage abstractions for robofleet.
//!
//! This crate defines the contracts of the persistence writer without
//! providing a concrete driver: the [`TelemetryStore`] trait, the row/batch
//! model, and the fixed external table schema with its per-table primary-key
//! policy. Storage drivers (SQLite today) implement these traits in separate
//! crates that depend on this core abstraction.
//!
//! Only the persistence writer mutates the durable store; the change
//! detector reads prior state through [`TelemetryStore::get_by_primary_key`]
//! and never writes.

use async_trait::async_trait;

use robofleet_types::{DatabaseId, Row};

pub mod schema;

pub use schema::{all_schemas, schema_for, Column, ColumnType, TableSchema};

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection trouble or lock contention; worth a retried attempt.
    #[error("transient database error: {0}")]
    Transient(String),
    /// A constraint or type mismatch; retrying cannot help.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The table is not part of the fixed schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),
    /// The database id is not routed by this store.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),
    /// Any other driver failure.
    #[error("storage operation failed: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for errors the writer should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

//─────────────────────────────
//  Batches
//─────────────────────────────

/// A batch of rows sharing one target (database, table), applied as one
/// logical transaction by the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    /// Tenant database the batch routes to.
    pub database: DatabaseId,
    /// Destination table; must be part of the fixed schema.
    pub table: String,
    /// Rows keyed by column name. Columns absent from a row are left
    /// untouched when the row updates an existing one.
    pub rows: Vec<Row>,
}

impl RecordBatch {
    /// Creates a batch for one (database, table) target.
    pub fn new(database: impl Into<DatabaseId>, table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self { database: database.into(), table: table.into(), rows }
    }

    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Abstraction over the multi-tenant telemetry store.
///
/// The primary contract is the idempotent upsert: applying the same batch
/// twice is equivalent to applying it once. Reads are consistent with the
/// most recent committed write from this process.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Applies a batch as one logical transaction: rows whose primary key
    /// exists update their non-key columns, others insert. Oversized batches
    /// are split by the driver; transient errors are retried internally.
    async fn upsert_batch(&self, batch: &RecordBatch) -> Result<(), StoreError>;

    /// Fetches the row with the given primary key, or `None`.
    async fn get_by_primary_key(
        &self,
        database: &str,
        table: &str,
        key: &Row,
    ) -> Result<Option<Row>, StoreError>;

    /// Batched form of [`Self::get_by_primary_key`], one result per key in
    /// order. Drivers may override with something smarter than a loop.
    async fn get_many_by_primary_key(
        &self,
        database: &str,
        table: &str,
        keys: &[Row],
    ) -> Result<Vec<Option<Row>>, StoreError> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get_by_primary_key(database, table, key).await?);
        }
        Ok(results)
    }

    /// Promotes completed task rows: upserts each into the completed table
    /// and deletes the matching ongoing row, both inside one transaction,
    /// so a completed task never coexists with its ongoing shadow.
    async fn promote_completed_tasks(
        &self,
        database: &str,
        rows: &[Row],
    ) -> Result<(), StoreError>;

    /// Removes ongoing rows whose serial is not in `known_serials` or whose
    /// start time is before `cutoff`. Returns the number of rows removed.
    async fn sweep_ongoing_tasks(
        &self,
        database: &str,
        known_serials: &[String],
        cutoff: i64,
    ) -> Result<u64, StoreError>;

    /// Seconds-since-epoch of the most recent notification for
    /// `(serial, trigger)`, or `None`. Backs the suppression window; keeping
    /// this in the store keeps deduplication correct across restarts and
    /// across replicas.
    async fn last_notification(
        &self,
        database: &str,
        serial: &str,
        trigger: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Records a delivered notification for suppression bookkeeping.
    async fn record_notification(
        &self,
        database: &str,
        serial: &str,
        trigger: &str,
        severity: &str,
        title: &str,
        message: &str,
        sent_at: i64,
    ) -> Result<(), StoreError>;

    /// Writes the support-ticket summary row and its timeline entry for an
    /// `incident` trigger, both inside one transaction.
    async fn record_incident_report(
        &self,
        database: &str,
        report: &Row,
        timeline_entry: &Row,
    ) -> Result<(), StoreError>;
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::schema::{all_schemas, schema_for, Column, ColumnType, TableSchema};
    pub use super::{RecordBatch, StoreError, TelemetryStore};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Transient("busy".into()).is_transient());
        assert!(!StoreError::Constraint("dup".into()).is_transient());
        assert!(!StoreError::UnknownTable("x".into()).is_transient());
    }

    #[test]
    fn empty_batch_detection() {
        let batch = RecordBatch::new("tenantA", "robot_state", vec![]);
        assert!(batch.is_empty());
    }
}
