//! The task lifecycle manager.
//!
//! Tasks stage in `mnt_ongoing_tasks` until their end time appears, then
//! move to the completed table and leave the staging table in one step. A
//! periodic sweep clears staging rows whose completion signal was missed so
//! the table cannot grow without bound.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use robofleet_store_core::{RecordBatch, StoreError, TelemetryStore};
use robofleet_types::Row;

/// Default maximum age of an ongoing row before the sweep removes it.
pub const DEFAULT_ONGOING_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Counters from applying one batch of task rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleSummary {
    /// Rows upserted into the ongoing staging table.
    pub ongoing_upserted: usize,
    /// Rows promoted into the completed table.
    pub completed_promoted: usize,
}

/// Applies task rows to the two-table lifecycle.
pub struct TaskLifecycleManager {
    store: Arc<dyn TelemetryStore>,
}

impl TaskLifecycleManager {
    /// Creates a manager over the store.
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Applies a batch of task rows for one database: ongoing rows upsert
    /// into the staging table, completed rows promote (upsert + staging
    /// delete, one transaction per batch).
    pub async fn apply(
        &self,
        database: &str,
        rows: Vec<Row>,
    ) -> Result<LifecycleSummary, StoreError> {
        let (completed, ongoing): (Vec<Row>, Vec<Row>) = rows
            .into_iter()
            .partition(|row| !matches!(row.get("ended_at"), None | Some(Value::Null)));

        let summary = LifecycleSummary {
            ongoing_upserted: ongoing.len(),
            completed_promoted: completed.len(),
        };

        if !ongoing.is_empty() {
            self.store
                .upsert_batch(&RecordBatch::new(database, "mnt_ongoing_tasks", ongoing))
                .await?;
        }
        if !completed.is_empty() {
            self.store.promote_completed_tasks(database, &completed).await?;
        }

        debug!(
            database,
            ongoing = summary.ongoing_upserted,
            completed = summary.completed_promoted,
            "task lifecycle applied"
        );
        Ok(summary)
    }

    /// Removes staging rows whose serial left the tenant catalog or whose
    /// age exceeds `max_age_secs`, assuming their completion signal was
    /// missed. Returns the number of rows removed.
    pub async fn sweep(
        &self,
        database: &str,
        known_serials: &[String],
        max_age_secs: i64,
        now: i64,
    ) -> Result<u64, StoreError> {
        let cutoff = now - max_age_secs;
        let removed = self.store.sweep_ongoing_tasks(database, known_serials, cutoff).await?;
        if removed > 0 {
            info!(database, removed, "swept stale ongoing tasks");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robofleet_store_sqlite::SqliteStore;
    use serde_json::json;

    fn task_row(serial: &str, name: &str, started: i64, ended: Option<i64>) -> Row {
        let mut row: Row = [
            ("serial".to_string(), json!(serial)),
            ("task_id".to_string(), json!("t-1")),
            ("task_name".to_string(), json!(name)),
            ("started_at".to_string(), json!(started)),
            ("status".to_string(), json!(if ended.is_some() { "completed" } else { "in_progress" })),
            ("vendor".to_string(), json!("pudu")),
        ]
        .into_iter()
        .collect();
        row.insert("ended_at".to_string(), ended.map(|e| json!(e)).unwrap_or(Value::Null));
        row
    }

    fn key(serial: &str, name: &str, started: i64) -> Row {
        [
            ("serial".to_string(), json!(serial)),
            ("task_name".to_string(), json!(name)),
            ("started_at".to_string(), json!(started)),
        ]
        .into_iter()
        .collect()
    }

    async fn manager() -> (TaskLifecycleManager, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory(&["tenantA".to_string()]).await.unwrap());
        (TaskLifecycleManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn ongoing_rows_stage_and_completed_rows_promote() {
        let (manager, store) = manager().await;
        let summary = manager
            .apply(
                "tenantA",
                vec![
                    task_row("R1", "Lobby", 100, None),
                    task_row("R1", "Atrium", 50, Some(90)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary, LifecycleSummary { ongoing_upserted: 1, completed_promoted: 1 });

        assert!(store
            .get_by_primary_key("tenantA", "mnt_ongoing_tasks", &key("R1", "Lobby", 100))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_by_primary_key("tenantA", "robot_tasks", &key("R1", "Atrium", 50))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn completion_replaces_the_staged_row() {
        let (manager, store) = manager().await;
        manager.apply("tenantA", vec![task_row("R1", "Lobby", 100, None)]).await.unwrap();
        manager.apply("tenantA", vec![task_row("R1", "Lobby", 100, Some(200))]).await.unwrap();

        let task_key = key("R1", "Lobby", 100);
        assert!(store
            .get_by_primary_key("tenantA", "mnt_ongoing_tasks", &task_key)
            .await
            .unwrap()
            .is_none());
        let completed = store
            .get_by_primary_key("tenantA", "robot_tasks", &task_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.get("ended_at"), Some(&json!(200)));
    }

    #[tokio::test]
    async fn sweep_uses_age_and_catalog_membership() {
        let (manager, store) = manager().await;
        let now = 1_700_000_000;
        manager
            .apply(
                "tenantA",
                vec![
                    task_row("R1", "Fresh", now - 60, None),
                    task_row("R1", "Stale", now - DEFAULT_ONGOING_MAX_AGE_SECS - 1, None),
                    task_row("R-GONE", "Orphan", now - 60, None),
                ],
            )
            .await
            .unwrap();

        let removed = manager
            .sweep("tenantA", &["R1".to_string()], DEFAULT_ONGOING_MAX_AGE_SECS, now)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store
            .get_by_primary_key("tenantA", "mnt_ongoing_tasks", &key("R1", "Fresh", now - 60))
            .await
            .unwrap()
            .is_some());
    }
}
