//! The stage driver: normalize → detect → write → notify.
//!
//! Both ingestion flows share this path. Records are grouped by tenant
//! database, processed kind by kind in the fixed order (state, tasks,
//! charging, events, locations), and notifications go out only after the
//! backing write committed. Failures contain at the smallest unit: a bad
//! record drops from its batch, a failed batch drops without its triggers,
//! and other databases proceed untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use robofleet_catalog::RoutingTable;
use robofleet_notify::{DispatchSummary, NotificationEngine};
use robofleet_store_core::{RecordBatch, TelemetryStore};
use robofleet_types::{DatabaseId, NormalizedRecord, RecordKind};

use crate::detect::ChangeDetector;
use crate::lifecycle::TaskLifecycleManager;
use crate::normalize::{NormalizeOutcome, Normalizer};

/// Kind processing order within one database.
const KIND_ORDER: [RecordKind; 5] = [
    RecordKind::State,
    RecordKind::Task,
    RecordKind::Charging,
    RecordKind::Event,
    RecordKind::Location,
];

/// Counters from one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    /// Records that passed normalization and routing.
    pub accepted: usize,
    /// Records dropped by validation, routing, or a failed batch.
    pub dropped: usize,
    /// Rows written (inserted or updated).
    pub written: usize,
    /// Records classified as no-ops.
    pub unchanged: usize,
    /// Notification outcomes.
    pub notifications: DispatchSummary,
}

impl IngestSummary {
    fn merge_notifications(&mut self, other: DispatchSummary) {
        self.notifications.sent += other.sent;
        self.notifications.suppressed += other.suppressed;
        self.notifications.failed += other.failed;
    }
}

/// The shared ingestion pipeline.
pub struct IngestPipeline {
    normalizer: Normalizer,
    detector: ChangeDetector,
    lifecycle: TaskLifecycleManager,
    store: Arc<dyn TelemetryStore>,
    notifier: Arc<NotificationEngine>,
}

impl IngestPipeline {
    /// Wires the pipeline stages over shared collaborators.
    pub fn new(
        routing: Arc<RoutingTable>,
        store: Arc<dyn TelemetryStore>,
        notifier: Arc<NotificationEngine>,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(routing),
            detector: ChangeDetector::new(store.clone()),
            lifecycle: TaskLifecycleManager::new(store.clone()),
            store,
            notifier,
        }
    }

    /// The lifecycle manager, for the poller's periodic sweep.
    pub fn lifecycle(&self) -> &TaskLifecycleManager {
        &self.lifecycle
    }

    /// Ingests one record (the webhook path).
    pub async fn ingest_one(&self, tenant: &str, record: NormalizedRecord) -> IngestSummary {
        self.ingest(tenant, vec![record]).await
    }

    /// Ingests a batch of records fetched for `tenant`.
    pub async fn ingest(&self, tenant: &str, records: Vec<NormalizedRecord>) -> IngestSummary {
        let mut summary = IngestSummary::default();

        // Normalize and group by owning database.
        let mut by_database: BTreeMap<DatabaseId, Vec<NormalizedRecord>> = BTreeMap::new();
        for record in records {
            match self.normalizer.normalize(tenant, record) {
                NormalizeOutcome::Accepted { database, record } => {
                    summary.accepted += 1;
                    by_database.entry(database).or_default().push(record);
                }
                NormalizeOutcome::Dropped => summary.dropped += 1,
            }
        }

        // Each database partition is independent; inside one, kinds process
        // in the fixed order so per-serial ordering holds.
        for (database, records) in by_database {
            for kind in KIND_ORDER {
                let batch: Vec<NormalizedRecord> =
                    records.iter().filter(|r| r.kind() == kind).cloned().collect();
                if batch.is_empty() {
                    continue;
                }
                self.process_kind(&database, kind, batch, &mut summary).await;
            }
        }
        summary
    }

    async fn process_kind(
        &self,
        database: &str,
        kind: RecordKind,
        batch: Vec<NormalizedRecord>,
        summary: &mut IngestSummary,
    ) {
        let batch_len = batch.len();
        let classified = match self.detector.classify_batch(database, batch).await {
            Ok(classified) => classified,
            Err(e) => {
                error!(database, kind = %kind, error = %e, "change detection failed, dropping batch");
                summary.dropped += batch_len;
                return;
            }
        };

        let mut rows = Vec::new();
        let mut triggers = Vec::new();
        for item in &classified {
            if item.change.requires_write() {
                rows.push(item.row.clone());
            } else {
                summary.unchanged += 1;
            }
            triggers.extend(item.triggers.iter().cloned());
        }

        if !rows.is_empty() {
            let written = rows.len();
            let result = if kind == RecordKind::Task {
                self.lifecycle.apply(database, rows).await.map(|_| ())
            } else {
                self.store
                    .upsert_batch(&RecordBatch::new(database, kind.table(), rows))
                    .await
            };
            match result {
                Ok(()) => summary.written += written,
                Err(e) => {
                    // The batch is gone; do not notify about writes that
                    // never happened.
                    error!(database, kind = %kind, error = %e, "write failed, dropping batch");
                    summary.dropped += written;
                    return;
                }
            }
        }

        if !triggers.is_empty() {
            let dispatched = self.notifier.dispatch(&triggers).await;
            summary.merge_notifications(dispatched);
        }
        debug!(database, kind = %kind, records = classified.len(), "kind batch processed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use robofleet_notify::{NotificationPayload, NotificationSink};
    use robofleet_store_sqlite::SqliteStore;
    use robofleet_types::{
        RecordPayload, RobotOperationalState, RobotState, TaskRecord, TaskStatus,
    };
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<NotificationPayload>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, payload: &NotificationPayload) -> anyhow::Result<()> {
            self.payloads.lock().await.push(payload.clone());
            Ok(())
        }
    }

    const ROUTING: &str = r#"
databases:
  tenantA: [R1]
robot_names:
  R1: "Lobby Scrubber"
"#;

    async fn pipeline() -> (IngestPipeline, Arc<SqliteStore>, Arc<RecordingSink>) {
        let store = Arc::new(SqliteStore::in_memory(&["tenantA".to_string()]).await.unwrap());
        let routing = Arc::new(RoutingTable::from_str(ROUTING).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(NotificationEngine::new(sink.clone(), store.clone(), routing.clone()));
        (IngestPipeline::new(routing, store.clone(), notifier), store, sink)
    }

    fn state(serial: &str, battery: i64) -> NormalizedRecord {
        NormalizedRecord::new(
            "pudu",
            RecordPayload::State(RobotState {
                serial: serial.to_string(),
                state: RobotOperationalState::Working,
                battery,
                pos_x: None,
                pos_y: None,
                pos_yaw: None,
                map_id: None,
                reported_at: 1_700_000_000,
            }),
        )
    }

    fn task(status: TaskStatus, ended_at: Option<i64>, actual_area: Option<f64>) -> NormalizedRecord {
        NormalizedRecord::new(
            "pudu",
            RecordPayload::Task(TaskRecord {
                serial: "R1".to_string(),
                task_id: "t-1".to_string(),
                task_name: "Floor2-Clean".to_string(),
                mode: None,
                planned_area: None,
                actual_area,
                duration_secs: None,
                water_ml: None,
                energy_wh: None,
                battery_usage: None,
                started_at: 1_700_000_000,
                ended_at,
                status,
                map_id: None,
                subtasks: None,
            }),
        )
    }

    #[tokio::test]
    async fn new_state_inserts_without_notifying() {
        let (pipeline, store, sink) = pipeline().await;
        let summary = pipeline.ingest("tenantA", vec![state("R1", 78)]).await;

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.notifications.sent, 0);

        let key = [("serial".to_string(), json!("R1"))].into_iter().collect();
        let row = store
            .get_by_primary_key("tenantA", "robot_state", &key)
            .await
            .unwrap()
            .expect("row inserted");
        assert_eq!(row.get("battery"), Some(&json!(78)));
        assert!(sink.payloads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn battery_drop_updates_and_notifies_once() {
        let (pipeline, _store, sink) = pipeline().await;
        pipeline.ingest("tenantA", vec![state("R1", 15)]).await;
        let summary = pipeline.ingest("tenantA", vec![state("R1", 9)]).await;

        assert_eq!(summary.written, 1);
        assert_eq!(summary.notifications.sent, 1);
        let payloads = sink.payloads.lock().await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].severity, "fatal");
        assert!(payloads[0].message.contains("9%"));
    }

    #[tokio::test]
    async fn replayed_record_is_idempotent() {
        let (pipeline, _store, sink) = pipeline().await;
        pipeline.ingest("tenantA", vec![state("R1", 78)]).await;
        let summary = pipeline.ingest("tenantA", vec![state("R1", 78)]).await;

        assert_eq!(summary.written, 0);
        assert_eq!(summary.unchanged, 1);
        assert!(sink.payloads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn task_completion_promotes_and_notifies() {
        let (pipeline, store, sink) = pipeline().await;
        pipeline
            .ingest("tenantA", vec![task(TaskStatus::InProgress, None, None)])
            .await;

        let summary = pipeline
            .ingest(
                "tenantA",
                vec![task(TaskStatus::Completed, Some(1_700_003_600), Some(150.5))],
            )
            .await;
        assert_eq!(summary.written, 1);
        assert_eq!(summary.notifications.sent, 1);

        let key: robofleet_types::Row = [
            ("serial".to_string(), json!("R1")),
            ("task_name".to_string(), json!("Floor2-Clean")),
            ("started_at".to_string(), json!(1_700_000_000)),
        ]
        .into_iter()
        .collect();
        assert!(store
            .get_by_primary_key("tenantA", "robot_tasks", &key)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_by_primary_key("tenantA", "mnt_ongoing_tasks", &key)
            .await
            .unwrap()
            .is_none());

        let payloads = sink.payloads.lock().await;
        assert!(payloads[0].message.contains("Floor2-Clean"));
    }

    #[tokio::test]
    async fn unknown_serial_drops_without_writes() {
        let (pipeline, store, sink) = pipeline().await;
        let summary = pipeline.ingest("tenantA", vec![state("R999", 78)]).await;

        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.dropped, 1);
        let key = [("serial".to_string(), json!("R999"))].into_iter().collect();
        assert!(store
            .get_by_primary_key("tenantA", "robot_state", &key)
            .await
            .unwrap()
            .is_none());
        assert!(sink.payloads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_windows_do_not_duplicate_notifications() {
        let (pipeline, _store, sink) = pipeline().await;
        pipeline.ingest("tenantA", vec![state("R1", 15)]).await;
        pipeline.ingest("tenantA", vec![state("R1", 9)]).await;
        // The same drop observed again by an overlapping window.
        let summary = pipeline.ingest("tenantA", vec![state("R1", 9)]).await;

        assert_eq!(summary.unchanged, 1);
        assert_eq!(sink.payloads.lock().await.len(), 1);
    }
}
