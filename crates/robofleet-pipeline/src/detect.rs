//! The change detector.
//!
//! Stateless across invocations: prior state comes from the persistence
//! writer's read interface, never from process memory, so classification
//! stays correct across restarts and across replicas. Each inbound record
//! is classified as insert, update, or no-op, and the bounded set of
//! triggering transitions is derived here and only here.

use std::sync::Arc;

use serde_json::{json, Value};

use robofleet_store_core::{StoreError, TelemetryStore};
use robofleet_types::{
    NormalizedRecord, RecordChange, RecordKind, RecordPayload, RobotOperationalState, Row,
    TaskStatus, TriggerEvent, TriggerKind,
};

use crate::equality::diff_rows;

/// A record classified against stored state.
#[derive(Debug, Clone)]
pub struct Classified {
    /// The record under classification.
    pub record: NormalizedRecord,
    /// Tenant database the record routes to.
    pub database: String,
    /// Its full row form, ready for the writer.
    pub row: Row,
    /// Insert / update / no-op classification.
    pub change: RecordChange,
    /// Triggering transitions derived from the change.
    pub triggers: Vec<TriggerEvent>,
}

/// Classifies inbound records against the store.
pub struct ChangeDetector {
    store: Arc<dyn TelemetryStore>,
}

impl ChangeDetector {
    /// Creates a detector reading through the given store.
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Classifies one record against the stored row with its primary key.
    ///
    /// Given identical stored and inbound values the result is
    /// deterministic; window overlap therefore produces no-ops, not
    /// duplicates.
    pub async fn classify(
        &self,
        database: &str,
        record: NormalizedRecord,
    ) -> Result<Classified, StoreError> {
        let row = record.to_row();
        let key = record.primary_key();
        let stored = self.lookup_existing(database, &record, &key).await?;

        let change = match &stored {
            None => RecordChange::Created,
            Some(existing) => {
                let changes = diff_rows(existing, &row);
                if changes.is_empty() {
                    RecordChange::Unchanged
                } else {
                    RecordChange::Updated { changes }
                }
            }
        };

        let triggers = derive_triggers(database, &record, stored.as_ref(), &change);
        Ok(Classified { database: database.to_string(), record, row, change, triggers })
    }

    /// Classifies a batch of records against one database, in input order.
    pub async fn classify_batch(
        &self,
        database: &str,
        records: Vec<NormalizedRecord>,
    ) -> Result<Vec<Classified>, StoreError> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.classify(database, record).await?);
        }
        Ok(out)
    }

    /// Finds the stored row a record compares against. Tasks may live in
    /// either the completed or the ongoing table; the completed table wins
    /// so that a late ongoing replay cannot shadow a completed task.
    async fn lookup_existing(
        &self,
        database: &str,
        record: &NormalizedRecord,
        key: &Row,
    ) -> Result<Option<Row>, StoreError> {
        if record.kind() == RecordKind::Task {
            if let Some(row) =
                self.store.get_by_primary_key(database, "robot_tasks", key).await?
            {
                return Ok(Some(row));
            }
            return self.store.get_by_primary_key(database, "mnt_ongoing_tasks", key).await;
        }
        self.store.get_by_primary_key(database, record.table(), key).await
    }
}

//─────────────────────────────
//  Trigger rules
//─────────────────────────────

fn derive_triggers(
    database: &str,
    record: &NormalizedRecord,
    stored: Option<&Row>,
    change: &RecordChange,
) -> Vec<TriggerEvent> {
    match (&record.payload, change) {
        (RecordPayload::State(state), RecordChange::Updated { .. }) => {
            let Some(stored) = stored else { return Vec::new() };
            state_triggers(database, record, state, stored)
        }
        (RecordPayload::Event(event), RecordChange::Created) if event.level.is_incident() => {
            vec![TriggerEvent {
                serial: event.serial.clone(),
                vendor: record.vendor.clone(),
                database: database.to_string(),
                trigger: TriggerKind::Incident,
                occurred_at: event.occurred_at,
                context: [
                    ("event_id".to_string(), json!(event.event_id)),
                    ("level".to_string(), json!(event.level.as_str())),
                    ("detail".to_string(), json!(event.detail)),
                ]
                .into_iter()
                .collect(),
            }]
        }
        (RecordPayload::Task(task), RecordChange::Created) => {
            task_trigger(database, record, task, None).into_iter().collect()
        }
        (RecordPayload::Task(task), RecordChange::Updated { .. }) => {
            let old_status = stored
                .and_then(|row| row.get("status"))
                .and_then(Value::as_str)
                .and_then(TaskStatus::parse);
            task_trigger(database, record, task, old_status).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Battery-threshold and online/offline transitions, from updated state
/// snapshots only; a first observation has nothing to cross from.
fn state_triggers(
    database: &str,
    record: &NormalizedRecord,
    state: &robofleet_types::RobotState,
    stored: &Row,
) -> Vec<TriggerEvent> {
    let mut triggers = Vec::new();
    let make = |trigger: TriggerKind, context: Row| TriggerEvent {
        serial: state.serial.clone(),
        vendor: record.vendor.clone(),
        database: database.to_string(),
        trigger,
        occurred_at: state.reported_at,
        context,
    };

    if let Some(old_battery) = stored.get("battery").and_then(Value::as_i64) {
        let new_battery = state.battery;
        let battery_context: Row = [
            ("battery".to_string(), json!(new_battery)),
            ("previous_battery".to_string(), json!(old_battery)),
        ]
        .into_iter()
        .collect();

        if new_battery <= 10 && old_battery > 10 {
            triggers.push(make(TriggerKind::BatteryCritical, battery_context));
        } else if new_battery > 10 && new_battery <= 20 && old_battery > 20 {
            triggers.push(make(TriggerKind::BatteryLow, battery_context));
        } else if new_battery > 20 && old_battery <= 20 {
            triggers.push(make(TriggerKind::BatteryRecovered, battery_context));
        }
    }

    if let Some(old_state) =
        stored.get("state").and_then(Value::as_str).and_then(RobotOperationalState::parse)
    {
        let state_context: Row = [
            ("state".to_string(), json!(state.state.as_str())),
            ("previous_state".to_string(), json!(old_state.as_str())),
        ]
        .into_iter()
        .collect();

        if state.state == RobotOperationalState::Offline
            && old_state != RobotOperationalState::Offline
        {
            triggers.push(make(TriggerKind::RobotOffline, state_context));
        } else if state.state == RobotOperationalState::Online
            && old_state == RobotOperationalState::Offline
        {
            triggers.push(make(TriggerKind::RobotOnline, state_context));
        }
    }

    triggers
}

/// Task terminal-status transitions. A task first observed in a terminal
/// status counts as a transition too; the primary key makes it fire once.
fn task_trigger(
    database: &str,
    record: &NormalizedRecord,
    task: &robofleet_types::TaskRecord,
    old_status: Option<TaskStatus>,
) -> Option<TriggerEvent> {
    let new_status = task.status;
    if Some(new_status) == old_status {
        return None;
    }
    let trigger = match new_status {
        TaskStatus::Completed => TriggerKind::TaskCompleted,
        TaskStatus::Abnormal | TaskStatus::Failed => TriggerKind::TaskFailed,
        _ => return None,
    };
    Some(TriggerEvent {
        serial: task.serial.clone(),
        vendor: record.vendor.clone(),
        database: database.to_string(),
        trigger,
        occurred_at: task.ended_at.unwrap_or(task.started_at),
        context: [
            ("task_name".to_string(), json!(task.task_name)),
            ("status".to_string(), json!(new_status.as_str())),
            ("actual_area".to_string(), json!(task.actual_area)),
        ]
        .into_iter()
        .collect(),
    })
}
