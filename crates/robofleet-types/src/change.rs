//! Change classification and trigger events.
//!
//! The change detector classifies every inbound record against stored state
//! and emits [`TriggerEvent`]s for the bounded set of transitions that may
//! cause a notification. These types are the contract between the detector
//! and the notification engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DatabaseId, RobotSerial, Row, VendorId};

//─────────────────────────────
//  Field-level diffs
//─────────────────────────────

/// One changed field of an updated record, carrying both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Column name.
    pub field: String,
    /// Previously stored value.
    pub old: Value,
    /// Newly observed value.
    pub new: Value,
}

/// Classification of an inbound record against the stored row with the same
/// primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordChange {
    /// No stored row existed; the record inserts.
    Created,
    /// A stored row existed and at least one field differs.
    Updated {
        /// The changed fields with old and new values.
        changes: Vec<FieldChange>,
    },
    /// A stored row existed and no field differs; nothing to write.
    Unchanged,
}

impl RecordChange {
    /// True when the record must be written (insert or update).
    pub fn requires_write(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    /// The old/new values of one field, when this is an update touching it.
    pub fn field_change(&self, field: &str) -> Option<&FieldChange> {
        match self {
            Self::Updated { changes } => changes.iter().find(|c| c.field == field),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Triggers
//─────────────────────────────

/// The bounded set of transitions that may cause a notification.
///
/// The change detector is the sole producer of these; the notification
/// engine never re-derives transitions from raw records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Battery crossed into `[0, 10]` downward.
    BatteryCritical,
    /// Battery crossed into `(10, 20]` downward.
    BatteryLow,
    /// Battery crossed above 20% upward while previously at or below 20%.
    BatteryRecovered,
    /// Operational state transitioned to `offline`.
    RobotOffline,
    /// Operational state transitioned to `online` while previously `offline`.
    RobotOnline,
    /// A new event with level `fatal` or `error` arrived.
    Incident,
    /// Task status transitioned to `completed`.
    TaskCompleted,
    /// Task status transitioned to `abnormal` or `failed`.
    TaskFailed,
}

impl TriggerKind {
    /// Canonical snake_case name; also the suppression-key component.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatteryCritical => "battery_critical",
            Self::BatteryLow => "battery_low",
            Self::BatteryRecovered => "battery_recovered",
            Self::RobotOffline => "robot_offline",
            Self::RobotOnline => "robot_online",
            Self::Incident => "incident",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A triggering transition detected for one robot, consumed by the
/// notification engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Robot the transition belongs to.
    pub serial: RobotSerial,
    /// Vendor whose records produced the transition.
    pub vendor: VendorId,
    /// Tenant database the underlying record routed to.
    pub database: DatabaseId,
    /// The transition kind.
    pub trigger: TriggerKind,
    /// Seconds since epoch at which the transition was detected.
    pub occurred_at: i64,
    /// Event-specific fields available to message templates
    /// (battery values, task name, event detail, and the like).
    pub context: Row,
}

impl TriggerEvent {
    /// Suppression key of this event: `(serial, trigger kind)`.
    pub fn suppression_key(&self) -> (String, &'static str) {
        (self.serial.clone(), self.trigger.as_str())
    }
}
