#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-types** – Shared record model for the robofleet telemetry platform.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the five normalized record kinds, their primary-key policy, the
//! change/trigger event model consumed by the notification engine, and the
//! row representation shared between the change detector and the persistence
//! writer. It intentionally makes no assumptions about I/O or storage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod change;
pub mod retry;

pub use change::{FieldChange, RecordChange, TriggerEvent, TriggerKind};
pub use retry::BackoffPolicy;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Globally unique robot serial number, as reported by the vendor.
pub type RobotSerial = String;

/// Identifier of an isolated customer scope. A tenant owns exactly one
/// logical database, and the database id of that tenant is the tenant id
/// itself (see the routing resolver).
pub type TenantId = String;

/// Identifier of a robot vendor whose wire format one adapter handles.
pub type VendorId = String;

/// Identifier of a tenant database that a batch of records routes to.
pub type DatabaseId = String;

//─────────────────────────────
//  Enumerations
//─────────────────────────────

/// Operational state of a robot as carried by [`RobotState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotOperationalState {
    /// Reachable and idle-capable.
    Online,
    /// Not reachable by the vendor cloud.
    Offline,
    /// Executing a task.
    Working,
    /// Reachable, no task assigned.
    Idle,
    /// Docked and charging.
    Charging,
    /// Reporting a fault.
    Error,
    /// Taken out of service.
    Maintenance,
}

impl RobotOperationalState {
    /// Parses a normalized (lowercased, trimmed) state string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "working" => Some(Self::Working),
            "idle" => Some(Self::Idle),
            "charging" => Some(Self::Charging),
            "error" => Some(Self::Error),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }

    /// Canonical lowercase form used in rows and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Working => "working",
            Self::Idle => "idle",
            Self::Charging => "charging",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for RobotOperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a [`TaskRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Scheduled but not yet begun.
    NotStarted,
    /// Currently executing.
    InProgress,
    /// Finished normally.
    Completed,
    /// Finished with an abnormal result.
    Abnormal,
    /// Did not finish.
    Failed,
}

impl TaskStatus {
    /// Parses a normalized (snake_case) status string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "abnormal" => Some(Self::Abnormal),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Canonical snake_case form used in rows and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Abnormal => "abnormal",
            Self::Failed => "failed",
        }
    }

    /// True for the statuses that end a task (`completed`, `abnormal`, `failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abnormal | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity level of a [`RobotEvent`], also reused as notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Robot is inoperable.
    Fatal,
    /// A failure requiring attention.
    Error,
    /// A condition worth watching.
    Warning,
    /// A notable but benign occurrence.
    Event,
    /// Purely informational.
    Info,
}

impl EventLevel {
    /// Parses a normalized (lowercased) level string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fatal" => Some(Self::Fatal),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "event" => Some(Self::Event),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    /// Canonical lowercase form used in rows and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Event => "event",
            Self::Info => "info",
        }
    }

    /// True when an event at this level raises an `incident` trigger.
    pub fn is_incident(&self) -> bool {
        matches!(self, Self::Fatal | Self::Error)
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Record kinds
//─────────────────────────────

/// Current snapshot of a single robot. Keyed by serial; created on first
/// observation, updated in place on every change, never deleted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    /// Robot serial number.
    pub serial: RobotSerial,
    /// Operational state.
    pub state: RobotOperationalState,
    /// Battery percentage, an integer in `[0, 100]`.
    pub battery: i64,
    /// Optional x coordinate on the current map.
    pub pos_x: Option<f64>,
    /// Optional y coordinate on the current map.
    pub pos_y: Option<f64>,
    /// Optional heading in radians.
    pub pos_yaw: Option<f64>,
    /// Identifier of the map the robot is localized on.
    pub map_id: Option<String>,
    /// Seconds since epoch at which the vendor reported this snapshot.
    pub reported_at: i64,
}

impl RobotState {
    /// Validates the record invariants enforced by the normalizer.
    pub fn validate(&self) -> Result<(), String> {
        if self.serial.trim().is_empty() {
            return Err("robot state has empty serial".to_string());
        }
        if !(0..=100).contains(&self.battery) {
            return Err(format!("battery {} outside [0, 100]", self.battery));
        }
        Ok(())
    }
}

/// A cleaning/service job. Primary key `(serial, task_name, started_at)`.
///
/// A task begins with no end time ("ongoing"); once `ended_at` appears it is
/// promoted from the ongoing table to the completed table in a single step by
/// the task lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Robot serial number.
    pub serial: RobotSerial,
    /// Vendor-assigned task identifier.
    pub task_id: String,
    /// Human-readable task name; part of the primary key.
    pub task_name: String,
    /// Cleaning mode, vendor-normalized.
    pub mode: Option<String>,
    /// Planned coverage in square meters.
    pub planned_area: Option<f64>,
    /// Actually covered area in square meters.
    pub actual_area: Option<f64>,
    /// Task duration in seconds.
    pub duration_secs: Option<i64>,
    /// Water consumption in millilitres.
    pub water_ml: Option<f64>,
    /// Energy consumption in watt-hours.
    pub energy_wh: Option<f64>,
    /// Battery percentage consumed, computed from start and end charge when
    /// the vendor reports both.
    pub battery_usage: Option<f64>,
    /// Seconds since epoch at which the task started; part of the primary key.
    pub started_at: i64,
    /// Seconds since epoch at which the task ended; `None` while ongoing.
    pub ended_at: Option<i64>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Identifier of the map the task ran on.
    pub map_id: Option<String>,
    /// Vendor-specific per-subtask structure, retained verbatim.
    pub subtasks: Option<Value>,
}

impl TaskRecord {
    /// True while the task has no end time.
    pub fn is_ongoing(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Validates the record invariants enforced by the normalizer.
    pub fn validate(&self) -> Result<(), String> {
        if self.serial.trim().is_empty() {
            return Err("task has empty serial".to_string());
        }
        if self.task_name.trim().is_empty() {
            return Err("task has empty task_name".to_string());
        }
        Ok(())
    }
}

/// One completed charging session. Primary key `(serial, started_at, ended_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    /// Robot serial number.
    pub serial: RobotSerial,
    /// Seconds since epoch at which charging began.
    pub started_at: i64,
    /// Seconds since epoch at which charging ended.
    pub ended_at: i64,
    /// Battery percentage at session start.
    pub initial_battery: i64,
    /// Battery percentage at session end.
    pub final_battery: i64,
    /// Session duration in seconds, parsed from the vendor's `"Xh Ymin"` form.
    pub duration_secs: i64,
    /// Percentage points gained, parsed from the vendor's `"+N%"` form.
    pub power_gain_percent: i64,
}

impl ChargingSession {
    /// Validates the record invariants enforced by the normalizer.
    pub fn validate(&self) -> Result<(), String> {
        if self.serial.trim().is_empty() {
            return Err("charging session has empty serial".to_string());
        }
        Ok(())
    }
}

/// A vendor-reported robot event. Primary key `(serial, event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotEvent {
    /// Robot serial number.
    pub serial: RobotSerial,
    /// Vendor-assigned event identifier.
    pub event_id: String,
    /// Normalized severity level.
    pub level: EventLevel,
    /// Vendor event type, normalized.
    pub event_type: String,
    /// Human-readable detail text.
    pub detail: String,
    /// Seconds since epoch at which the event occurred.
    pub occurred_at: i64,
}

impl RobotEvent {
    /// Validates the record invariants enforced by the normalizer.
    pub fn validate(&self) -> Result<(), String> {
        if self.serial.trim().is_empty() {
            return Err("event has empty serial".to_string());
        }
        if self.event_id.trim().is_empty() {
            return Err("event has empty event_id".to_string());
        }
        Ok(())
    }
}

/// A building a fleet operates in. Primary key `building_id`.
///
/// Locations carry no serial; they route to the fetching tenant's database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Building identifier.
    pub building_id: String,
    /// Display name of the building.
    pub name: String,
    /// Country of the building.
    pub country: Option<String>,
    /// State or province.
    pub state: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
}

impl Location {
    /// Validates the record invariants enforced by the normalizer.
    pub fn validate(&self) -> Result<(), String> {
        if self.building_id.trim().is_empty() {
            return Err("location has empty building_id".to_string());
        }
        Ok(())
    }
}

//─────────────────────────────
//  Record kind dispatch
//─────────────────────────────

/// The five normalized record kinds the pipeline carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// [`RobotState`] snapshots.
    State,
    /// [`TaskRecord`] jobs.
    Task,
    /// [`ChargingSession`] rows.
    Charging,
    /// [`RobotEvent`] rows.
    Event,
    /// [`Location`] rows.
    Location,
}

impl RecordKind {
    /// Canonical snake_case form used in mapping documents and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Task => "task",
            Self::Charging => "charging",
            Self::Event => "event",
            Self::Location => "location",
        }
    }

    /// Parses a mapping-document kind string.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "state" => Some(Self::State),
            "task" => Some(Self::Task),
            "charging" => Some(Self::Charging),
            "event" => Some(Self::Event),
            "location" => Some(Self::Location),
            _ => None,
        }
    }

    /// Destination table of the completed form of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            Self::State => "robot_state",
            Self::Task => "robot_tasks",
            Self::Charging => "charging_sessions",
            Self::Event => "robot_events",
            Self::Location => "locations",
        }
    }

    /// Primary-key column names of this kind's table, in declaration order.
    pub fn primary_key_columns(&self) -> &'static [&'static str] {
        match self {
            Self::State => &["serial"],
            Self::Task => &["serial", "task_name", "started_at"],
            Self::Charging => &["serial", "started_at", "ended_at"],
            Self::Event => &["serial", "event_id"],
            Self::Location => &["building_id"],
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a normalized record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    /// A robot state snapshot.
    State(RobotState),
    /// A task record.
    Task(TaskRecord),
    /// A charging session.
    Charging(ChargingSession),
    /// A robot event.
    Event(RobotEvent),
    /// A location row.
    Location(Location),
}

impl RecordPayload {
    /// Deserializes a flat field object (as produced by the mapping
    /// interpreter) into the payload of the given kind.
    pub fn from_kind_value(kind: RecordKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            RecordKind::State => Self::State(serde_json::from_value(value)?),
            RecordKind::Task => Self::Task(serde_json::from_value(value)?),
            RecordKind::Charging => Self::Charging(serde_json::from_value(value)?),
            RecordKind::Event => Self::Event(serde_json::from_value(value)?),
            RecordKind::Location => Self::Location(serde_json::from_value(value)?),
        })
    }

    /// The kind tag of this payload.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::State(_) => RecordKind::State,
            Self::Task(_) => RecordKind::Task,
            Self::Charging(_) => RecordKind::Charging,
            Self::Event(_) => RecordKind::Event,
            Self::Location(_) => RecordKind::Location,
        }
    }

    /// The robot serial carried by this payload, if the kind has one.
    pub fn serial(&self) -> Option<&str> {
        match self {
            Self::State(r) => Some(&r.serial),
            Self::Task(r) => Some(&r.serial),
            Self::Charging(r) => Some(&r.serial),
            Self::Event(r) => Some(&r.serial),
            Self::Location(_) => None,
        }
    }

    /// Runs the per-kind invariant validation.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::State(r) => r.validate(),
            Self::Task(r) => r.validate(),
            Self::Charging(r) => r.validate(),
            Self::Event(r) => r.validate(),
            Self::Location(r) => r.validate(),
        }
    }
}

//─────────────────────────────
//  Normalized records and rows
//─────────────────────────────

/// A column-name → value map; the row representation shared between the
/// change detector and the persistence writer. `BTreeMap` keeps field order
/// deterministic for comparison and logging.
pub type Row = BTreeMap<String, Value>;

/// A fully normalized record, tagged with its originating vendor for
/// traceability. This is the unit that flows normalizer → detector → writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Vendor whose adapter produced this record.
    pub vendor: VendorId,
    /// The record payload.
    pub payload: RecordPayload,
}

impl NormalizedRecord {
    /// Creates a record tagged with its originating vendor.
    pub fn new(vendor: impl Into<VendorId>, payload: RecordPayload) -> Self {
        Self { vendor: vendor.into(), payload }
    }

    /// The kind tag of the payload.
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    /// Destination table of this record.
    pub fn table(&self) -> &'static str {
        self.kind().table()
    }

    /// The robot serial, if the kind carries one.
    pub fn serial(&self) -> Option<&str> {
        self.payload.serial()
    }

    /// Flattens the payload into a row, adding the `vendor` column.
    ///
    /// Every column of the record's fixed schema is present; optional fields
    /// that are unset appear as explicit nulls so that the upsert leaves
    /// nothing accidentally untouched.
    pub fn to_row(&self) -> Row {
        let mut row = payload_row(&self.payload);
        row.insert("vendor".to_string(), Value::String(self.vendor.clone()));
        row
    }

    /// The primary-key columns and values identifying this record's row.
    pub fn primary_key(&self) -> Row {
        let row = payload_row(&self.payload);
        let mut key = Row::new();
        for column in self.kind().primary_key_columns() {
            let value = row.get(*column).cloned().unwrap_or(Value::Null);
            key.insert((*column).to_string(), value);
        }
        key
    }
}

/// Serializes a payload's inner struct into a flat row map, dropping the
/// `kind` discriminant tag.
fn payload_row(payload: &RecordPayload) -> Row {
    let value = match payload {
        RecordPayload::State(r) => serde_json::to_value(r),
        RecordPayload::Task(r) => serde_json::to_value(r),
        RecordPayload::Charging(r) => serde_json::to_value(r),
        RecordPayload::Event(r) => serde_json::to_value(r),
        RecordPayload::Location(r) => serde_json::to_value(r),
    };
    match value {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => Row::new(),
    }
}
