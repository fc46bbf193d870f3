//! The fixed external table schema.
//!
//! Tables and primary keys are set by the data model and by the external
//! consumers of the store (report generation, the support workflow); the
//! writer creates them if absent but never evolves them.

use serde::{Deserialize, Serialize};

/// SQL-facing type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit integer.
    Integer,
    /// Double-precision float.
    Real,
    /// JSON document stored as text.
    Json,
}

/// One column of a fixed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Column name, identical to the record field it stores.
    pub name: &'static str,
    /// Column type.
    pub kind: ColumnType,
}

const fn col(name: &'static str, kind: ColumnType) -> Column {
    Column { name, kind }
}

/// One table of the fixed schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub name: &'static str,
    /// All columns, primary key first.
    pub columns: &'static [Column],
    /// Primary-key column names, in key order.
    pub primary_key: &'static [&'static str],
}

impl TableSchema {
    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True when the column is part of the primary key.
    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.contains(&name)
    }
}

use ColumnType::{Integer, Json, Real, Text};

const TASK_COLUMNS: &[Column] = &[
    col("serial", Text),
    col("task_name", Text),
    col("started_at", Integer),
    col("task_id", Text),
    col("mode", Text),
    col("planned_area", Real),
    col("actual_area", Real),
    col("duration_secs", Integer),
    col("water_ml", Real),
    col("energy_wh", Real),
    col("battery_usage", Real),
    col("ended_at", Integer),
    col("status", Text),
    col("map_id", Text),
    col("subtasks", Json),
    col("vendor", Text),
];

const TASK_PRIMARY_KEY: &[&str] = &["serial", "task_name", "started_at"];

/// Every table of the fixed schema.
static SCHEMAS: &[TableSchema] = &[
    TableSchema {
        name: "robot_state",
        columns: &[
            col("serial", Text),
            col("state", Text),
            col("battery", Integer),
            col("pos_x", Real),
            col("pos_y", Real),
            col("pos_yaw", Real),
            col("map_id", Text),
            col("reported_at", Integer),
            col("vendor", Text),
        ],
        primary_key: &["serial"],
    },
    TableSchema {
        name: "robot_tasks",
        columns: TASK_COLUMNS,
        primary_key: TASK_PRIMARY_KEY,
    },
    TableSchema {
        // Staging table for tasks that have not yet reported an end time.
        name: "mnt_ongoing_tasks",
        columns: TASK_COLUMNS,
        primary_key: TASK_PRIMARY_KEY,
    },
    TableSchema {
        name: "charging_sessions",
        columns: &[
            col("serial", Text),
            col("started_at", Integer),
            col("ended_at", Integer),
            col("initial_battery", Integer),
            col("final_battery", Integer),
            col("duration_secs", Integer),
            col("power_gain_percent", Integer),
            col("vendor", Text),
        ],
        primary_key: &["serial", "started_at", "ended_at"],
    },
    TableSchema {
        name: "robot_events",
        columns: &[
            col("serial", Text),
            col("event_id", Text),
            col("level", Text),
            col("event_type", Text),
            col("detail", Text),
            col("occurred_at", Integer),
            col("vendor", Text),
        ],
        primary_key: &["serial", "event_id"],
    },
    TableSchema {
        name: "locations",
        columns: &[
            col("building_id", Text),
            col("name", Text),
            col("country", Text),
            col("state", Text),
            col("city", Text),
            col("latitude", Real),
            col("longitude", Real),
            col("vendor", Text),
        ],
        primary_key: &["building_id"],
    },
    TableSchema {
        // One row per (serial, trigger); `sent_at` advances on every
        // delivery and backs the suppression window.
        name: "notifications_log",
        columns: &[
            col("serial", Text),
            col("trigger_kind", Text),
            col("severity", Text),
            col("title", Text),
            col("message", Text),
            col("sent_at", Integer),
        ],
        primary_key: &["serial", "trigger_kind"],
    },
    TableSchema {
        // Support-ticket summary rows consumed by the external workflow.
        name: "mnt_robot_event_reports",
        columns: &[
            col("report_id", Text),
            col("serial", Text),
            col("event_id", Text),
            col("level", Text),
            col("detail", Text),
            col("status", Text),
            col("created_at", Integer),
        ],
        primary_key: &["report_id"],
    },
    TableSchema {
        name: "mnt_robot_report_timeline",
        columns: &[
            col("entry_id", Text),
            col("report_id", Text),
            col("entry", Text),
            col("created_at", Integer),
        ],
        primary_key: &["entry_id"],
    },
];

/// All tables of the fixed schema.
pub fn all_schemas() -> &'static [TableSchema] {
    SCHEMAS
}

/// Looks up a table by name.
pub fn schema_for(table: &str) -> Option<&'static TableSchema> {
    SCHEMAS.iter().find(|s| s.name == table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_tables_are_all_present() {
        for table in ["robot_state", "robot_tasks", "charging_sessions", "robot_events", "locations"]
        {
            assert!(schema_for(table).is_some(), "missing schema for {table}");
        }
    }

    #[test]
    fn ongoing_and_completed_tasks_share_shape() {
        let ongoing = schema_for("mnt_ongoing_tasks").unwrap();
        let completed = schema_for("robot_tasks").unwrap();
        assert_eq!(ongoing.columns, completed.columns);
        assert_eq!(ongoing.primary_key, completed.primary_key);
    }

    #[test]
    fn primary_keys_are_real_columns() {
        for schema in all_schemas() {
            for key in schema.primary_key {
                assert!(
                    schema.column(key).is_some(),
                    "{}.{key} is a key but not a column",
                    schema.name
                );
                assert!(schema.is_key_column(key));
            }
        }
    }

    #[test]
    fn unknown_table_is_none() {
        assert!(schema_for("mnt_imaginary").is_none());
    }
}
