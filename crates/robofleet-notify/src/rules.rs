//! The trigger rule table and message rendering.

use std::collections::BTreeMap;

use serde_json::Value;

use robofleet_types::{EventLevel, Row, TriggerKind};

/// Default suppression window applied to every trigger, in seconds.
pub const DEFAULT_SUPPRESSION_SECS: i64 = 600;

/// One rule of the notification table.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRule {
    /// Notification severity.
    pub severity: EventLevel,
    /// Template for the short title.
    pub title: &'static str,
    /// Template for the message body. Placeholders of the form `{name}`
    /// substitute the robot name, serial, and trigger context fields.
    pub message: &'static str,
    /// Duplicates inside this window are dropped, per (serial, trigger).
    pub suppression_secs: i64,
    /// Icon tag forwarded to the notification API.
    pub icon: &'static str,
}

/// The complete rule table, one entry per trigger kind.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: BTreeMap<&'static str, TriggerRule>,
}

impl RuleSet {
    /// Looks up the rule for a trigger.
    pub fn rule_for(&self, trigger: TriggerKind) -> &TriggerRule {
        // The table is total over TriggerKind by construction.
        &self.rules[trigger.as_str()]
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            TriggerKind::BatteryCritical.as_str(),
            TriggerRule {
                severity: EventLevel::Fatal,
                title: "Battery critical",
                message: "{robot_name} battery dropped to {battery}%. Send it to charge now.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "battery-critical",
            },
        );
        rules.insert(
            TriggerKind::BatteryLow.as_str(),
            TriggerRule {
                severity: EventLevel::Warning,
                title: "Battery low",
                message: "{robot_name} battery dropped to {battery}%.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "battery-low",
            },
        );
        rules.insert(
            TriggerKind::BatteryRecovered.as_str(),
            TriggerRule {
                severity: EventLevel::Info,
                title: "Battery recovered",
                message: "{robot_name} battery recovered to {battery}%.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "battery-ok",
            },
        );
        rules.insert(
            TriggerKind::RobotOffline.as_str(),
            TriggerRule {
                severity: EventLevel::Error,
                title: "Robot offline",
                message: "{robot_name} ({serial}) went offline.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "robot-offline",
            },
        );
        rules.insert(
            TriggerKind::RobotOnline.as_str(),
            TriggerRule {
                severity: EventLevel::Info,
                title: "Robot back online",
                message: "{robot_name} ({serial}) is back online.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "robot-online",
            },
        );
        rules.insert(
            TriggerKind::Incident.as_str(),
            TriggerRule {
                severity: EventLevel::Fatal,
                title: "Robot incident",
                message: "{robot_name} reported {level}: {detail}",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "incident",
            },
        );
        rules.insert(
            TriggerKind::TaskCompleted.as_str(),
            TriggerRule {
                severity: EventLevel::Event,
                title: "Task completed",
                message: "{robot_name} completed task {task_name}.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "task-done",
            },
        );
        rules.insert(
            TriggerKind::TaskFailed.as_str(),
            TriggerRule {
                severity: EventLevel::Error,
                title: "Task failed",
                message: "{robot_name} task {task_name} ended {status}.",
                suppression_secs: DEFAULT_SUPPRESSION_SECS,
                icon: "task-failed",
            },
        );
        Self { rules }
    }
}

/// Renders a template by substituting `{name}` placeholders from the
/// variable map. Unknown placeholders are left as-is rather than erased, so
/// a template typo stays visible in the delivered message.
pub fn render_template(template: &str, vars: &Row) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        let placeholder = format!("{{{name}}}");
        if !out.contains(&placeholder) {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        out = out.replace(&placeholder, &rendered);
    }
    out
}
