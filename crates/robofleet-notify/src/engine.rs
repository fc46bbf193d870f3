//! The notification engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use robofleet_catalog::RoutingTable;
use robofleet_store_core::TelemetryStore;
use robofleet_types::{Row, TriggerEvent, TriggerKind};

use crate::rules::{render_template, RuleSet};
use crate::sink::{NotificationPayload, NotificationSink};

/// Outcome counters of one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSummary {
    /// Notifications delivered to the sink.
    pub sent: usize,
    /// Duplicates dropped inside their suppression window.
    pub suppressed: usize,
    /// Deliveries abandoned after retry exhaustion; logged and dropped.
    pub failed: usize,
}

/// Running totals kept for the health surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyMetrics {
    /// Total notifications delivered.
    pub sent: u64,
    /// Total duplicates suppressed.
    pub suppressed: u64,
    /// Total deliveries abandoned.
    pub failed: u64,
}

/// Consumes trigger events and turns them into delivered notifications.
pub struct NotificationEngine {
    rules: RuleSet,
    sink: Arc<dyn NotificationSink>,
    store: Arc<dyn TelemetryStore>,
    routing: Arc<RoutingTable>,
    metrics: Arc<RwLock<NotifyMetrics>>,
}

impl NotificationEngine {
    /// Creates the engine with the default rule table.
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        store: Arc<dyn TelemetryStore>,
        routing: Arc<RoutingTable>,
    ) -> Self {
        Self {
            rules: RuleSet::default(),
            sink,
            store,
            routing,
            metrics: Arc::new(RwLock::new(NotifyMetrics::default())),
        }
    }

    /// Dispatches a batch of trigger events at the current wall clock.
    pub async fn dispatch(&self, events: &[TriggerEvent]) -> DispatchSummary {
        self.dispatch_at(events, Utc::now().timestamp()).await
    }

    /// Dispatches a batch of trigger events, evaluating suppression windows
    /// against `now`.
    pub async fn dispatch_at(&self, events: &[TriggerEvent], now: i64) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for event in events {
            match self.dispatch_one(event, now).await {
                Outcome::Sent => summary.sent += 1,
                Outcome::Suppressed => summary.suppressed += 1,
                Outcome::Failed => summary.failed += 1,
            }
        }

        let mut metrics = self.metrics.write().await;
        metrics.sent += summary.sent as u64;
        metrics.suppressed += summary.suppressed as u64;
        metrics.failed += summary.failed as u64;
        summary
    }

    /// A snapshot of the running totals.
    pub async fn metrics(&self) -> NotifyMetrics {
        *self.metrics.read().await
    }

    async fn dispatch_one(&self, event: &TriggerEvent, now: i64) -> Outcome {
        let rule = self.rules.rule_for(event.trigger);

        // Suppression consults the store, not process memory, so it holds
        // across restarts and across replicas.
        match self
            .store
            .last_notification(&event.database, &event.serial, event.trigger.as_str())
            .await
        {
            Ok(Some(last)) if now - last < rule.suppression_secs => {
                debug!(
                    serial = %event.serial,
                    trigger = %event.trigger,
                    last_sent = last,
                    "notification suppressed inside window"
                );
                return Outcome::Suppressed;
            }
            Ok(_) => {}
            Err(e) => {
                // Without a readable log, sending is the safer side of
                // at-least-once delivery.
                error!(serial = %event.serial, trigger = %event.trigger, error = %e, "suppression lookup failed");
            }
        }

        let vars = self.template_vars(event);
        let payload = NotificationPayload {
            robot_sn: event.serial.clone(),
            severity: rule.severity.as_str().to_string(),
            title: render_template(rule.title, &vars),
            message: render_template(rule.message, &vars),
            icon: rule.icon.to_string(),
            timestamp: iso_timestamp(event.occurred_at),
            metadata: json!({
                "trigger": event.trigger.as_str(),
                "vendor": event.vendor,
                "context": Value::Object(event.context.clone().into_iter().collect()),
            }),
        };

        if let Err(e) = self.sink.send(&payload).await {
            error!(serial = %event.serial, trigger = %event.trigger, error = %e, "notification dropped");
            return Outcome::Failed;
        }

        if let Err(e) = self
            .store
            .record_notification(
                &event.database,
                &event.serial,
                event.trigger.as_str(),
                rule.severity.as_str(),
                &payload.title,
                &payload.message,
                now,
            )
            .await
        {
            error!(serial = %event.serial, trigger = %event.trigger, error = %e, "failed to record notification");
        }

        if event.trigger == TriggerKind::Incident {
            self.record_incident(event, &payload, now).await;
        }

        info!(serial = %event.serial, trigger = %event.trigger, "notification sent");
        Outcome::Sent
    }

    /// Writes the support-ticket rows consumed by the external workflow.
    async fn record_incident(&self, event: &TriggerEvent, payload: &NotificationPayload, now: i64) {
        let report_id = Uuid::new_v4().to_string();
        let report: Row = [
            ("report_id".to_string(), json!(report_id)),
            ("serial".to_string(), json!(event.serial)),
            (
                "event_id".to_string(),
                event.context.get("event_id").cloned().unwrap_or(Value::Null),
            ),
            (
                "level".to_string(),
                event.context.get("level").cloned().unwrap_or(Value::Null),
            ),
            (
                "detail".to_string(),
                event.context.get("detail").cloned().unwrap_or(Value::Null),
            ),
            ("status".to_string(), json!("open")),
            ("created_at".to_string(), json!(now)),
        ]
        .into_iter()
        .collect();
        let entry: Row = [
            ("entry_id".to_string(), json!(Uuid::new_v4().to_string())),
            ("report_id".to_string(), json!(report_id)),
            ("entry".to_string(), json!(payload.message)),
            ("created_at".to_string(), json!(now)),
        ]
        .into_iter()
        .collect();

        if let Err(e) = self.store.record_incident_report(&event.database, &report, &entry).await {
            error!(serial = %event.serial, error = %e, "failed to record incident report");
        }
    }

    fn template_vars(&self, event: &TriggerEvent) -> Row {
        let mut vars = event.context.clone();
        vars.insert("serial".to_string(), json!(event.serial));
        let name = self
            .routing
            .robot_name(&event.serial)
            .map(String::from)
            .unwrap_or_else(|| event.serial.clone());
        vars.insert("robot_name".to_string(), json!(name));
        vars
    }
}

enum Outcome {
    Sent,
    Suppressed,
    Failed,
}

fn iso_timestamp(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}
