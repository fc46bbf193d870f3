//! The normalizer: schema coercion, invariant enforcement, routing.
//!
//! Both ingestion flows (poller and webhook) pass through here. Each record
//! is validated against the data-model invariants and resolved to its tenant
//! database; violations drop the record with a single log line tagged with
//! serial and reason, and the batch proceeds.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use robofleet_catalog::RoutingTable;
use robofleet_store_core::{ColumnType, TableSchema};
use robofleet_types::{DatabaseId, NormalizedRecord};

/// Outcome of normalizing one record.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    /// The record is valid and routed.
    Accepted {
        /// Tenant database the record routes to.
        database: DatabaseId,
        /// The record itself.
        record: NormalizedRecord,
    },
    /// The record was dropped; the reason has already been logged.
    Dropped,
}

/// Validates records and resolves their tenant database.
#[derive(Debug, Clone)]
pub struct Normalizer {
    routing: Arc<RoutingTable>,
}

impl Normalizer {
    /// Creates a normalizer over the routing table.
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self { routing }
    }

    /// Normalizes one record fetched for `tenant`.
    pub fn normalize(&self, tenant: &str, record: NormalizedRecord) -> NormalizeOutcome {
        if let Err(reason) = record.payload.validate() {
            warn!(
                vendor = %record.vendor,
                serial = record.serial().unwrap_or("<none>"),
                %reason,
                "dropping invalid record"
            );
            return NormalizeOutcome::Dropped;
        }

        let database = match record.serial() {
            Some(serial) => match self.routing.route(serial) {
                Ok(database) => database.clone(),
                Err(_) => {
                    warn!(
                        vendor = %record.vendor,
                        serial,
                        "dropping record for serial outside the tenant catalog"
                    );
                    return NormalizeOutcome::Dropped;
                }
            },
            // Locations carry no serial and route to the fetching tenant.
            None => match self.routing.tenant_database(tenant) {
                Some(database) => database,
                None => {
                    warn!(
                        vendor = %record.vendor,
                        tenant,
                        "dropping serial-less record for unrouted tenant"
                    );
                    return NormalizeOutcome::Dropped;
                }
            },
        };

        NormalizeOutcome::Accepted { database, record }
    }
}

/// Coerces the scalar fields of a mapped object toward the column types of
/// its destination table: numeric strings become numbers, boolean-like
/// strings and booleans become integers for integer columns, and bare
/// numbers become text for text columns. Webhook payloads need this; vendor
/// polling APIs are strictly typed already.
pub fn coerce_row_value(schema: &TableSchema, value: Value) -> Value {
    let Value::Object(map) = value else { return value };
    let coerced = map
        .into_iter()
        .map(|(field, field_value)| {
            let target = schema.column(&field).map(|c| c.kind);
            (field, coerce_scalar(target, field_value))
        })
        .collect();
    Value::Object(coerced)
}

fn coerce_scalar(target: Option<ColumnType>, value: Value) -> Value {
    match (target, value) {
        (Some(ColumnType::Integer), Value::String(s)) => {
            let trimmed = s.trim();
            if let Some(b) = parse_boolean(trimmed) {
                Value::Number(i64::from(b).into())
            } else if let Ok(i) = trimmed.parse::<i64>() {
                Value::Number(i.into())
            } else {
                Value::String(s)
            }
        }
        (Some(ColumnType::Integer), Value::Bool(b)) => Value::Number(i64::from(b).into()),
        (Some(ColumnType::Real), Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::String(s)),
            Err(_) => Value::String(s),
        },
        (Some(ColumnType::Text), Value::Number(n)) => Value::String(n.to_string()),
        (_, value) => value,
    }
}

/// Recognizes boolean-like strings.
fn parse_boolean(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}
