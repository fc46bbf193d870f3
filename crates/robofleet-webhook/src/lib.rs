#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-webhook** – Webhook ingress for robofleet.
//!
//! Vendors push low-latency updates here between polling runs. The surface
//! is one POST endpoint per vendor plus a brand-agnostic endpoint that
//! detects the vendor structurally, and matching health endpoints. Requests
//! authenticate per the vendor's verification rule, translate through the
//! same declarative mappings as the poller, and enter the same pipeline.
//! The handler is stateless and horizontally replicable; correctness rests
//! on change detection and idempotent upsert downstream.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use robofleet_adapters::{
    mapping::lookup_path, AdapterRegistry, VendorDetection, VerificationMethod,
};
use robofleet_catalog::RoutingTable;
use robofleet_pipeline::{coerce_row_value, IngestPipeline};
use robofleet_store_core::schema_for;
use robofleet_types::{NormalizedRecord, RecordPayload, VendorId};

//─────────────────────────────
//  State and response types
//─────────────────────────────

/// Shared state behind the webhook routes.
pub struct WebhookState {
    registry: Arc<AdapterRegistry>,
    routing: Arc<RoutingTable>,
    pipeline: Arc<IngestPipeline>,
    /// Configured webhook secret per vendor. An empty or absent secret
    /// skips verification for that vendor; staging tenants rely on this.
    secrets: HashMap<VendorId, String>,
}

impl WebhookState {
    /// Builds the webhook state over the shared startup objects.
    pub fn new(
        registry: Arc<AdapterRegistry>,
        routing: Arc<RoutingTable>,
        pipeline: Arc<IngestPipeline>,
        secrets: HashMap<VendorId, String>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, routing, pipeline, secrets })
    }

    fn secret_for(&self, vendor: &str) -> Option<&str> {
        self.secrets.get(vendor).map(String::as_str).filter(|s| !s.is_empty())
    }
}

/// Minimal acknowledgement body returned by every webhook response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    /// `"ok"` or `"error"`.
    pub status: String,
    /// Human-readable outcome.
    pub message: String,
    /// ISO-8601 response timestamp.
    pub timestamp: String,
}

impl Ack {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

type AckResponse = (StatusCode, Json<Ack>);

fn respond(status: StatusCode, ack: Ack) -> AckResponse {
    (status, Json(ack))
}

//─────────────────────────────
//  Router
//─────────────────────────────

/// Builds the webhook router.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/api/webhook", post(handle_auto))
        .route("/api/webhook/health", get(health_auto))
        .route("/api/:vendor/webhook", post(handle_vendor))
        .route("/api/:vendor/webhook/health", get(health_vendor))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

async fn handle_vendor(
    Path(vendor): Path<String>,
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> AckResponse {
    let Ok(Json(payload)) = body else {
        return respond(StatusCode::BAD_REQUEST, Ack::error("malformed JSON body"));
    };
    process(&state, &vendor, &headers, &payload).await
}

async fn handle_auto(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> AckResponse {
    let Ok(Json(payload)) = body else {
        return respond(StatusCode::BAD_REQUEST, Ack::error("malformed JSON body"));
    };
    match state.registry.detect_vendor(&payload) {
        VendorDetection::Detected(vendor) => process(&state, &vendor, &headers, &payload).await,
        VendorDetection::None => {
            respond(StatusCode::BAD_REQUEST, Ack::error("unrecognized vendor payload"))
        }
        VendorDetection::Ambiguous(vendors) => {
            warn!(?vendors, "brand-agnostic payload matched several vendors");
            respond(StatusCode::BAD_REQUEST, Ack::error("ambiguous vendor payload"))
        }
    }
}

async fn process(
    state: &WebhookState,
    vendor: &str,
    headers: &HeaderMap,
    payload: &Value,
) -> AckResponse {
    let Some(adapter) = state.registry.get(vendor) else {
        return respond(StatusCode::NOT_FOUND, Ack::error(format!("unknown vendor: {vendor}")));
    };
    let mapping = adapter.mapping();

    // 1. Authenticate per the vendor's verification rule.
    if let Some(secret) = state.secret_for(vendor) {
        let presented = match mapping.verification.method {
            VerificationMethod::Header => headers
                .get(mapping.verification.key.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            VerificationMethod::Body => lookup_path(payload, &mapping.verification.key)
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        if presented.as_deref() != Some(secret) {
            debug!(vendor, "webhook verification failed");
            return respond(StatusCode::UNAUTHORIZED, Ack::error("verification failed"));
        }
    }

    // 2. Resolve the record kind from the callback type.
    let Some(callback_type) =
        lookup_path(payload, &mapping.type_field).and_then(Value::as_str)
    else {
        return respond(StatusCode::BAD_REQUEST, Ack::error("missing callback type"));
    };
    let Some(kind) = mapping.kind_for_callback(callback_type) else {
        return respond(
            StatusCode::BAD_REQUEST,
            Ack::error(format!("unknown callback type: {callback_type}")),
        );
    };

    // 3. Apply the declarative field mappings and schema coercion. Mapping
    // sources are relative to the vendor's payload root, the same shape the
    // polling API delivers.
    let record_body = if mapping.payload_root.is_empty() {
        payload
    } else {
        match lookup_path(payload, &mapping.payload_root) {
            Some(body) => body,
            None => {
                return respond(StatusCode::BAD_REQUEST, Ack::error("missing payload body"))
            }
        }
    };
    let mapped = match mapping.map_record(kind, record_body) {
        Ok(mapped) => mapped,
        Err(e) => return respond(StatusCode::BAD_REQUEST, Ack::error(e.to_string())),
    };
    let coerced = match schema_for(kind.table()) {
        Some(schema) => coerce_row_value(schema, mapped),
        None => mapped,
    };
    let record = match RecordPayload::from_kind_value(kind, coerced) {
        Ok(record) => record,
        Err(e) => {
            return respond(
                StatusCode::BAD_REQUEST,
                Ack::error(format!("incomplete {kind} payload: {e}")),
            )
        }
    };

    // 4. Reject invalid or unroutable records before touching the pipeline.
    if let Err(reason) = record.validate() {
        return respond(StatusCode::BAD_REQUEST, Ack::error(reason));
    }
    let Some(serial) = record.serial().map(str::to_string) else {
        return respond(StatusCode::BAD_REQUEST, Ack::error("payload carries no robot serial"));
    };
    if !state.routing.contains(&serial) {
        return respond(StatusCode::NOT_FOUND, Ack::error(format!("unknown serial: {serial}")));
    }

    // 5. Same pipeline as the poller: normalize → detect → write → notify.
    let summary = state
        .pipeline
        .ingest_one("", NormalizedRecord::new(vendor, record))
        .await;
    if summary.written + summary.unchanged == 0 {
        // Accepted but not applied; queueing durably is out of scope.
        return respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            Ack::error("record accepted but could not be applied"),
        );
    }

    debug!(vendor, serial = %serial, kind = %kind, "webhook record ingested");
    respond(StatusCode::OK, Ack::ok(format!("{kind} record accepted")))
}

//─────────────────────────────
//  Health
//─────────────────────────────

async fn health_auto(State(state): State<Arc<WebhookState>>) -> Json<Value> {
    Json(health_body(&state, "auto"))
}

async fn health_vendor(
    Path(vendor): Path<String>,
    State(state): State<Arc<WebhookState>>,
) -> Json<Value> {
    Json(health_body(&state, &vendor))
}

fn health_body(state: &WebhookState, configured_vendor: &str) -> Value {
    let features: Value = state
        .registry
        .vendors()
        .into_iter()
        .map(|vendor| {
            let auth = state.secret_for(&vendor).is_some();
            (format!("auth_{vendor}"), json!(auth))
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let mut endpoints = vec!["/api/webhook".to_string(), "/api/webhook/health".to_string()];
    for vendor in state.registry.vendors() {
        endpoints.push(format!("/api/{vendor}/webhook"));
        endpoints.push(format!("/api/{vendor}/webhook/health"));
    }

    json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "configured_vendor": configured_vendor,
        "features": features,
        "supported_endpoints": endpoints,
    })
}
