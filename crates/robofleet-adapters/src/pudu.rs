//! Pudu vendor adapter.
//!
//! Pudu's cloud API authenticates every request with an API key/secret
//! header pair, paginates with offset/limit, and reports timestamps in
//! milliseconds. Response translation is entirely driven by the vendor's
//! mapping document; this file only knows endpoint shapes, headers, and
//! pagination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use robofleet_catalog::{TenantCatalog, VendorCredentials};
use robofleet_types::{ChargingSession, RecordKind, RobotEvent, RobotState, TaskRecord};

use crate::mapping::lookup_path;
use crate::{AdapterError, AdapterResult, FetchWindow, RobotSummary, VendorAdapter, VendorMappingConfig};

/// Rows requested per page.
const PAGE_SIZE: usize = 100;

/// Vendor HTTP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Vendor HTTP full-request timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Envelope wrapping every Pudu response.
#[derive(Debug, Deserialize)]
struct PuduEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Pudu cloud API adapter.
pub struct PuduAdapter {
    client: Client,
    base_url: Url,
    mapping: VendorMappingConfig,
    catalog: Arc<TenantCatalog>,
}

impl PuduAdapter {
    /// Creates the adapter against a base URL, with the vendor's mapping
    /// document and the credential catalog.
    pub fn new(
        base_url: &str,
        mapping: VendorMappingConfig,
        catalog: Arc<TenantCatalog>,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .user_agent(concat!("robofleet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url, mapping, catalog })
    }

    /// Builds the per-tenant authentication headers.
    fn headers_for(&self, tenant: &str) -> AdapterResult<HeaderMap> {
        let credentials = self.catalog.credentials(tenant, self.vendor_id()).ok_or_else(|| {
            AdapterError::Auth(format!("no pudu credentials configured for tenant {tenant}"))
        })?;
        let VendorCredentials::ApiKey { api_key, api_secret } = credentials else {
            return Err(AdapterError::Auth(format!(
                "tenant {tenant} has non api-key credentials configured for pudu"
            )));
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.expose_secret())
                .map_err(|_| AdapterError::Auth("invalid api key header value".to_string()))?,
        );
        headers.insert(
            "x-api-secret",
            HeaderValue::from_str(api_secret.expose_secret())
                .map_err(|_| AdapterError::Auth("invalid api secret header value".to_string()))?,
        );
        Ok(headers)
    }

    /// Issues one GET and unwraps the Pudu envelope.
    async fn get(&self, tenant: &str, path: &str, query: &[(&str, String)]) -> AdapterResult<Value> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| AdapterError::Malformed(format!("bad endpoint path {path}: {e}")))?;
        let headers = self.headers_for(tenant)?;

        let response = self
            .client
            .get(url)
            .headers(headers)
            .query(query)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(status, path));
        }

        let envelope: PuduEnvelope = response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("{path}: {e}")))?;
        match envelope.code {
            0 => Ok(envelope.data),
            // Pudu signals credential trouble in-band.
            401 | 403 | 1001 => Err(AdapterError::Auth(format!(
                "{path}: code {} {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            ))),
            code => Err(AdapterError::Malformed(format!(
                "{path}: code {code} {}",
                envelope.msg.unwrap_or_default()
            ))),
        }
    }

    /// Fetches every page of a list endpoint.
    async fn get_all_pages(
        &self,
        tenant: &str,
        path: &str,
        base_query: &[(&str, String)],
    ) -> AdapterResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut query: Vec<(&str, String)> = base_query.to_vec();
            query.push(("offset", offset.to_string()));
            query.push(("limit", PAGE_SIZE.to_string()));

            let data = self.get(tenant, path, &query).await?;
            let page = data
                .get("list")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = page.len();
            items.extend(page);

            if page_len < PAGE_SIZE {
                return Ok(items);
            }
            offset += PAGE_SIZE;
        }
    }

    /// Maps raw vendor items into records, dropping malformed items with a
    /// single log line each; the batch proceeds.
    fn map_items<T: DeserializeOwned>(&self, kind: RecordKind, items: Vec<Value>) -> Vec<T> {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let serial = lookup_path(&item, "sn")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();
            let mapped = match self.mapping.map_record(kind, &item) {
                Ok(mapped) => mapped,
                Err(e) => {
                    warn!(vendor = "pudu", serial = %serial, kind = %kind, reason = %e, "dropping unmappable item");
                    continue;
                }
            };
            match serde_json::from_value::<T>(mapped) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(vendor = "pudu", serial = %serial, kind = %kind, reason = %e, "dropping incomplete item");
                }
            }
        }
        records
    }

    fn window_query(window: FetchWindow) -> Vec<(&'static str, String)> {
        // The wire speaks milliseconds.
        vec![
            ("start_time", (window.start * 1000).to_string()),
            ("end_time", (window.end * 1000).to_string()),
        ]
    }
}

#[async_trait]
impl VendorAdapter for PuduAdapter {
    fn vendor_id(&self) -> &str {
        "pudu"
    }

    fn mapping(&self) -> &VendorMappingConfig {
        &self.mapping
    }

    #[instrument(skip(self), fields(vendor = "pudu"))]
    async fn list_robots(&self, tenant: &str) -> AdapterResult<Vec<RobotSummary>> {
        let items = self.get_all_pages(tenant, "api/v1/robots", &[]).await?;
        debug!(tenant, robots = items.len(), "listed pudu robots");
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let serial = item.get("sn")?.as_str()?.to_string();
                Some(RobotSummary {
                    serial,
                    name: item.get("name").and_then(Value::as_str).map(String::from),
                    model: item.get("model").and_then(Value::as_str).map(String::from),
                })
            })
            .collect())
    }

    #[instrument(skip(self), fields(vendor = "pudu"))]
    async fn fetch_state(&self, tenant: &str, serial: &str) -> AdapterResult<RobotState> {
        let data = self
            .get(tenant, "api/v1/robot/status", &[("sn", serial.to_string())])
            .await?;
        let mapped = self
            .mapping
            .map_record(RecordKind::State, &data)
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;
        serde_json::from_value(mapped).map_err(|e| AdapterError::Malformed(e.to_string()))
    }

    #[instrument(skip(self, window), fields(vendor = "pudu"))]
    async fn fetch_tasks(&self, tenant: &str, window: FetchWindow) -> AdapterResult<Vec<TaskRecord>> {
        let items = self
            .get_all_pages(tenant, "api/v1/task/reports", &Self::window_query(window))
            .await?;
        Ok(self.map_items(RecordKind::Task, items))
    }

    #[instrument(skip(self, window), fields(vendor = "pudu"))]
    async fn fetch_charging(
        &self,
        tenant: &str,
        window: FetchWindow,
    ) -> AdapterResult<Vec<ChargingSession>> {
        let items = self
            .get_all_pages(tenant, "api/v1/charging/records", &Self::window_query(window))
            .await?;
        Ok(self.map_items(RecordKind::Charging, items))
    }

    #[instrument(skip(self, window), fields(vendor = "pudu"))]
    async fn fetch_events(
        &self,
        tenant: &str,
        window: FetchWindow,
    ) -> AdapterResult<Vec<RobotEvent>> {
        let items = self
            .get_all_pages(tenant, "api/v1/robot/events", &Self::window_query(window))
            .await?;
        Ok(self.map_items(RecordKind::Event, items))
    }

    // fetch_locations intentionally not implemented: Pudu's API has no
    // building inventory, so the default Unsupported body applies.
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MAPPING: &str = r#"
verification:
  method: header
  key: "X-Pudu-Token"
detect_marker: "data.sn"
type_mappings:
  robotStatus: state
field_mappings:
  state:
    - { source: "sn", dest: "serial" }
    - source: "robot_status"
      dest: "state"
      convert:
        mapping: { "Free": "idle", "Working": "working", "Offline": "offline" }
    - { source: "battery", dest: "battery" }
    - { source: "timestamp", dest: "reported_at", convert: ms_to_s }
  task:
    - { source: "sn", dest: "serial" }
    - { source: "task_id", dest: "task_id" }
    - { source: "task_name", dest: "task_name" }
    - { source: "start_time", dest: "started_at", convert: ms_to_s }
    - { source: "end_time", dest: "ended_at", convert: ms_to_s }
    - source: "status"
      dest: "status"
      convert:
        mapping: { "0": "completed", "1": "in_progress", "2": "abnormal", "3": "failed", "-1": "not_started" }
"#;

    const CATALOG: &str = r#"
tenants:
  tenantA:
    pudu:
      enabled: true
      api_key: "key-a"
      api_secret: "secret-a"
"#;

    fn adapter(base_url: &str) -> PuduAdapter {
        let mapping = VendorMappingConfig::from_str(MAPPING).unwrap();
        let catalog = Arc::new(TenantCatalog::from_str(CATALOG).unwrap());
        PuduAdapter::new(base_url, mapping, catalog).unwrap()
    }

    #[tokio::test]
    async fn fetch_state_maps_the_wire_format() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/robot/status"))
            .and(query_param("sn", "R1"))
            .and(header("x-api-key", "key-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": {
                    "sn": "R1",
                    "robot_status": "Working",
                    "battery": 78,
                    "timestamp": 1_700_000_000_000_i64
                }
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let state = adapter.fetch_state("tenantA", "R1").await.unwrap();
        assert_eq!(state.serial, "R1");
        assert_eq!(state.battery, 78);
        assert_eq!(state.reported_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn tasks_drop_malformed_items_but_keep_the_rest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/task/reports"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": {
                    "list": [
                        {
                            "sn": "R1",
                            "task_id": "t-1",
                            "task_name": "Floor2-Clean",
                            "start_time": 1_700_000_000_000_i64,
                            "end_time": 1_700_003_600_000_i64,
                            "status": 0
                        },
                        { "sn": "R1", "status": 99 }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let window = FetchWindow { start: 1_700_000_000, end: 1_700_000_600 };
        let tasks = adapter.fetch_tasks("tenantA", window).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_name, "Floor2-Clean");
        assert_eq!(tasks[0].ended_at, Some(1_700_003_600));
        assert_eq!(tasks[0].status, robofleet_types::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn server_errors_classify_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/robot/status"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let err = adapter.fetch_state("tenantA", "R1").await.unwrap_err();
        assert!(err.is_transient(), "expected transient, got {err:?}");
    }

    #[tokio::test]
    async fn envelope_auth_codes_classify_as_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/robot/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 1001,
                "msg": "invalid signature"
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let err = adapter.fetch_state("tenantA", "R1").await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_tenant_credentials_fail_fast() {
        let server = MockServer::start().await;
        let adapter = adapter(&server.uri());
        let err = adapter.fetch_state("ghost-tenant", "R1").await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
    }

    #[tokio::test]
    async fn locations_are_explicitly_unsupported() {
        let server = MockServer::start().await;
        let adapter = adapter(&server.uri());
        assert!(matches!(
            adapter.fetch_locations("tenantA").await,
            Err(AdapterError::Unsupported { capability: "fetch_locations", .. })
        ));
    }
}
