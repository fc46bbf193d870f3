//! Gausium vendor adapter.
//!
//! Gausium's open API issues bearer tokens through an OAuth
//! client-credentials grant, paginates with page/pageSize, and reports
//! timestamps in epoch seconds. Tokens are cached per tenant and refreshed
//! shortly before expiry. Response translation is entirely driven by the
//! vendor's mapping document.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use robofleet_catalog::{TenantCatalog, VendorCredentials};
use robofleet_types::{Location, RecordKind, RobotEvent, RobotState, TaskRecord, TenantId};

use crate::mapping::lookup_path;
use crate::{AdapterError, AdapterResult, FetchWindow, RobotSummary, VendorAdapter, VendorMappingConfig};

/// Rows requested per page.
const PAGE_SIZE: usize = 100;

/// Vendor HTTP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Vendor HTTP full-request timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Tokens are refreshed this long before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Clone)]
struct CachedToken {
    token: Secret<String>,
    expires_at: Instant,
}

/// One page of a Gausium list endpoint.
#[derive(Debug, Deserialize)]
struct GausiumPage {
    #[serde(default)]
    list: Vec<Value>,
    #[serde(default, rename = "pageCount")]
    page_count: Option<u64>,
}

/// Gausium open API adapter.
pub struct GausiumAdapter {
    client: Client,
    base_url: Url,
    mapping: VendorMappingConfig,
    catalog: Arc<TenantCatalog>,
    tokens: DashMap<TenantId, CachedToken>,
}

impl GausiumAdapter {
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
        Ok(Self { client, base_url, mapping, catalog, tokens: DashMap::new() })
    }

    /// Returns a valid bearer token for the tenant, minting one through the
    /// client-credentials grant when the cache is empty or near expiry.
    async fn bearer(&self, tenant: &str) -> AdapterResult<Secret<String>> {
        if let Some(cached) = self.tokens.get(tenant) {
            if cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(cached.token.clone());
            }
        }

        let credentials = self.catalog.credentials(tenant, self.vendor_id()).ok_or_else(|| {
            AdapterError::Auth(format!("no gausium credentials configured for tenant {tenant}"))
        })?;
        let VendorCredentials::OAuth { client_id, client_secret, token_url } = credentials else {
            return Err(AdapterError::Auth(format!(
                "tenant {tenant} has non oauth credentials configured for gausium"
            )));
        };

        debug!(tenant, "minting gausium access token");
        let response = self
            .client
            .post(token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(status, "oauth token endpoint"));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("oauth token response: {e}")))?;

        let cached = CachedToken {
            token: Secret::new(token.access_token),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        };
        self.tokens.insert(tenant.to_string(), cached.clone());
        Ok(cached.token)
    }

    /// Issues one authenticated GET against the open API.
    async fn get(&self, tenant: &str, path: &str, query: &[(&str, String)]) -> AdapterResult<Value> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| AdapterError::Malformed(format!("bad endpoint path {path}: {e}")))?;
        let token = self.bearer(tenant).await?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // The cached token may have been revoked server-side; drop it so
            // the next attempt mints a fresh one.
            self.tokens.remove(tenant);
        }
        if !status.is_success() {
            return Err(AdapterError::from_status(status, path));
        }
        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("{path}: {e}")))
    }

    /// Fetches every page of a list endpoint.
    async fn get_all_pages(
        &self,
        tenant: &str,
        path: &str,
        base_query: &[(&str, String)],
    ) -> AdapterResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = 1u64;
        loop {
            let mut query: Vec<(&str, String)> = base_query.to_vec();
            query.push(("page", page.to_string()));
            query.push(("pageSize", PAGE_SIZE.to_string()));

            let body = self.get(tenant, path, &query).await?;
            let parsed: GausiumPage = serde_json::from_value(body)
                .map_err(|e| AdapterError::Malformed(format!("{path}: {e}")))?;
            let page_len = parsed.list.len();
            items.extend(parsed.list);

            let last_page = parsed.page_count.map_or(page_len < PAGE_SIZE, |count| page >= count);
            if last_page {
                return Ok(items);
            }
            page += 1;
        }
    }

    /// Maps raw vendor items into records, dropping malformed items with a
    /// single log line each; the batch proceeds.
    fn map_items<T: DeserializeOwned>(&self, kind: RecordKind, items: Vec<Value>) -> Vec<T> {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let serial = lookup_path(&item, "robotSerial")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();
            let mapped = match self.mapping.map_record(kind, &item) {
                Ok(mapped) => mapped,
                Err(e) => {
                    warn!(vendor = "gausium", serial = %serial, kind = %kind, reason = %e, "dropping unmappable item");
                    continue;
                }
            };
            match serde_json::from_value::<T>(mapped) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(vendor = "gausium", serial = %serial, kind = %kind, reason = %e, "dropping incomplete item");
                }
            }
        }
        records
    }

    fn window_query(window: FetchWindow) -> Vec<(&'static str, String)> {
        vec![
            ("startTime", window.start.to_string()),
            ("endTime", window.end.to_string()),
        ]
    }
}

#[async_trait]
impl VendorAdapter for GausiumAdapter {
    fn vendor_id(&self) -> &str {
        "gausium"
    }

    fn mapping(&self) -> &VendorMappingConfig {
        &self.mapping
    }

    #[instrument(skip(self), fields(vendor = "gausium"))]
    async fn list_robots(&self, tenant: &str) -> AdapterResult<Vec<RobotSummary>> {
        let items = self.get_all_pages(tenant, "openapi/v1/robots", &[]).await?;
        debug!(tenant, robots = items.len(), "listed gausium robots");
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let serial = item.get("robotSerial")?.as_str()?.to_string();
                Some(RobotSummary {
                    serial,
                    name: item.get("robotName").and_then(Value::as_str).map(String::from),
                    model: item.get("modelType").and_then(Value::as_str).map(String::from),
                })
            })
            .collect())
    }

    #[instrument(skip(self), fields(vendor = "gausium"))]
    async fn fetch_state(&self, tenant: &str, serial: &str) -> AdapterResult<RobotState> {
        let path = format!("openapi/v1/robots/{serial}/status");
        let data = self.get(tenant, &path, &[]).await?;
        let mapped = self
            .mapping
            .map_record(RecordKind::State, &data)
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;
        serde_json::from_value(mapped).map_err(|e| AdapterError::Malformed(e.to_string()))
    }

    #[instrument(skip(self, window), fields(vendor = "gausium"))]
    async fn fetch_tasks(&self, tenant: &str, window: FetchWindow) -> AdapterResult<Vec<TaskRecord>> {
        let items = self
            .get_all_pages(tenant, "openapi/v1/task-reports", &Self::window_query(window))
            .await?;
        Ok(self.map_items(RecordKind::Task, items))
    }

    #[instrument(skip(self, window), fields(vendor = "gausium"))]
    async fn fetch_events(
        &self,
        tenant: &str,
        window: FetchWindow,
    ) -> AdapterResult<Vec<RobotEvent>> {
        let items = self
            .get_all_pages(tenant, "openapi/v1/robots/alerts", &Self::window_query(window))
            .await?;
        Ok(self.map_items(RecordKind::Event, items))
    }

    #[instrument(skip(self), fields(vendor = "gausium"))]
    async fn fetch_locations(&self, tenant: &str) -> AdapterResult<Vec<Location>> {
        let items = self.get_all_pages(tenant, "openapi/v1/sites", &[]).await?;
        Ok(self.map_items(RecordKind::Location, items))
    }

    // fetch_charging intentionally not implemented: Gausium exposes no
    // charging-session history, so the default Unsupported body applies.
}
