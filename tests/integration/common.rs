//! Shared harness: a fully wired platform over mock HTTP servers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use robofleet_adapters::{AdapterRegistry, PuduAdapter, VendorMappingConfig};
use robofleet_catalog::{RoutingTable, TenantCatalog};
use robofleet_notify::{HttpNotificationSink, NotificationEngine};
use robofleet_pipeline::{IngestPipeline, Poller, PollerConfig};
use robofleet_store_sqlite::SqliteStore;
use robofleet_webhook::WebhookState;

/// The shipped Pudu mapping document; tests run against the real one so a
/// config regression fails here first.
pub const PUDU_MAPPING: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/vendors/pudu.yaml"));

const CATALOG: &str = r#"
tenants:
  tenantA:
    pudu:
      enabled: true
      api_key: "itest-key"
      api_secret: "itest-secret"
"#;

const ROUTING: &str = r#"
databases:
  tenantA: [R1, R2]
robot_names:
  R1: "Lobby Scrubber"
"#;

/// A fully wired platform over in-memory databases and mock HTTP servers.
pub struct TestPlatform {
    pub store: Arc<SqliteStore>,
    pub routing: Arc<RoutingTable>,
    pub catalog: Arc<TenantCatalog>,
    pub registry: Arc<AdapterRegistry>,
    pub pipeline: Arc<IngestPipeline>,
    pub poller: Arc<Poller>,
    pub cancel: CancellationToken,
}

impl TestPlatform {
    /// Builds the platform with the Pudu adapter pointed at `vendor_base`
    /// and the notification sink pointed at `notify_base`.
    pub async fn new(vendor_base: &str, notify_base: &str) -> Self {
        let catalog = Arc::new(TenantCatalog::from_str(CATALOG).unwrap());
        let routing = Arc::new(RoutingTable::from_str(ROUTING).unwrap());
        let store =
            Arc::new(SqliteStore::in_memory(&["tenantA".to_string()]).await.unwrap());

        let mapping = VendorMappingConfig::from_str(PUDU_MAPPING).unwrap();
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(
                PuduAdapter::new(vendor_base, mapping, catalog.clone()).unwrap(),
            ))
            .unwrap();
        let registry = Arc::new(registry);

        let sink = Arc::new(HttpNotificationSink::new(notify_base).unwrap());
        let notifier = Arc::new(NotificationEngine::new(sink, store.clone(), routing.clone()));
        let pipeline = Arc::new(IngestPipeline::new(routing.clone(), store.clone(), notifier));

        let cancel = CancellationToken::new();
        let poller = Poller::new(
            catalog.clone(),
            routing.clone(),
            registry.clone(),
            pipeline.clone(),
            PollerConfig::default(),
            cancel.clone(),
        );

        Self { store, routing, catalog, registry, pipeline, poller, cancel }
    }

    /// Builds the webhook router over the same pipeline, with the given
    /// per-vendor secrets.
    pub fn webhook_router(&self, secrets: &[(&str, &str)]) -> axum::Router {
        let secrets: HashMap<String, String> = secrets
            .iter()
            .map(|(vendor, secret)| (vendor.to_string(), secret.to_string()))
            .collect();
        let state = WebhookState::new(
            self.registry.clone(),
            self.routing.clone(),
            self.pipeline.clone(),
            secrets,
        );
        robofleet_webhook::router(state)
    }
}
