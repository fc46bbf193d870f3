#![forbid(unsafe_code)]

//! **robofleet-service** – Main service binary for robofleet.
//!
//! Wires the startup catalog, routing table, vendor adapters, SQLite store,
//! notification engine, poller, and webhook ingress into one long-running
//! process. Configuration errors at startup are fatal with a non-zero exit;
//! runtime errors are contained inside the pipeline and never terminate the
//! process.
//!
//! ## Usage
//!
//! ```bash
//! # Start with the default configuration layout
//! robofleet-service --config-dir config --data-dir data
//!
//! # Override the polling cadence and HTTP port
//! robofleet-service --poll-interval-secs 60 --port 9090
//! ```

use std::collections::HashMap;
use std::future::IntoFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use robofleet_adapters::{AdapterRegistry, GausiumAdapter, PuduAdapter, VendorMappingConfig};
use robofleet_catalog::{RoutingTable, TenantCatalog};
use robofleet_notify::{HttpNotificationSink, NotificationEngine};
use robofleet_pipeline::{IngestPipeline, Poller, PollerConfig};
use robofleet_store_sqlite::SqliteStore;
use robofleet_webhook::WebhookState;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "robofleet-service")]
#[command(about = "robofleet - multi-vendor fleet telemetry ingestion and distribution")]
#[command(version)]
struct Cli {
    /// Directory holding tenants.yaml, routing.yaml, and vendors/*.yaml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Directory holding one SQLite database file per tenant
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// HTTP port for webhook ingress and health checks
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Seconds between polling runs
    #[arg(long, default_value = "300")]
    poll_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Notification API host
    #[arg(long, env = "NOTIFICATION_HOST", default_value = "http://localhost:9090")]
    notification_host: String,

    /// Pudu cloud API base URL
    #[arg(long, env = "PUDU_BASE_URL", default_value = "https://open.pudu.example.com")]
    pudu_base_url: String,

    /// Gausium open API base URL
    #[arg(long, env = "GAUSIUM_BASE_URL", default_value = "https://openapi.gausium.example.com")]
    gausium_base_url: String,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting robofleet v{}", env!("CARGO_PKG_VERSION"));

    // Startup configuration; any failure here exits non-zero.
    let catalog = Arc::new(
        TenantCatalog::from_file(cli.config_dir.join("tenants.yaml"))
            .context("failed to load tenant catalog")?,
    );
    let routing = Arc::new(
        RoutingTable::from_file(cli.config_dir.join("routing.yaml"))
            .context("failed to load routing table")?,
    );

    let store = Arc::new(
        SqliteStore::open(&cli.data_dir, &routing.databases())
            .await
            .context("failed to open tenant databases")?,
    );
    info!(databases = routing.databases().len(), "tenant databases ready");

    let registry = Arc::new(
        build_registry(&cli, &cli.config_dir.join("vendors"), catalog.clone())
            .context("failed to build vendor adapters")?,
    );
    info!(vendors = ?registry.vendors(), "vendor adapters registered");

    let sink = Arc::new(
        HttpNotificationSink::new(&cli.notification_host)
            .context("invalid notification host")?,
    );
    let notifier = Arc::new(NotificationEngine::new(sink, store.clone(), routing.clone()));
    let pipeline = Arc::new(IngestPipeline::new(routing.clone(), store.clone(), notifier));

    let cancel = CancellationToken::new();
    let poller_config = PollerConfig {
        interval_secs: cli.poll_interval_secs,
        ..PollerConfig::default()
    };
    let poller = Poller::new(
        catalog.clone(),
        routing.clone(),
        registry.clone(),
        pipeline.clone(),
        poller_config,
        cancel.clone(),
    );

    // Webhook ingress shares the pipeline and reads per-vendor secrets from
    // the environment; an empty secret disables verification for staging.
    let secrets = webhook_secrets(&registry.vendors());
    let webhook_state = WebhookState::new(registry, routing, pipeline, secrets);

    let app = Router::new()
        .route("/health", get(service_health))
        .with_state(poller.clone())
        .merge(robofleet_webhook::router(webhook_state));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;
    info!("HTTP server listening on port {}", cli.port);

    let poller_handle = tokio::spawn(poller.clone().run());
    let server = axum::serve(listener, app).into_future();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    // Graceful shutdown: stop dispatching, let in-flight work settle.
    cancel.cancel();
    if let Err(e) = poller_handle.await {
        warn!("poller task ended abnormally: {}", e);
    }
    store.close().await;
    info!("robofleet stopped");
    Ok(())
}

//─────────────────────────────
//  Wiring helpers
//─────────────────────────────

/// Registers one adapter per vendor mapping file found in `vendors_dir`.
/// Adding a vendor means dropping in a new mapping file and registering its
/// adapter here; the pipeline itself never changes.
fn build_registry(
    cli: &Cli,
    vendors_dir: &Path,
    catalog: Arc<TenantCatalog>,
) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();

    let pudu_mapping = vendors_dir.join("pudu.yaml");
    if pudu_mapping.exists() {
        let mapping = VendorMappingConfig::from_file(&pudu_mapping)?;
        let adapter = PuduAdapter::new(&cli.pudu_base_url, mapping, catalog.clone())?;
        registry.register(Arc::new(adapter))?;
    } else {
        warn!(path = %pudu_mapping.display(), "no pudu mapping file, vendor disabled");
    }

    let gausium_mapping = vendors_dir.join("gausium.yaml");
    if gausium_mapping.exists() {
        let mapping = VendorMappingConfig::from_file(&gausium_mapping)?;
        let adapter = GausiumAdapter::new(&cli.gausium_base_url, mapping, catalog)?;
        registry.register(Arc::new(adapter))?;
    } else {
        warn!(path = %gausium_mapping.display(), "no gausium mapping file, vendor disabled");
    }

    if registry.vendors().is_empty() {
        return Err(anyhow::anyhow!(
            "no vendor mapping files found in {}",
            vendors_dir.display()
        ));
    }
    Ok(registry)
}

/// Reads `ROBOFLEET_WEBHOOK_SECRET_<VENDOR>` for every registered vendor.
fn webhook_secrets(vendors: &[String]) -> HashMap<String, String> {
    let mut secrets = HashMap::new();
    for vendor in vendors {
        let var = format!("ROBOFLEET_WEBHOOK_SECRET_{}", vendor.to_uppercase());
        let secret = std::env::var(&var).unwrap_or_default();
        if secret.is_empty() {
            warn!(vendor = %vendor, "webhook verification disabled (no secret configured)");
        }
        secrets.insert(vendor.clone(), secret);
    }
    secrets
}

//─────────────────────────────
//  HTTP handlers
//─────────────────────────────

async fn service_health(State(poller): State<Arc<Poller>>) -> Json<Value> {
    let metrics = poller.metrics().await;
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "poller": {
            "runs": metrics.runs,
            "ticks_skipped": metrics.ticks_skipped,
            "groups_ok": metrics.groups_ok,
            "groups_partial": metrics.groups_partial,
            "groups_failed": metrics.groups_failed,
            "records_written": metrics.records_written,
            "records_dropped": metrics.records_dropped,
            "records_unchanged": metrics.records_unchanged,
            "notifications_sent": metrics.notifications_sent,
            "notifications_suppressed": metrics.notifications_suppressed,
            "last_run_at": metrics.last_run_at,
            "vendor_status": metrics.vendor_status,
        },
    }))
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_logging(log_level: &str) -> Result<()> {
    let log_filter = format!(
        "robofleet_service={level},robofleet_pipeline={level},robofleet_adapters={level},\
         robofleet_webhook={level},robofleet_notify={level},robofleet_store_sqlite={level}",
        level = log_level
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
