//! The poller / work dispatcher.
//!
//! Runs on a fixed interval. Each run enumerates the enabled
//! (tenant, vendor) pairs, fetches the windowed record kinds for each pair
//! under a bounded worker pool, and hands every partition to the shared
//! ingestion pipeline. The fetch window reaches back two intervals so one
//! missed run loses nothing; overlap is harmless because change detection
//! is idempotent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use robofleet_adapters::{
    AdapterError, AdapterRegistry, AdapterResult, FetchWindow, VendorAdapter,
};
use robofleet_catalog::{RoutingTable, TenantCatalog};
use robofleet_types::{BackoffPolicy, NormalizedRecord, RecordPayload};

use crate::ingest::{IngestPipeline, IngestSummary};

/// Concurrent per-robot state fetches inside one fetch group.
const STATE_FETCH_CONCURRENCY: usize = 4;

//─────────────────────────────
//  Configuration and metrics
//─────────────────────────────

/// Poller tuning knobs.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Seconds between runs.
    pub interval_secs: u64,
    /// Worker pool bound; each worker handles one (tenant, vendor) group.
    pub pool_size: usize,
    /// A tick is skipped when in-flight groups exceed
    /// `pool_size * backpressure_factor`.
    pub backpressure_factor: usize,
    /// Maximum age of an ongoing-task staging row before the sweep.
    pub ongoing_max_age_secs: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            pool_size: 8.min(num_cpus::get().max(1)),
            backpressure_factor: 4,
            ongoing_max_age_secs: crate::lifecycle::DEFAULT_ONGOING_MAX_AGE_SECS,
        }
    }
}

/// Running totals kept for the health surface.
#[derive(Debug, Clone, Default)]
pub struct PollerMetrics {
    /// Completed runs.
    pub runs: u64,
    /// Ticks skipped due to saturation.
    pub ticks_skipped: u64,
    /// Fetch groups that completed without failures.
    pub groups_ok: u64,
    /// Fetch groups that ingested some kinds but failed others.
    pub groups_partial: u64,
    /// Fetch groups that produced nothing.
    pub groups_failed: u64,
    /// Rows written across all runs.
    pub records_written: u64,
    /// Records dropped across all runs.
    pub records_dropped: u64,
    /// No-op records across all runs.
    pub records_unchanged: u64,
    /// Notifications delivered.
    pub notifications_sent: u64,
    /// Notifications suppressed.
    pub notifications_suppressed: u64,
    /// Seconds-since-epoch of the last completed run.
    pub last_run_at: Option<i64>,
    /// Last observed status per "tenant/vendor" pair, for health checks.
    pub vendor_status: BTreeMap<String, String>,
}

//─────────────────────────────
//  Poller
//─────────────────────────────

/// Outcome of one fetch group.
struct GroupOutcome {
    summary: IngestSummary,
    failures: Vec<String>,
}

/// The interval-driven work dispatcher.
pub struct Poller {
    catalog: Arc<TenantCatalog>,
    routing: Arc<RoutingTable>,
    registry: Arc<AdapterRegistry>,
    pipeline: Arc<IngestPipeline>,
    config: PollerConfig,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<RwLock<PollerMetrics>>,
    backoff: BackoffPolicy,
}

impl Poller {
    /// Wires a poller over the shared startup objects.
    pub fn new(
        catalog: Arc<TenantCatalog>,
        routing: Arc<RoutingTable>,
        registry: Arc<AdapterRegistry>,
        pipeline: Arc<IngestPipeline>,
        config: PollerConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.pool_size));
        Arc::new(Self {
            catalog,
            routing,
            registry,
            pipeline,
            config,
            cancel,
            semaphore,
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(RwLock::new(PollerMetrics::default())),
            backoff: BackoffPolicy::default(),
        })
    }

    /// A snapshot of the running totals.
    pub async fn metrics(&self) -> PollerMetrics {
        self.metrics.read().await.clone()
    }

    /// Runs until cancelled, one dispatch per interval tick.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval_secs,
            pool_size = self.config.pool_size,
            "poller started"
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("poller stopping on cancellation");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    self.clone().run_once(now).await;
                }
            }
        }
    }

    /// Executes one run at time `now`.
    pub async fn run_once(self: Arc<Self>, now: i64) {
        let threshold = self.config.pool_size * self.config.backpressure_factor;
        if self.in_flight.load(Ordering::SeqCst) >= threshold.max(1) {
            warn!(
                in_flight = self.in_flight.load(Ordering::SeqCst),
                threshold, "worker queue saturated, skipping tick"
            );
            self.metrics.write().await.ticks_skipped += 1;
            return;
        }

        let window = FetchWindow {
            start: now - 2 * self.config.interval_secs as i64,
            end: now,
        };
        let pairs = self.catalog.enabled_pairs();
        debug!(pairs = pairs.len(), ?window, "dispatching fetch groups");

        let mut handles = Vec::with_capacity(pairs.len());
        for (tenant, vendor) in pairs {
            if self.cancel.is_cancelled() {
                break;
            }
            let this = self.clone();
            this.in_flight.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(async move {
                let _permit = this.semaphore.clone().acquire_owned().await.ok();
                let outcome = this.fetch_group(&tenant, &vendor, window).await;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
                (tenant, vendor, outcome)
            }));
        }

        for handle in handles {
            let Ok((tenant, vendor, outcome)) = handle.await else {
                error!("fetch group worker panicked");
                continue;
            };
            self.record_group(&tenant, &vendor, outcome).await;
        }

        // One sweep per database per run keeps the staging table bounded.
        for database in self.routing.databases() {
            let serials = self.routing.serials_for(&database);
            if let Err(e) = self
                .pipeline
                .lifecycle()
                .sweep(&database, &serials, self.config.ongoing_max_age_secs, now)
                .await
            {
                error!(database = %database, error = %e, "ongoing-task sweep failed");
            }
        }

        let mut metrics = self.metrics.write().await;
        metrics.runs += 1;
        metrics.last_run_at = Some(now);
    }

    async fn record_group(&self, tenant: &str, vendor: &str, outcome: Option<GroupOutcome>) {
        let key = format!("{tenant}/{vendor}");
        let mut metrics = self.metrics.write().await;
        match outcome {
            Some(group) => {
                metrics.records_written += group.summary.written as u64;
                metrics.records_dropped += group.summary.dropped as u64;
                metrics.records_unchanged += group.summary.unchanged as u64;
                metrics.notifications_sent += group.summary.notifications.sent as u64;
                metrics.notifications_suppressed += group.summary.notifications.suppressed as u64;
                if group.failures.is_empty() {
                    metrics.groups_ok += 1;
                    metrics.vendor_status.insert(key, "ok".to_string());
                } else {
                    metrics.groups_partial += 1;
                    warn!(tenant, vendor, failures = ?group.failures, "fetch group partially failed");
                    metrics.vendor_status.insert(key, format!("partial: {}", group.failures.join("; ")));
                }
            }
            None => {
                metrics.groups_failed += 1;
                metrics.vendor_status.insert(key, "failed".to_string());
            }
        }
    }

    /// Fetches and ingests one (tenant, vendor) group. Returns `None` when
    /// the whole group produced nothing (unknown vendor or cancellation).
    async fn fetch_group(
        &self,
        tenant: &str,
        vendor: &str,
        window: FetchWindow,
    ) -> Option<GroupOutcome> {
        let Some(adapter) = self.registry.get(vendor) else {
            error!(tenant, vendor, "no adapter registered for enabled vendor");
            return None;
        };

        let mut failures = Vec::new();

        // The four windowed kinds fetch concurrently; per-serial ordering is
        // restored when the merged batch is ingested.
        let (states, tasks, charging, events, locations) = tokio::join!(
            self.fetch_states(adapter.clone(), tenant),
            self.with_retry("fetch_tasks", || adapter.fetch_tasks(tenant, window)),
            self.with_retry("fetch_charging", || adapter.fetch_charging(tenant, window)),
            self.with_retry("fetch_events", || adapter.fetch_events(tenant, window)),
            self.with_retry("fetch_locations", || adapter.fetch_locations(tenant)),
        );

        if self.cancel.is_cancelled() {
            // In-flight fetches were allowed to complete; their results are
            // side-effect-free and get discarded here.
            debug!(tenant, vendor, "discarding fetched records after cancellation");
            return None;
        }

        let mut records: Vec<NormalizedRecord> = Vec::new();
        let mut collect = |outcome: AdapterResult<Vec<RecordPayload>>, what: &str| match outcome {
            Ok(payloads) => {
                records.extend(payloads.into_iter().map(|p| NormalizedRecord::new(vendor, p)));
            }
            Err(AdapterError::Unsupported { .. }) => {
                debug!(tenant, vendor, capability = what, "capability unsupported, skipping");
            }
            Err(e) => {
                error!(tenant, vendor, capability = what, error = %e, "fetch failed");
                failures.push(format!("{what}: {e}"));
            }
        };

        collect(states.map(payloads(RecordPayload::State)), "fetch_state");
        collect(tasks.map(payloads(RecordPayload::Task)), "fetch_tasks");
        collect(charging.map(payloads(RecordPayload::Charging)), "fetch_charging");
        collect(events.map(payloads(RecordPayload::Event)), "fetch_events");
        collect(locations.map(payloads(RecordPayload::Location)), "fetch_locations");

        let summary = self.pipeline.ingest(tenant, records).await;
        info!(
            tenant,
            vendor,
            written = summary.written,
            unchanged = summary.unchanged,
            dropped = summary.dropped,
            sent = summary.notifications.sent,
            "fetch group ingested"
        );
        Some(GroupOutcome { summary, failures })
    }

    /// Lists robots and snapshots each one's state, tolerating individual
    /// robot failures.
    async fn fetch_states(
        &self,
        adapter: Arc<dyn VendorAdapter>,
        tenant: &str,
    ) -> AdapterResult<Vec<robofleet_types::RobotState>> {
        let robots = match self.with_retry("list_robots", || adapter.list_robots(tenant)).await {
            Ok(robots) => robots,
            Err(AdapterError::Unsupported { vendor, .. }) => {
                return Err(AdapterError::Unsupported { vendor, capability: "fetch_state" })
            }
            Err(e) => return Err(e),
        };

        let states: Vec<_> = stream::iter(robots)
            .map(|robot| {
                let adapter = adapter.clone();
                async move {
                    let result = self
                        .with_retry("fetch_state", || adapter.fetch_state(tenant, &robot.serial))
                        .await;
                    (robot.serial, result)
                }
            })
            .buffer_unordered(STATE_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut out = Vec::with_capacity(states.len());
        for (serial, result) in states {
            match result {
                Ok(state) => out.push(state),
                Err(e) => warn!(tenant, serial = %serial, error = %e, "state snapshot failed"),
            }
        }
        Ok(out)
    }

    /// Retries transient failures with the standard backoff; everything
    /// else surfaces immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> AdapterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = AdapterResult<T>>,
    {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.backoff.allows_retry(attempts) => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        capability = what,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Adapts a typed record list into payloads for merging.
fn payloads<T>(wrap: fn(T) -> RecordPayload) -> impl Fn(Vec<T>) -> Vec<RecordPayload> {
    move |items| items.into_iter().map(wrap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use robofleet_notify::{NotificationEngine, NotificationPayload, NotificationSink};
    use robofleet_store_core::TelemetryStore;
    use robofleet_store_sqlite::SqliteStore;
    use robofleet_types::{
        RobotOperationalState, RobotState, TaskRecord, TaskStatus,
    };
    use robofleet_adapters::{RobotSummary, VendorMappingConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct NullSink {
        payloads: Mutex<Vec<NotificationPayload>>,
    }

    #[async_trait]
    impl NotificationSink for NullSink {
        async fn send(&self, payload: &NotificationPayload) -> anyhow::Result<()> {
            self.payloads.lock().await.push(payload.clone());
            Ok(())
        }
    }

    /// Adapter stub serving canned records for one robot.
    struct StubAdapter {
        vendor: &'static str,
        serial: &'static str,
        battery: i64,
        mapping: VendorMappingConfig,
        task_failures: AtomicU32,
        fail_tasks: bool,
    }

    impl StubAdapter {
        fn new(vendor: &'static str, serial: &'static str, battery: i64, fail_tasks: bool) -> Self {
            Self {
                vendor,
                serial,
                battery,
                mapping: VendorMappingConfig::default(),
                task_failures: AtomicU32::new(0),
                fail_tasks,
            }
        }
    }

    #[async_trait]
    impl VendorAdapter for StubAdapter {
        fn vendor_id(&self) -> &str {
            self.vendor
        }

        fn mapping(&self) -> &VendorMappingConfig {
            &self.mapping
        }

        async fn list_robots(&self, _tenant: &str) -> AdapterResult<Vec<RobotSummary>> {
            Ok(vec![RobotSummary { serial: self.serial.to_string(), name: None, model: None }])
        }

        async fn fetch_state(&self, _tenant: &str, serial: &str) -> AdapterResult<RobotState> {
            Ok(RobotState {
                serial: serial.to_string(),
                state: RobotOperationalState::Working,
                battery: self.battery,
                pos_x: None,
                pos_y: None,
                pos_yaw: None,
                map_id: None,
                reported_at: 1_700_000_000,
            })
        }

        async fn fetch_tasks(
            &self,
            _tenant: &str,
            _window: FetchWindow,
        ) -> AdapterResult<Vec<TaskRecord>> {
            if self.fail_tasks {
                self.task_failures.fetch_add(1, Ordering::SeqCst);
                return Err(AdapterError::Transient("vendor flaking".to_string()));
            }
            Ok(vec![TaskRecord {
                serial: self.serial.to_string(),
                task_id: "t-1".to_string(),
                task_name: "Sweep".to_string(),
                mode: None,
                planned_area: None,
                actual_area: None,
                duration_secs: None,
                water_ml: None,
                energy_wh: None,
                battery_usage: None,
                started_at: 1_700_000_000,
                ended_at: None,
                status: TaskStatus::InProgress,
                map_id: None,
                subtasks: None,
            }])
        }
    }

    const CATALOG: &str = r#"
tenants:
  tenantA:
    v1:
      api_key: "k"
      api_secret: "s"
  tenantB:
    v2:
      api_key: "k"
      api_secret: "s"
"#;

    const ROUTING: &str = r#"
databases:
  tenantA: [R2]
  tenantB: [R3]
"#;

    async fn build_poller(
        adapters: Vec<Arc<dyn VendorAdapter>>,
        config: PollerConfig,
    ) -> (Arc<Poller>, Arc<SqliteStore>, CancellationToken) {
        let catalog = Arc::new(TenantCatalog::from_str(CATALOG).unwrap());
        let routing = Arc::new(RoutingTable::from_str(ROUTING).unwrap());
        let store = Arc::new(
            SqliteStore::in_memory(&["tenantA".to_string(), "tenantB".to_string()])
                .await
                .unwrap(),
        );
        let sink = Arc::new(NullSink::default());
        let notifier = Arc::new(NotificationEngine::new(sink, store.clone(), routing.clone()));
        let pipeline = Arc::new(IngestPipeline::new(routing.clone(), store.clone(), notifier));

        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter).unwrap();
        }
        let cancel = CancellationToken::new();
        let poller = Poller::new(
            catalog,
            routing,
            Arc::new(registry),
            pipeline,
            config,
            cancel.clone(),
        );
        (poller, store, cancel)
    }

    fn state_key(serial: &str) -> robofleet_types::Row {
        [("serial".to_string(), json!(serial))].into_iter().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn one_run_persists_states_and_stages_tasks() {
        let adapter = Arc::new(StubAdapter::new("v1", "R2", 80, false));
        let (poller, store, _cancel) =
            build_poller(vec![adapter], PollerConfig::default()).await;

        poller.clone().run_once(1_700_000_600).await;

        assert!(store
            .get_by_primary_key("tenantA", "robot_state", &state_key("R2"))
            .await
            .unwrap()
            .is_some());
        let metrics = poller.metrics().await;
        assert_eq!(metrics.runs, 1);
        assert_eq!(metrics.groups_ok, 1);
        assert_eq!(metrics.vendor_status.get("tenantA/v1"), Some(&"ok".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_vendor_failure_is_retried_and_contained() {
        let flaky: Arc<StubAdapter> = Arc::new(StubAdapter::new("v2", "R3", 70, true));
        let healthy = Arc::new(StubAdapter::new("v1", "R2", 80, false));
        let (poller, store, _cancel) =
            build_poller(vec![healthy, flaky.clone()], PollerConfig::default()).await;

        poller.clone().run_once(1_700_000_600).await;

        // Three attempts, then give up; the healthy tenant is unaffected.
        assert_eq!(flaky.task_failures.load(Ordering::SeqCst), 3);
        assert!(store
            .get_by_primary_key("tenantA", "robot_state", &state_key("R2"))
            .await
            .unwrap()
            .is_some());
        // The flaky vendor still delivered its states.
        assert!(store
            .get_by_primary_key("tenantB", "robot_state", &state_key("R3"))
            .await
            .unwrap()
            .is_some());

        let metrics = poller.metrics().await;
        assert_eq!(metrics.groups_ok, 1);
        assert_eq!(metrics.groups_partial, 1);
        let status = metrics.vendor_status.get("tenantB/v2").unwrap();
        assert!(status.starts_with("partial"), "status: {status}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_fetched_records() {
        let adapter = Arc::new(StubAdapter::new("v1", "R2", 80, false));
        let (poller, store, cancel) =
            build_poller(vec![adapter], PollerConfig::default()).await;

        cancel.cancel();
        poller.clone().run_once(1_700_000_600).await;

        assert!(store
            .get_by_primary_key("tenantA", "robot_state", &state_key("R2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_skips_the_tick() {
        let adapter = Arc::new(StubAdapter::new("v1", "R2", 80, false));
        let config = PollerConfig { pool_size: 1, backpressure_factor: 1, ..PollerConfig::default() };
        let (poller, store, _cancel) = build_poller(vec![adapter], config).await;

        // Simulate a fetch group still in flight from a previous tick.
        poller.in_flight.fetch_add(1, Ordering::SeqCst);
        poller.clone().run_once(1_700_000_600).await;

        assert_eq!(poller.metrics().await.ticks_skipped, 1);
        assert!(store
            .get_by_primary_key("tenantA", "robot_state", &state_key("R2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn window_reaches_back_two_intervals() {
        let config = PollerConfig { interval_secs: 300, ..PollerConfig::default() };
        let now = 1_700_000_600;
        let window = FetchWindow { start: now - 2 * config.interval_secs as i64, end: now };
        assert_eq!(window.start, 1_700_000_000);
        assert_eq!(window.end - window.start, 600);
    }
}
