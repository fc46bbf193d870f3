//! End-to-end scenarios over the fully wired platform.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::TestPlatform;

//─────────────────────────────
//  Mock vendor cloud
//─────────────────────────────

async fn mount_robot_list(server: &MockServer, serials: &[&str]) {
    let list: Vec<Value> = serials.iter().map(|sn| json!({ "sn": sn })).collect();
    Mock::given(method("GET"))
        .and(path("/api/v1/robots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "list": list }
        })))
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer, serial: &str, battery: i64, status: &str) {
    Mock::given(method("GET"))
        .and(path("/api/v1/robot/status"))
        .and(query_param("sn", serial))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": {
                "sn": serial,
                "robot_status": status,
                "battery": battery,
                "map_name": "floor-2",
                "timestamp": 1_700_000_000_000_i64
            }
        })))
        .mount(server)
        .await;
}

async fn mount_list_endpoint(server: &MockServer, endpoint: &str, items: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "list": items }
        })))
        .mount(server)
        .await;
}

async fn mount_quiet_fleet(server: &MockServer, serial: &str, battery: i64) {
    mount_robot_list(server, &[serial]).await;
    mount_status(server, serial, battery, "Working").await;
    mount_list_endpoint(server, "/api/v1/task/reports", vec![]).await;
    mount_list_endpoint(server, "/api/v1/charging/records", vec![]).await;
    mount_list_endpoint(server, "/api/v1/robot/events", vec![]).await;
}

async fn mount_notification_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/notification-api/robot/notification/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn notification_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path().ends_with("/notification/send"))
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

fn state_key(serial: &str) -> robofleet_types::Row {
    [("serial".to_string(), json!(serial))].into_iter().collect()
}

fn task_key(serial: &str, name: &str, started: i64) -> robofleet_types::Row {
    [
        ("serial".to_string(), json!(serial)),
        ("task_name".to_string(), json!(name)),
        ("started_at".to_string(), json!(started)),
    ]
    .into_iter()
    .collect()
}

use robofleet_store_core::TelemetryStore;

//─────────────────────────────
//  Polling scenarios
//─────────────────────────────

#[tokio::test]
async fn new_robot_state_inserts_without_notification() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_quiet_fleet(&vendor, "R1", 78).await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    platform.poller.clone().run_once(1_700_000_600).await;

    let row = platform
        .store
        .get_by_primary_key("tenantA", "robot_state", &state_key("R1"))
        .await
        .unwrap()
        .expect("state row inserted");
    assert_eq!(row.get("battery"), Some(&json!(78)));
    assert_eq!(row.get("state"), Some(&json!("working")));
    assert_eq!(row.get("vendor"), Some(&json!("pudu")));

    assert!(notification_bodies(&notify).await.is_empty());
    let metrics = platform.poller.metrics().await;
    assert_eq!(metrics.groups_ok, 1);
}

#[tokio::test]
async fn battery_drop_triggers_one_critical_notification() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_quiet_fleet(&vendor, "R1", 15).await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    platform.poller.clone().run_once(1_700_000_600).await;
    assert!(notification_bodies(&notify).await.is_empty());

    // The next poll observes the drop to 9%.
    vendor.reset().await;
    mount_quiet_fleet(&vendor, "R1", 9).await;
    platform.poller.clone().run_once(1_700_000_900).await;

    let bodies = notification_bodies(&notify).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["robot_sn"], "R1");
    assert_eq!(bodies[0]["severity"], "fatal");
    assert!(bodies[0]["message"].as_str().unwrap().contains("9%"));
    assert_eq!(bodies[0]["metadata"]["trigger"], "battery_critical");
}

#[tokio::test]
async fn overlapping_polls_are_idempotent() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_quiet_fleet(&vendor, "R1", 78).await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    platform.poller.clone().run_once(1_700_000_600).await;
    platform.poller.clone().run_once(1_700_000_700).await;

    let metrics = platform.poller.metrics().await;
    assert_eq!(metrics.records_written, 1);
    assert!(metrics.records_unchanged >= 1);
    assert!(notification_bodies(&notify).await.is_empty());
}

#[tokio::test]
async fn task_completion_moves_tables_and_notifies_once() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_robot_list(&vendor, &["R1"]).await;
    mount_status(&vendor, "R1", 60, "Working").await;
    mount_list_endpoint(&vendor, "/api/v1/charging/records", vec![]).await;
    mount_list_endpoint(&vendor, "/api/v1/robot/events", vec![]).await;
    mount_list_endpoint(
        &vendor,
        "/api/v1/task/reports",
        vec![json!({
            "sn": "R1",
            "task_id": "t-9",
            "task_name": "Floor2-Clean",
            "start_time": 1_700_000_000_000_i64,
            "status": 1
        })],
    )
    .await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    platform.poller.clone().run_once(1_700_000_600).await;

    let key = task_key("R1", "Floor2-Clean", 1_700_000_000);
    assert!(platform
        .store
        .get_by_primary_key("tenantA", "mnt_ongoing_tasks", &key)
        .await
        .unwrap()
        .is_some());

    // The task finishes before the next poll.
    vendor.reset().await;
    mount_robot_list(&vendor, &["R1"]).await;
    mount_status(&vendor, "R1", 55, "Free").await;
    mount_list_endpoint(&vendor, "/api/v1/charging/records", vec![]).await;
    mount_list_endpoint(&vendor, "/api/v1/robot/events", vec![]).await;
    mount_list_endpoint(
        &vendor,
        "/api/v1/task/reports",
        vec![json!({
            "sn": "R1",
            "task_id": "t-9",
            "task_name": "Floor2-Clean",
            "start_time": 1_700_000_000_000_i64,
            "end_time": 1_700_003_600_000_i64,
            "clean_area": 150.5,
            "status": 0
        })],
    )
    .await;
    platform.poller.clone().run_once(1_700_000_900).await;

    let completed = platform
        .store
        .get_by_primary_key("tenantA", "robot_tasks", &key)
        .await
        .unwrap()
        .expect("completed row present");
    assert_eq!(completed.get("actual_area"), Some(&json!(150.5)));
    assert_eq!(completed.get("status"), Some(&json!("completed")));
    assert!(platform
        .store
        .get_by_primary_key("tenantA", "mnt_ongoing_tasks", &key)
        .await
        .unwrap()
        .is_none());

    let bodies = notification_bodies(&notify).await;
    let completions: Vec<_> = bodies
        .iter()
        .filter(|b| b["metadata"]["trigger"] == "task_completed")
        .collect();
    assert_eq!(completions.len(), 1);
}

#[tokio::test]
async fn incident_event_notifies_and_files_a_report() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_robot_list(&vendor, &["R1"]).await;
    mount_status(&vendor, "R1", 60, "Working").await;
    mount_list_endpoint(&vendor, "/api/v1/task/reports", vec![]).await;
    mount_list_endpoint(&vendor, "/api/v1/charging/records", vec![]).await;
    mount_list_endpoint(
        &vendor,
        "/api/v1/robot/events",
        vec![json!({
            "sn": "R1",
            "error_id": "E-77",
            "error_level": "H7",
            "error_type": "LostLocalization",
            "error_detail": "robot lost its map",
            "timestamp": 1_700_000_100_000_i64
        })],
    )
    .await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    platform.poller.clone().run_once(1_700_000_600).await;

    let bodies = notification_bodies(&notify).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["metadata"]["trigger"], "incident");
    assert_eq!(bodies[0]["severity"], "fatal");

    // Suppression state landed in the store, so a replayed poll stays quiet.
    platform.poller.clone().run_once(1_700_000_700).await;
    assert_eq!(notification_bodies(&notify).await.len(), 1);
}

#[tokio::test]
async fn transient_vendor_failure_is_contained() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_robot_list(&vendor, &["R1"]).await;
    mount_status(&vendor, "R1", 60, "Working").await;
    mount_list_endpoint(&vendor, "/api/v1/charging/records", vec![]).await;
    mount_list_endpoint(&vendor, "/api/v1/robot/events", vec![]).await;
    // The task endpoint stays down for the whole run.
    Mock::given(method("GET"))
        .and(path("/api/v1/task/reports"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&vendor)
        .await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    platform.poller.clone().run_once(1_700_000_600).await;

    // States still landed despite the failing capability.
    assert!(platform
        .store
        .get_by_primary_key("tenantA", "robot_state", &state_key("R1"))
        .await
        .unwrap()
        .is_some());

    let metrics = platform.poller.metrics().await;
    assert_eq!(metrics.groups_partial, 1);
    let status = metrics.vendor_status.get("tenantA/pudu").unwrap();
    assert!(status.starts_with("partial"), "status was {status}");

    // Three attempts hit the broken endpoint.
    let task_calls = vendor
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/api/v1/task/reports")
        .count();
    assert_eq!(task_calls, 3);
}

//─────────────────────────────
//  Webhook scenarios
//─────────────────────────────

async fn post_webhook(router: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn pudu_webhook_body(serial: &str, battery: i64) -> Value {
    json!({
        "callback_type": "robotStatus",
        "data": {
            "sn": serial,
            "robot_status": "Working",
            "battery": battery,
            "map_name": "floor-2",
            "timestamp": 1_700_000_000_000_i64
        }
    })
}

#[tokio::test]
async fn webhook_with_empty_secret_skips_verification() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    let router = platform.webhook_router(&[("pudu", "")]);

    let (status, ack) = post_webhook(&router, "/api/pudu/webhook", pudu_webhook_body("R1", 40)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "ok");

    assert!(platform
        .store
        .get_by_primary_key("tenantA", "robot_state", &state_key("R1"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn webhook_unknown_serial_is_rejected_without_side_effects() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    let router = platform.webhook_router(&[("pudu", "")]);

    let (status, ack) =
        post_webhook(&router, "/api/pudu/webhook", pudu_webhook_body("R999", 40)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(ack["status"], "error");

    assert!(platform
        .store
        .get_by_primary_key("tenantA", "robot_state", &state_key("R999"))
        .await
        .unwrap()
        .is_none());
    assert!(notification_bodies(&notify).await.is_empty());
}

#[tokio::test]
async fn webhook_replay_inside_suppression_window_stays_quiet() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    let router = platform.webhook_router(&[("pudu", "")]);

    post_webhook(&router, "/api/pudu/webhook", pudu_webhook_body("R1", 15)).await;
    post_webhook(&router, "/api/pudu/webhook", pudu_webhook_body("R1", 9)).await;
    assert_eq!(notification_bodies(&notify).await.len(), 1);

    // Replaying the same payload changes nothing and notifies nobody.
    let (status, _) =
        post_webhook(&router, "/api/pudu/webhook", pudu_webhook_body("R1", 9)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(notification_bodies(&notify).await.len(), 1);
}

#[tokio::test]
async fn webhook_and_poller_share_one_pipeline() {
    let vendor = MockServer::start().await;
    let notify = MockServer::start().await;
    mount_quiet_fleet(&vendor, "R1", 78).await;
    mount_notification_ok(&notify).await;

    let platform = TestPlatform::new(&vendor.uri(), &notify.uri()).await;
    let router = platform.webhook_router(&[("pudu", "")]);

    // The webhook lands the snapshot first; the poll then observes the
    // same values and classifies a no-op.
    post_webhook(&router, "/api/pudu/webhook", pudu_webhook_body("R1", 78)).await;
    platform.poller.clone().run_once(1_700_000_600).await;

    let metrics = platform.poller.metrics().await;
    assert_eq!(metrics.records_written, 0);
    assert!(metrics.records_unchanged >= 1);
}
