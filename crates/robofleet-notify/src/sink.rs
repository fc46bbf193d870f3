//! Notification delivery sinks.
//!
//! The production sink POSTs to the external notification API with a 10s
//! timeout and retries 5xx and network failures with the standard backoff.
//! Tests and dry runs plug in their own [`NotificationSink`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use robofleet_types::BackoffPolicy;

/// Wire payload of the notification API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Robot serial number.
    pub robot_sn: String,
    /// Severity string (`fatal`, `error`, `warning`, `event`, `info`).
    pub severity: String,
    /// Short title.
    pub title: String,
    /// Rendered message body.
    pub message: String,
    /// Icon tag.
    pub icon: String,
    /// ISO-8601 timestamp of the transition.
    pub timestamp: String,
    /// Trigger context for downstream consumers.
    pub metadata: Value,
}

/// A delivery channel for rendered notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers one notification. Implementations own their retry policy;
    /// an error here means delivery was abandoned.
    async fn send(&self, payload: &NotificationPayload) -> anyhow::Result<()>;
}

/// Delivery timeout per notification call.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP sink POSTing to `<host>/notification-api/robot/notification/send`.
pub struct HttpNotificationSink {
    client: reqwest::Client,
    endpoint: Url,
    backoff: BackoffPolicy,
}

impl HttpNotificationSink {
    /// Creates the sink against the notification API host.
    pub fn new(host: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(host)?.join("notification-api/robot/notification/send")?;
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .user_agent(concat!("robofleet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint, backoff: BackoffPolicy::default() })
    }

    async fn try_send(&self, payload: &NotificationPayload) -> Result<(), SendFailure> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| SendFailure::retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() {
            return Err(SendFailure::retryable(format!("notification API returned {status}")));
        }
        Err(SendFailure::permanent(format!("notification API returned {status}")))
    }
}

#[derive(Debug)]
struct SendFailure {
    reason: String,
    retryable: bool,
}

impl SendFailure {
    fn retryable(reason: String) -> Self {
        Self { reason, retryable: true }
    }

    fn permanent(reason: String) -> Self {
        Self { reason, retryable: false }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn send(&self, payload: &NotificationPayload) -> anyhow::Result<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_send(payload).await {
                Ok(()) => {
                    debug!(robot_sn = %payload.robot_sn, title = %payload.title, "notification delivered");
                    return Ok(());
                }
                Err(failure) if failure.retryable && self.backoff.allows_retry(attempts) => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        robot_sn = %payload.robot_sn,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %failure.reason,
                        "notification delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    return Err(anyhow::anyhow!(
                        "notification delivery abandoned after {attempts} attempts: {}",
                        failure.reason
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> NotificationPayload {
        NotificationPayload {
            robot_sn: "R1".to_string(),
            severity: "fatal".to_string(),
            title: "Battery critical".to_string(),
            message: "R1 battery dropped to 9%.".to_string(),
            icon: "battery-critical".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            metadata: json!({ "battery": 9 }),
        }
    }

    #[tokio::test]
    async fn delivers_to_the_notification_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notification-api/robot/notification/send"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpNotificationSink::new(&server.uri()).unwrap();
        sink.send(&payload()).await.unwrap();
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notification-api/robot/notification/send"))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpNotificationSink::new(&server.uri()).unwrap();
        assert!(sink.send(&payload()).await.is_err());
    }

    #[tokio::test]
    async fn server_errors_retry_then_succeed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notification-api/robot/notification/send"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/notification-api/robot/notification/send"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpNotificationSink {
            client: reqwest::Client::new(),
            endpoint: Url::parse(&server.uri())
                .unwrap()
                .join("notification-api/robot/notification/send")
                .unwrap(),
            // No jitter and a tiny base keeps the test fast.
            backoff: BackoffPolicy { base_ms: 1, jitter: 0.0, ..BackoffPolicy::default() },
        };
        sink.send(&payload()).await.unwrap();
    }
}
