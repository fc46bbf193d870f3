#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-adapters** – Vendor abstraction layer for robofleet.
//!
//! One adapter per vendor translates the uniform capability interface to the
//! vendor's HTTP API and translates vendor payloads into the internal record
//! model. Translation is driven by a declarative per-vendor mapping document
//! (see [`mapping`]); the adapters themselves contain only endpoint shapes,
//! authentication flows, and pagination. Adding a vendor means a new mapping
//! file plus one thin adapter, never new code paths in the core.
//!
//! Every capability call takes a tenant identifier used to select
//! credentials from the startup catalog, and fails with one of the five
//! error kinds of [`AdapterError`]. Capabilities a vendor does not offer
//! surface as an explicit `Unsupported` error, never as silent emptiness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use robofleet_types::{
    ChargingSession, Location, RobotEvent, RobotState, TaskRecord,
};

pub mod gausium;
pub mod mapping;
pub mod pudu;
pub mod registry;

pub use gausium::GausiumAdapter;
pub use mapping::{
    Conversion, FieldMapping, MappingError, VendorMappingConfig, VerificationMethod,
    WebhookVerification,
};
pub use pudu::PuduAdapter;
pub use registry::{AdapterRegistry, VendorDetection};

//─────────────────────────────
//  Failure contract
//─────────────────────────────

/// The failure contract of every capability call.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Vendor rejected our credentials. Surfaced immediately; never retried.
    #[error("vendor authentication failed: {0}")]
    Auth(String),
    /// Network trouble or vendor-side 5xx. Retried by the poller with the
    /// standard backoff policy.
    #[error("transient vendor error: {0}")]
    Transient(String),
    /// The vendor returned a payload we cannot interpret. Surfaced
    /// immediately; never retried.
    #[error("malformed vendor payload: {0}")]
    Malformed(String),
    /// The vendor does not offer this capability.
    #[error("vendor {vendor} does not support {capability}")]
    Unsupported {
        /// The vendor lacking the capability.
        vendor: String,
        /// The capability that was requested.
        capability: &'static str,
    },
    /// The call was cancelled by the global cancellation signal.
    #[error("vendor call cancelled")]
    Cancelled,
}

impl AdapterError {
    /// True for errors the caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classifies a transport-level failure from the HTTP client.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            // Timeouts, connection failures, and request-level trouble are
            // all worth another attempt.
            Self::Transient(err.to_string())
        }
    }

    /// Classifies a non-success HTTP status from a vendor endpoint.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Self::Auth(format!("{context}: HTTP {status}"))
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::Transient(format!("{context}: HTTP {status}"))
        } else {
            Self::Malformed(format!("{context}: HTTP {status}"))
        }
    }
}

/// Result alias for capability calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

//─────────────────────────────
//  Capability surface
//─────────────────────────────

/// Minimal robot metadata returned by `list_robots`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotSummary {
    /// Robot serial number.
    pub serial: String,
    /// Vendor display name, when the vendor reports one.
    pub name: Option<String>,
    /// Vendor model identifier, when the vendor reports one.
    pub model: Option<String>,
}

/// Half-open time window `[start, end)` in seconds since epoch for the
/// windowed fetch capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    /// Window start, inclusive.
    pub start: i64,
    /// Window end, exclusive.
    pub end: i64,
}

/// The uniform capability interface every vendor adapter presents.
///
/// Default method bodies return [`AdapterError::Unsupported`] so adapters
/// implement only the capabilities their API offers, and absence is always
/// explicit for the caller.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    /// Stable identifier of this vendor, e.g. `"pudu"`.
    fn vendor_id(&self) -> &str;

    /// The declarative mapping document driving payload translation for
    /// this vendor; also used by the webhook ingress for verification and
    /// vendor auto-detection.
    fn mapping(&self) -> &VendorMappingConfig;

    /// Enumerates the robots visible to a tenant.
    async fn list_robots(&self, _tenant: &str) -> AdapterResult<Vec<RobotSummary>> {
        Err(AdapterError::Unsupported {
            vendor: self.vendor_id().to_string(),
            capability: "list_robots",
        })
    }

    /// Fetches the current state snapshot of one robot.
    async fn fetch_state(&self, _tenant: &str, _serial: &str) -> AdapterResult<RobotState> {
        Err(AdapterError::Unsupported {
            vendor: self.vendor_id().to_string(),
            capability: "fetch_state",
        })
    }

    /// Fetches tasks that started inside the window.
    async fn fetch_tasks(&self, _tenant: &str, _window: FetchWindow) -> AdapterResult<Vec<TaskRecord>> {
        Err(AdapterError::Unsupported {
            vendor: self.vendor_id().to_string(),
            capability: "fetch_tasks",
        })
    }

    /// Fetches charging sessions that started inside the window.
    async fn fetch_charging(
        &self,
        _tenant: &str,
        _window: FetchWindow,
    ) -> AdapterResult<Vec<ChargingSession>> {
        Err(AdapterError::Unsupported {
            vendor: self.vendor_id().to_string(),
            capability: "fetch_charging",
        })
    }

    /// Fetches events that occurred inside the window.
    async fn fetch_events(
        &self,
        _tenant: &str,
        _window: FetchWindow,
    ) -> AdapterResult<Vec<RobotEvent>> {
        Err(AdapterError::Unsupported {
            vendor: self.vendor_id().to_string(),
            capability: "fetch_events",
        })
    }

    /// Fetches the buildings a tenant's fleet operates in.
    async fn fetch_locations(&self, _tenant: &str) -> AdapterResult<Vec<Location>> {
        Err(AdapterError::Unsupported {
            vendor: self.vendor_id().to_string(),
            capability: "fetch_locations",
        })
    }
}
