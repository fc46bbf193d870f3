#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-pipeline** – The ingestion pipeline for robofleet.
//!
//! This crate wires the four tightly coupled stages of the platform into
//! one path shared by the interval poller and the webhook ingress:
//!
//! - **Normalizer**: invariant enforcement and serial → database routing
//! - **Change detector**: type-aware diff against stored state, the sole
//!   producer of notification triggers
//! - **Persistence hand-off**: idempotent batch upserts plus the two-table
//!   task lifecycle
//! - **Notification hand-off**: triggers dispatch only after their backing
//!   write committed
//!
//! The poller drives this path on a fixed interval under a bounded worker
//! pool; the webhook ingress drives it per request. Errors contain at the
//! smallest unit of work throughout: record < batch < worker < run.

pub mod detect;
pub mod equality;
pub mod ingest;
pub mod lifecycle;
pub mod normalize;
pub mod poller;

pub use detect::{ChangeDetector, Classified};
pub use equality::{diff_rows, values_equal};
pub use ingest::{IngestPipeline, IngestSummary};
pub use lifecycle::{LifecycleSummary, TaskLifecycleManager, DEFAULT_ONGOING_MAX_AGE_SECS};
pub use normalize::{coerce_row_value, NormalizeOutcome, Normalizer};
pub use poller::{Poller, PollerConfig, PollerMetrics};
