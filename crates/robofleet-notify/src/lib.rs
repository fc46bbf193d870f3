#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-notify** – Notification engine for robofleet.
//!
//! Consumes the trigger events produced by the change detector, applies the
//! per-trigger rule table (severity, message template, suppression window,
//! icon), renders a human-readable message with the robot's display name,
//! enforces at-most-once delivery per transition through the store-backed
//! suppression log, and delivers via HTTP. Delivery is at-least-once; the
//! receiver deduplicates further if it needs to.
//!
//! The engine never derives transitions itself: only the triggers listed by
//! the change detector arrive here, and everything else is persisted without
//! notifying.

pub mod engine;
pub mod rules;
pub mod sink;

pub use engine::{DispatchSummary, NotificationEngine};
pub use rules::{render_template, RuleSet, TriggerRule};
pub use sink::{HttpNotificationSink, NotificationPayload, NotificationSink};
