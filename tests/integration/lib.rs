//! Cross-crate integration suite for robofleet.
//!
//! Wires real adapters, the SQLite store, the pipeline, the poller, the
//! webhook router, and the HTTP notification sink against mock vendor and
//! notification servers, then drives the end-to-end scenarios the platform
//! guarantees: idempotent ingestion, trigger-once notifications, the task
//! lifecycle, and failure containment between tenants.

pub mod common;

#[cfg(test)]
mod scenarios;
