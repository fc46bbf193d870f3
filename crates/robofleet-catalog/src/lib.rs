#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **robofleet-catalog** – Startup-loaded configuration for robofleet.
//!
//! Two configuration documents drive the ingestion pipeline: the tenant
//! credential catalog (which tenants exist and which vendors each has
//! enabled, with the credentials to reach them) and the database routing
//! table (which robot serial belongs to which tenant database). Both are
//! loaded once at startup, validated eagerly, and shared read-only across
//! workers for the lifetime of the process. Hot reload is not supported;
//! changes require a restart.
//!
//! Every validation failure here is a fatal configuration error: the
//! service refuses to start rather than run with an ambiguous fleet.

pub mod catalog;
pub mod routing;

pub use catalog::{TenantCatalog, VendorCredentials};
pub use routing::{Partition, RoutingError, RoutingTable};
