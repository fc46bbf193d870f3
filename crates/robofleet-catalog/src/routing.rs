//! Database routing: robot serial → tenant database.
//!
//! The routing document maps each tenant database to the serials it owns,
//! plus an optional display-name table used by notification rendering. An
//! inverse index is built at load; a serial appearing under two databases
//! is a fatal configuration error because it would make record ownership
//! ambiguous.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use robofleet_types::{DatabaseId, RobotSerial};

/// Lookup failure for a serial absent from the routing table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// The serial does not belong to any tenant database.
    #[error("unknown serial: {0}")]
    UnknownSerial(String),
}

/// Root shape of the routing document.
#[derive(Debug, Deserialize)]
struct RoutingDocument {
    databases: BTreeMap<DatabaseId, Vec<RobotSerial>>,
    #[serde(default)]
    robot_names: BTreeMap<RobotSerial, String>,
}

/// Result of partitioning a set of serials by owning database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Partition {
    /// Serials grouped by their owning database, in routing-document order.
    pub by_database: BTreeMap<DatabaseId, Vec<RobotSerial>>,
    /// Serials the routing table does not know. Callers drop the associated
    /// records with a warning (poll) or reject the request (webhook).
    pub unknown: Vec<RobotSerial>,
}

/// The serial → database resolver, read-only after startup.
#[derive(Debug)]
pub struct RoutingTable {
    databases: BTreeMap<DatabaseId, Vec<RobotSerial>>,
    index: HashMap<RobotSerial, DatabaseId>,
    robot_names: BTreeMap<RobotSerial, String>,
}

impl RoutingTable {
    /// Loads and validates the routing table from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read routing file: {}", path.display()))?;
        Self::from_str(&contents)
            .with_context(|| format!("invalid routing file: {}", path.display()))
    }

    /// Parses and validates the routing table from YAML text.
    ///
    /// A serial listed under more than one database is a fatal error.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        let document: RoutingDocument =
            serde_yaml::from_str(contents).context("failed to parse routing YAML")?;

        let mut index: HashMap<RobotSerial, DatabaseId> = HashMap::new();
        for (database, serials) in &document.databases {
            if database.trim().is_empty() {
                return Err(anyhow::anyhow!("routing table contains an empty database id"));
            }
            for serial in serials {
                if serial.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "database {database} contains an empty serial"
                    ));
                }
                if let Some(previous) = index.insert(serial.clone(), database.clone()) {
                    return Err(anyhow::anyhow!(
                        "serial {serial} is listed under both {previous} and {database}; \
                         a robot belongs to exactly one tenant database"
                    ));
                }
            }
        }

        info!(
            databases = document.databases.len(),
            serials = index.len(),
            "routing table loaded"
        );

        Ok(Self {
            databases: document.databases,
            index,
            robot_names: document.robot_names,
        })
    }

    /// Resolves a serial to its owning database.
    pub fn route(&self, serial: &str) -> Result<&DatabaseId, RoutingError> {
        self.index
            .get(serial)
            .ok_or_else(|| RoutingError::UnknownSerial(serial.to_string()))
    }

    /// True when the serial belongs to some tenant database.
    pub fn contains(&self, serial: &str) -> bool {
        self.index.contains_key(serial)
    }

    /// Groups serials by owning database.
    ///
    /// A set of N serials yields at most D partitions where D is the number
    /// of configured databases; each partition is processed independently.
    pub fn partition<I, S>(&self, serials: I) -> Partition
    where
        I: IntoIterator<Item = S>,
        S: Into<RobotSerial>,
    {
        let mut partition = Partition::default();
        for serial in serials {
            let serial = serial.into();
            match self.index.get(&serial) {
                Some(database) => {
                    partition
                        .by_database
                        .entry(database.clone())
                        .or_default()
                        .push(serial);
                }
                None => partition.unknown.push(serial),
            }
        }
        partition
    }

    /// All configured database ids, in document order.
    pub fn databases(&self) -> Vec<DatabaseId> {
        self.databases.keys().cloned().collect()
    }

    /// The serials owned by one database; empty when the database is
    /// unknown.
    pub fn serials_for(&self, database: &str) -> Vec<RobotSerial> {
        self.databases.get(database).cloned().unwrap_or_default()
    }

    /// The database owned by a tenant, when configured.
    ///
    /// A tenant owns exactly one logical database and the routing document
    /// keys databases by tenant id, so this is a direct key lookup; records
    /// without a serial (locations) route through it.
    pub fn tenant_database(&self, tenant: &str) -> Option<DatabaseId> {
        self.databases.contains_key(tenant).then(|| tenant.to_string())
    }

    /// Display name for a serial, used in notification rendering.
    pub fn robot_name(&self, serial: &str) -> Option<&str> {
        self.robot_names.get(serial).map(String::as_str)
    }
}
