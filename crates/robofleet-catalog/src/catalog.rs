//! Tenant credential catalog loading and validation.
//!
//! The catalog document is keyed by tenant, then by vendor. Each leaf
//! carries an `enabled` flag plus vendor-specific credential fields.
//! Credential material is wrapped in [`secrecy::Secret`] so it never shows
//! up in debug output or logs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use secrecy::Secret;
use serde::Deserialize;
use tracing::{info, warn};

use robofleet_types::{TenantId, VendorId};

/// Credentials for one (tenant, vendor) pair.
///
/// The variant is selected by the fields present in the document: API
/// key/secret pairs for vendors authenticating per request, OAuth client
/// credentials for vendors issuing bearer tokens.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum VendorCredentials {
    /// Per-request API key and signing secret.
    ApiKey {
        /// Key identifying the API consumer.
        api_key: Secret<String>,
        /// Secret used to authenticate each request.
        api_secret: Secret<String>,
    },
    /// OAuth client-credentials grant.
    OAuth {
        /// OAuth client identifier.
        client_id: String,
        /// OAuth client secret.
        client_secret: Secret<String>,
        /// Token endpoint issuing bearer tokens.
        token_url: String,
    },
}

impl std::fmt::Debug for VendorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { .. } => f.write_str("VendorCredentials::ApiKey([REDACTED])"),
            Self::OAuth { client_id, .. } => f
                .debug_struct("VendorCredentials::OAuth")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

/// One vendor entry under a tenant.
#[derive(Debug, Clone, Deserialize)]
struct VendorEntry {
    /// Whether this (tenant, vendor) pair participates in polling.
    #[serde(default = "default_enabled")]
    enabled: bool,
    /// Vendor-specific credential fields.
    #[serde(flatten)]
    credentials: VendorCredentials,
}

fn default_enabled() -> bool {
    true
}

/// Root shape of the catalog document.
#[derive(Debug, Deserialize)]
struct CatalogDocument {
    tenants: BTreeMap<TenantId, BTreeMap<VendorId, VendorEntry>>,
}

/// The tenant credential catalog, read-only after startup.
#[derive(Debug)]
pub struct TenantCatalog {
    tenants: BTreeMap<TenantId, BTreeMap<VendorId, VendorEntry>>,
}

impl TenantCatalog {
    /// Loads and validates the catalog from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog file: {}", path.display()))?;
        Self::from_str(&contents)
            .with_context(|| format!("invalid catalog file: {}", path.display()))
    }

    /// Parses and validates the catalog from YAML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        let document: CatalogDocument =
            serde_yaml::from_str(contents).context("failed to parse catalog YAML")?;
        let catalog = Self { tenants: document.tenants };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Validates the catalog shape. Failures are fatal at startup.
    fn validate(&self) -> Result<()> {
        if self.tenants.is_empty() {
            warn!("catalog contains no tenants; the poller will have nothing to do");
        }
        for (tenant, vendors) in &self.tenants {
            if tenant.trim().is_empty() {
                return Err(anyhow::anyhow!("catalog contains a tenant with an empty id"));
            }
            if vendors.is_empty() {
                warn!(tenant = %tenant, "tenant has no vendor entries");
            }
            for vendor in vendors.keys() {
                if vendor.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "tenant {tenant} contains a vendor with an empty id"
                    ));
                }
            }
        }
        let enabled = self.enabled_pairs().len();
        info!(
            tenants = self.tenants.len(),
            enabled_pairs = enabled,
            "tenant catalog loaded"
        );
        Ok(())
    }

    /// All tenant ids, in document order.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.tenants.keys().cloned().collect()
    }

    /// The vendors a tenant has enabled.
    pub fn enabled_vendors(&self, tenant: &str) -> Vec<VendorId> {
        self.tenants
            .get(tenant)
            .map(|vendors| {
                vendors
                    .iter()
                    .filter(|(_, entry)| entry.enabled)
                    .map(|(vendor, _)| vendor.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every enabled (tenant, vendor) pair; the poller's work seed.
    pub fn enabled_pairs(&self) -> Vec<(TenantId, VendorId)> {
        let mut pairs = Vec::new();
        for (tenant, vendors) in &self.tenants {
            for (vendor, entry) in vendors {
                if entry.enabled {
                    pairs.push((tenant.clone(), vendor.clone()));
                }
            }
        }
        pairs
    }

    /// The credential bundle for a (tenant, vendor) pair, enabled or not.
    pub fn credentials(&self, tenant: &str, vendor: &str) -> Option<&VendorCredentials> {
        self.tenants
            .get(tenant)
            .and_then(|vendors| vendors.get(vendor))
            .map(|entry| &entry.credentials)
    }
}
