//! Vendor adapter registry.
//!
//! Holds one adapter per vendor behind the uniform capability trait and
//! answers vendor auto-detection queries for the brand-agnostic webhook
//! endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use robofleet_types::VendorId;

use crate::mapping::lookup_path;
use crate::VendorAdapter;

/// Outcome of structural vendor auto-detection on a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorDetection {
    /// No registered vendor's marker is present.
    None,
    /// Exactly one vendor's marker is present.
    Detected(VendorId),
    /// More than one vendor's marker is present. The payload is rejected
    /// rather than defaulted; misattributing records would be worse than
    /// asking the sender to use its per-vendor endpoint.
    Ambiguous(Vec<VendorId>),
}

/// Registry of vendor adapters, read-only after startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<VendorId, Arc<dyn VendorAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own vendor id.
    ///
    /// Registering the same vendor twice is a startup error.
    pub fn register(&mut self, adapter: Arc<dyn VendorAdapter>) -> Result<()> {
        let vendor = adapter.vendor_id().to_string();
        if self.adapters.contains_key(&vendor) {
            return Err(anyhow::anyhow!("adapter already registered for vendor {vendor}"));
        }
        self.adapters.insert(vendor, adapter);
        Ok(())
    }

    /// Looks up the adapter for a vendor.
    pub fn get(&self, vendor: &str) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(vendor).cloned()
    }

    /// All registered vendor ids.
    pub fn vendors(&self) -> Vec<VendorId> {
        self.adapters.keys().cloned().collect()
    }

    /// Structurally detects the vendor of a brand-agnostic webhook payload
    /// by checking each vendor's declared marker path.
    pub fn detect_vendor(&self, payload: &Value) -> VendorDetection {
        let mut matches: Vec<VendorId> = Vec::new();
        for (vendor, adapter) in &self.adapters {
            let marker = &adapter.mapping().detect_marker;
            if marker.is_empty() {
                continue;
            }
            if lookup_path(payload, marker).is_some() {
                matches.push(vendor.clone());
            }
        }
        match matches.len() {
            0 => VendorDetection::None,
            1 => VendorDetection::Detected(matches.remove(0)),
            _ => VendorDetection::Ambiguous(matches),
        }
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("vendors", &self.vendors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VendorMappingConfig;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubAdapter {
        vendor: &'static str,
        mapping: VendorMappingConfig,
    }

    impl StubAdapter {
        fn with_marker(vendor: &'static str, marker: &str) -> Self {
            Self {
                vendor,
                mapping: VendorMappingConfig {
                    detect_marker: marker.to_string(),
                    ..VendorMappingConfig::default()
                },
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
    }

    fn registry() -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StubAdapter::with_marker("pudu", "data.sn")))
            .unwrap();
        registry
            .register(Arc::new(StubAdapter::with_marker("gausium", "payload.robotSerial")))
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register(Arc::new(StubAdapter::with_marker("pudu", "x")))
            .unwrap_err();
        assert!(err.to_string().contains("pudu"));
    }

    #[test]
    fn lookup_by_vendor_id() {
        let registry = registry();
        assert!(registry.get("pudu").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.vendors(), vec!["gausium".to_string(), "pudu".to_string()]);
    }

    #[test]
    fn detects_a_single_vendor_by_marker() {
        let registry = registry();
        let detection = registry.detect_vendor(&json!({ "data": { "sn": "R1" } }));
        assert_eq!(detection, VendorDetection::Detected("pudu".to_string()));

        let detection =
            registry.detect_vendor(&json!({ "payload": { "robotSerial": "G5" } }));
        assert_eq!(detection, VendorDetection::Detected("gausium".to_string()));
    }

    #[test]
    fn unknown_payload_detects_nothing() {
        let registry = registry();
        assert_eq!(registry.detect_vendor(&json!({ "hello": 1 })), VendorDetection::None);
    }

    #[test]
    fn payload_matching_both_markers_is_ambiguous() {
        let registry = registry();
        let detection = registry.detect_vendor(&json!({
            "data": { "sn": "R1" },
            "payload": { "robotSerial": "G5" }
        }));
        assert_eq!(
            detection,
            VendorDetection::Ambiguous(vec!["gausium".to_string(), "pudu".to_string()])
        );
    }
}
