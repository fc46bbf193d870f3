//! Declarative per-vendor mapping documents and their interpreter.
//!
//! Each vendor is described by one YAML document with three sections:
//! webhook verification, callback-type → record-kind mappings, and per-kind
//! field mappings of `(source path, destination field, optional conversion)`
//! triples plus a list of fields to drop from preserved structures. A single
//! generic interpreter applies these documents; there is no per-vendor
//! branching anywhere downstream.
//!
//! The conversion set is closed. A new vendor never extends it; if a vendor
//! genuinely needs a novel conversion, widen the set here explicitly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use robofleet_types::RecordKind;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failure while interpreting a mapping document against a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// The callback type is not listed in the vendor's type mappings.
    #[error("unknown callback type: {0}")]
    UnknownCallbackType(String),
    /// A conversion could not be applied to the source value.
    #[error("conversion failed for field {field}: {reason}")]
    Conversion {
        /// Destination field the conversion was producing.
        field: String,
        /// Why the conversion failed.
        reason: String,
    },
}

//─────────────────────────────
//  Document shape
//─────────────────────────────

/// How webhook callbacks from this vendor are authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookVerification {
    /// Where the shared secret travels.
    pub method: VerificationMethod,
    /// Header name (`header` method) or body field path (`body` method).
    pub key: String,
}

impl Default for WebhookVerification {
    fn default() -> Self {
        Self { method: VerificationMethod::Header, key: String::new() }
    }
}

/// Transport of the webhook shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    /// Compare a named request header against the configured secret.
    Header,
    /// Compare a named field inside the JSON body against the secret.
    Body,
}

/// One `(source path, destination field, optional conversion)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dot-separated path into the vendor payload. May be empty for the
    /// `subtract` conversion, which reads its own two paths.
    #[serde(default)]
    pub source: String,
    /// Destination field in the normalized record.
    pub dest: String,
    /// Conversion applied to the source value.
    #[serde(default)]
    pub convert: Option<Conversion>,
    /// Value used when the source path is absent or null.
    #[serde(default)]
    pub default: Option<Value>,
}

/// The closed conversion set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Lowercase a string.
    Lowercase,
    /// Uppercase a string.
    Uppercase,
    /// Divide a millisecond timestamp by 1000.
    MsToS,
    /// Multiply litres by 1000.
    LitersToMl,
    /// Store the value verbatim as an embedded structured field.
    JsonPreserve,
    /// Parse a vendor duration string of the form `"Xh Ymin"` into seconds.
    DurationText,
    /// Parse a vendor gain string of the form `"+N%"` into an integer.
    PercentGain,
    /// Enumerated-value translation, e.g. `H7 → fatal` or `0 → completed`.
    Mapping(BTreeMap<String, Value>),
    /// Arithmetic difference of two payload paths, e.g. battery usage.
    Subtract {
        /// Path of the value subtracted from.
        minuend: String,
        /// Path of the value subtracted.
        subtrahend: String,
    },
}

/// A vendor's complete declarative mapping document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VendorMappingConfig {
    /// Webhook authentication rule.
    #[serde(default)]
    pub verification: WebhookVerification,
    /// Path whose presence identifies this vendor's payloads on the
    /// brand-agnostic webhook endpoint.
    #[serde(default)]
    pub detect_marker: String,
    /// Path of the callback-type identifier inside webhook payloads.
    #[serde(default = "default_type_field")]
    pub type_field: String,
    /// Path of the record body inside webhook payloads. Field mapping
    /// sources are relative to this subtree, which lets one document serve
    /// both webhook envelopes and the flat items of the polling API. Empty
    /// means the whole payload is the record body.
    #[serde(default)]
    pub payload_root: String,
    /// Vendor callback-type identifier → internal record kind.
    #[serde(default)]
    pub type_mappings: BTreeMap<String, RecordKind>,
    /// Field mapping lists keyed by record kind (`state`, `task`, …).
    #[serde(default)]
    pub field_mappings: BTreeMap<String, Vec<FieldMapping>>,
    /// Paths removed from the mapped output, including paths into fields
    /// preserved verbatim.
    #[serde(default)]
    pub drop_fields: Vec<String>,
}

fn default_type_field() -> String {
    "callback_type".to_string()
}

impl VendorMappingConfig {
    /// Loads and validates a mapping document from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read mapping file: {}", path.display()))?;
        Self::from_str(&contents)
            .with_context(|| format!("invalid mapping file: {}", path.display()))
    }

    /// Parses and validates a mapping document from YAML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(contents).context("failed to parse mapping YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the document shape. Failures are fatal at startup.
    fn validate(&self) -> Result<()> {
        for (kind, mappings) in &self.field_mappings {
            if RecordKind::parse(kind).is_none() {
                return Err(anyhow::anyhow!("field_mappings key {kind} is not a record kind"));
            }
            for mapping in mappings {
                if mapping.dest.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "field mapping under {kind} has an empty destination"
                    ));
                }
                let is_subtract = matches!(mapping.convert, Some(Conversion::Subtract { .. }));
                if mapping.source.trim().is_empty() && !is_subtract {
                    return Err(anyhow::anyhow!(
                        "field mapping for {kind}.{} has an empty source",
                        mapping.dest
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolves a vendor callback type to a record kind.
    pub fn kind_for_callback(&self, callback_type: &str) -> Option<RecordKind> {
        self.type_mappings.get(callback_type).copied()
    }

    /// The field mappings declared for a record kind.
    pub fn mappings_for(&self, kind: RecordKind) -> &[FieldMapping] {
        self.field_mappings
            .get(kind.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Applies the field mappings for `kind` to a vendor payload, producing
    /// the flat JSON object the record kind deserializes from.
    ///
    /// A null or absent source value falls back to the mapping's `default`,
    /// or leaves the destination absent; the record's own schema decides
    /// whether absence is acceptable.
    pub fn map_record(&self, kind: RecordKind, payload: &Value) -> Result<Value, MappingError> {
        let mut out = Map::new();
        for mapping in self.mappings_for(kind) {
            let mapped = match &mapping.convert {
                Some(Conversion::Subtract { minuend, subtrahend }) => {
                    subtract(payload, minuend, subtrahend, &mapping.dest)?
                }
                convert => match lookup_path(payload, &mapping.source) {
                    Some(value) if !value.is_null() => {
                        Some(apply_conversion(convert.as_ref(), value, &mapping.dest)?)
                    }
                    _ => mapping.default.clone(),
                },
            };
            if let Some(value) = mapped {
                out.insert(mapping.dest.clone(), value);
            }
        }
        let mut result = Value::Object(out);
        for path in &self.drop_fields {
            remove_path(&mut result, path);
        }
        Ok(result)
    }
}

//─────────────────────────────
//  Path access
//─────────────────────────────

/// Looks up a dot-separated path in a JSON payload.
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Removes a dot-separated path from a JSON value, if present.
fn remove_path(value: &mut Value, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        let Some(object) = current.as_object_mut() else { return };
        if segments.peek().is_none() {
            object.remove(segment);
            return;
        }
        match object.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}

//─────────────────────────────
//  Conversions
//─────────────────────────────

fn apply_conversion(
    conversion: Option<&Conversion>,
    value: &Value,
    field: &str,
) -> Result<Value, MappingError> {
    let Some(conversion) = conversion else {
        return Ok(value.clone());
    };
    match conversion {
        Conversion::Lowercase => require_str(value, field).map(|s| Value::String(s.to_lowercase())),
        Conversion::Uppercase => require_str(value, field).map(|s| Value::String(s.to_uppercase())),
        Conversion::MsToS => {
            let ms = require_i64(value, field)?;
            Ok(Value::Number((ms / 1000).into()))
        }
        Conversion::LitersToMl => {
            let liters = require_f64(value, field)?;
            Ok(json_number(liters * 1000.0, field)?)
        }
        Conversion::JsonPreserve => Ok(value.clone()),
        Conversion::DurationText => {
            let text = require_str(value, field)?;
            let secs = parse_duration_text(text).ok_or_else(|| MappingError::Conversion {
                field: field.to_string(),
                reason: format!("unparseable duration: {text:?}"),
            })?;
            Ok(Value::Number(secs.into()))
        }
        Conversion::PercentGain => {
            let text = require_str(value, field)?;
            let gain = parse_percent_gain(text).ok_or_else(|| MappingError::Conversion {
                field: field.to_string(),
                reason: format!("unparseable gain: {text:?}"),
            })?;
            Ok(Value::Number(gain.into()))
        }
        Conversion::Mapping(table) => {
            let key = value_as_key(value);
            table.get(&key).cloned().ok_or_else(|| MappingError::Conversion {
                field: field.to_string(),
                reason: format!("no mapping entry for value {key:?}"),
            })
        }
        Conversion::Subtract { .. } => unreachable!("subtract is handled by the caller"),
    }
}

fn subtract(
    payload: &Value,
    minuend: &str,
    subtrahend: &str,
    field: &str,
) -> Result<Option<Value>, MappingError> {
    let (Some(a), Some(b)) = (lookup_path(payload, minuend), lookup_path(payload, subtrahend))
    else {
        // Both operands are required; with either absent the destination
        // stays unset rather than guessing.
        return Ok(None);
    };
    if a.is_null() || b.is_null() {
        return Ok(None);
    }
    let difference = require_f64(a, field)? - require_f64(b, field)?;
    Ok(Some(json_number(difference, field)?))
}

fn require_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, MappingError> {
    value.as_str().ok_or_else(|| MappingError::Conversion {
        field: field.to_string(),
        reason: format!("expected string, got {value}"),
    })
}

fn require_i64(value: &Value, field: &str) -> Result<i64, MappingError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| conversion_error(field, value)),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| conversion_error(field, value)),
        _ => Err(conversion_error(field, value)),
    }
}

fn require_f64(value: &Value, field: &str) -> Result<f64, MappingError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| conversion_error(field, value)),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| conversion_error(field, value)),
        _ => Err(conversion_error(field, value)),
    }
}

fn conversion_error(field: &str, value: &Value) -> MappingError {
    MappingError::Conversion {
        field: field.to_string(),
        reason: format!("expected number, got {value}"),
    }
}

fn json_number(value: f64, field: &str) -> Result<Value, MappingError> {
    // Whole results stay integral so integer columns compare cleanly.
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        return Ok(Value::Number((value as i64).into()));
    }
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| MappingError::Conversion {
            field: field.to_string(),
            reason: format!("non-finite result: {value}"),
        })
}

/// Canonical string key for `mapping`-table lookups.
fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses vendor duration strings of the form `"2h 15min"`, `"45min"` or
/// `"2h"` into seconds. Anything else is rejected rather than guessed.
pub fn parse_duration_text(text: &str) -> Option<i64> {
    let trimmed = text.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return None;
    }
    let mut total: i64 = 0;
    let mut matched = false;
    for part in trimmed.split_whitespace() {
        if let Some(hours) = part.strip_suffix('h') {
            total += hours.trim().parse::<i64>().ok()? * 3600;
            matched = true;
        } else if let Some(minutes) = part.strip_suffix("min") {
            total += minutes.trim().parse::<i64>().ok()? * 60;
            matched = true;
        } else {
            return None;
        }
    }
    matched.then_some(total)
}

/// Parses vendor gain strings of the form `"+25%"` into an integer number of
/// percentage points.
pub fn parse_percent_gain(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    let body = trimmed.strip_suffix('%')?;
    let body = body.strip_prefix('+').unwrap_or(body);
    body.trim().parse::<i64>().ok()
}
