//! The data model for a single timestamped reading.
//!
//! A [`Datum`] is immutable once built. Field-level anonymization is applied by
//! an [`Anonymizer`], which produces a new datum with transformed payload fields
//! and records which fields were touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Probe type tag used for data produced by the runtime itself.
pub const PROTOCOL_REPORT_TYPE: &str = "protocol_report";

/// Probe type tag for per-probe participation summaries.
pub const PARTICIPATION_REPORT_TYPE: &str = "participation_report";

/// One timestamped sensing reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    id: Uuid,
    probe_type: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protocol_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    anonymized: Vec<String>,
    #[serde(default)]
    payload: Map<String, Value>,
}

impl Datum {
    /// Create a datum stamped with the current time.
    pub fn new(probe_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self::at(probe_type, Utc::now(), payload)
    }

    /// Create a datum with an explicit sensing time.
    pub fn at(
        probe_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            probe_type: probe_type.into(),
            timestamp,
            device_id: None,
            protocol_id: None,
            anonymized: Vec::new(),
            payload,
        }
    }

    /// Attach the producing device and protocol.
    pub fn with_origin(mut self, device_id: &str, protocol_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self.protocol_id = Some(protocol_id.to_string());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn probe_type(&self) -> &str {
        &self.probe_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn protocol_id(&self) -> Option<&str> {
        self.protocol_id.as_deref()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Names of payload fields that were transformed by anonymization.
    pub fn anonymized_fields(&self) -> &[String] {
        &self.anonymized
    }

    pub fn is_anonymized(&self) -> bool {
        !self.anonymized.is_empty()
    }
}

/// A field-level anonymization transform.
///
/// Returning `None` suppresses the field entirely.
pub trait FieldTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, value: &Value) -> Option<Value>;
}

/// Removes the field.
pub struct Suppress;

impl FieldTransform for Suppress {
    fn name(&self) -> &str {
        "suppress"
    }

    fn apply(&self, _value: &Value) -> Option<Value> {
        None
    }
}

/// Rounds numeric fields to a fixed number of decimals. Non-numbers pass through.
pub struct RoundNumber {
    pub decimals: u32,
}

impl FieldTransform for RoundNumber {
    fn name(&self) -> &str {
        "round"
    }

    fn apply(&self, value: &Value) -> Option<Value> {
        let Some(number) = value.as_f64() else {
            return Some(value.clone());
        };
        let factor = 10f64.powi(self.decimals as i32);
        let rounded = (number * factor).round() / factor;
        Some(serde_json::Number::from_f64(rounded).map_or(Value::Null, Value::Number))
    }
}

/// Replaces the field's textual form with its SHA-256 hex digest.
pub struct HashString;

impl FieldTransform for HashString {
    fn name(&self) -> &str {
        "hash"
    }

    fn apply(&self, value: &Value) -> Option<Value> {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(Value::String(format!("{:x}", Sha256::digest(text.as_bytes()))))
    }
}

/// Per-probe, per-field transform hooks applied before serialization.
#[derive(Clone, Default)]
pub struct Anonymizer {
    rules: HashMap<String, HashMap<String, Arc<dyn FieldTransform>>>,
}

impl std::fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (probe, fields) in &self.rules {
            for (field, transform) in fields {
                map.entry(&format!("{probe}.{field}"), &transform.name());
            }
        }
        map.finish()
    }
}

impl Anonymizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform for one field of one probe type.
    pub fn add_rule(
        &mut self,
        probe_type: impl Into<String>,
        field: impl Into<String>,
        transform: Arc<dyn FieldTransform>,
    ) {
        self.rules
            .entry(probe_type.into())
            .or_default()
            .insert(field.into(), transform);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Return an anonymized copy of the datum. Datums without rules are cloned as-is.
    pub fn apply(&self, datum: &Datum) -> Datum {
        let Some(fields) = self.rules.get(&datum.probe_type) else {
            return datum.clone();
        };

        let mut out = datum.clone();
        for (field, transform) in fields {
            if let Some(value) = datum.payload.get(field) {
                match transform.apply(value) {
                    Some(replacement) => {
                        out.payload.insert(field.clone(), replacement);
                    }
                    None => {
                        out.payload.remove(field);
                    }
                }
                if !out.anonymized.contains(field) {
                    out.anonymized.push(field.clone());
                }
            }
        }
        out
    }
}
