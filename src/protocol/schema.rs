//! Editable parameter metadata.
//!
//! Describes every configurable parameter so an external UI can render and
//! validate it. The runtime only uses it to check parameter maps.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Boolean,
    Integer,
    Number,
    Text,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    pub label: String,
    pub editable: bool,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterSpec {
    pub fn new(name: &str, kind: ParameterType, label: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            label: label.to_string(),
            editable: true,
            constraints: Constraints::default(),
            default: None,
        }
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.min = min;
        self.constraints.max = max;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.editable = false;
        self
    }

    /// Check one value against this spec.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let fail = |what: &str| Err(format!("parameter '{}' {what}", self.name));

        match self.kind {
            ParameterType::Boolean if !value.is_boolean() => return fail("must be a boolean"),
            ParameterType::Integer if !(value.is_i64() || value.is_u64()) => {
                return fail("must be an integer")
            }
            ParameterType::Number if !value.is_number() => return fail("must be a number"),
            ParameterType::Text if !value.is_string() => return fail("must be text"),
            _ => {}
        }

        if let Some(number) = value.as_f64() {
            if self.constraints.min.is_some_and(|min| number < min) {
                return fail(&format!("is below the minimum {:?}", self.constraints.min));
            }
            if self.constraints.max.is_some_and(|max| number > max) {
                return fail(&format!("is above the maximum {:?}", self.constraints.max));
            }
        }
        if let Some(text) = value.as_str() {
            if !self.constraints.choices.is_empty()
                && !self.constraints.choices.iter().any(|c| c == text)
            {
                return fail(&format!("must be one of {:?}", self.constraints.choices));
            }
        }
        Ok(())
    }
}

/// An ordered list of parameter specs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema(pub Vec<ParameterSpec>);

impl ParameterSchema {
    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.0.iter().find(|spec| spec.name == name)
    }

    /// Validate a parameter map. Unknown parameters are rejected.
    pub fn validate(&self, parameters: &Map<String, Value>) -> Result<(), String> {
        for (name, value) in parameters {
            match self.get(name) {
                Some(spec) => spec.check(value)?,
                None => return Err(format!("unknown parameter '{name}'")),
            }
        }
        Ok(())
    }
}

/// Settings common to every probe.
pub fn probe_schema() -> ParameterSchema {
    ParameterSchema(vec![
        ParameterSpec::new("enabled", ParameterType::Boolean, "Enabled").default_value(json!(true)),
        ParameterSpec::new("polling_interval_ms", ParameterType::Integer, "Polling interval (ms)")
            .range(Some(1.0), None),
        ParameterSpec::new("max_data_per_second", ParameterType::Number, "Maximum data per second")
            .range(Some(0.0), None),
        ParameterSpec::new("failure_threshold", ParameterType::Integer, "Failures before disabling")
            .range(Some(1.0), None)
            .default_value(json!(3)),
        ParameterSpec::new("capture_timeout_ms", ParameterType::Integer, "Capture timeout (ms)")
            .range(Some(1.0), None)
            .default_value(json!(10_000)),
    ])
}

/// Settings of a protocol's data store.
pub fn store_schema() -> ParameterSchema {
    ParameterSchema(vec![
        ParameterSpec::new("commit_interval_ms", ParameterType::Integer, "Commit interval (ms)")
            .range(Some(1.0), None)
            .default_value(json!(60_000)),
        ParameterSpec::new("max_buffered_datums", ParameterType::Integer, "Buffer capacity")
            .range(Some(1.0), None)
            .default_value(json!(crate::store::DEFAULT_MAX_BUFFERED)),
        ParameterSpec::new("encryption_key", ParameterType::Text, "Encryption key"),
        ParameterSpec::new("id", ParameterType::Text, "Protocol ID").read_only(),
    ])
}
