//! Persisted protocol documents.

use crate::agent::{AgentSpec, SensingAgentSpec};
use crate::datum::{Anonymizer, HashString, RoundNumber, Suppress};
use crate::encryption::SymmetricEncryption;
use crate::error::RuntimeError;
use crate::probe::ProbeSettings;
use crate::store::DEFAULT_MAX_BUFFERED;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_buffered() -> usize {
    DEFAULT_MAX_BUFFERED
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_capture_timeout_ms() -> u64 {
    10_000
}

fn default_decision_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_participation_horizon() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_action_interval() -> Duration {
    Duration::from_secs(10)
}

/// One probe entry of a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(rename = "type")]
    pub probe_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only meaningful for polling sources. Defaults per source type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_per_second: Option<f64>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    /// Source-specific parameters, checked against the registry's schema.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl ProbeConfig {
    pub fn new(probe_type: &str) -> Self {
        Self {
            probe_type: probe_type.to_string(),
            enabled: true,
            polling_interval_ms: None,
            max_data_per_second: None,
            failure_threshold: default_failure_threshold(),
            capture_timeout_ms: default_capture_timeout_ms(),
            parameters: Map::new(),
        }
    }

    pub fn settings(&self) -> ProbeSettings {
        ProbeSettings {
            max_data_per_second: self.max_data_per_second,
            failure_threshold: self.failure_threshold,
            capture_timeout: Duration::from_millis(self.capture_timeout_ms),
            ..ProbeSettings::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    Suppress,
    Round { decimals: u32 },
    Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizationRule {
    pub probe_type: String,
    pub field: String,
    pub transform: TransformSpec,
}

/// Scheduled prompt opportunities and the agent deciding on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(with = "crate::config::duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    #[serde(
        with = "crate::config::duration_ms",
        rename = "decision_timeout_ms",
        default = "default_decision_timeout"
    )]
    pub decision_timeout: Duration,
    #[serde(flatten)]
    pub agent: AgentSpec,
}

/// Action opportunities for an adaptive sensing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensingConfig {
    #[serde(
        with = "crate::config::duration_ms",
        rename = "action_interval_ms",
        default = "default_action_interval"
    )]
    pub action_interval: Duration,
    #[serde(flatten)]
    pub agent: SensingAgentSpec,
}

/// A named configuration: probes plus shared settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub encryption_key: String,
    #[serde(
        with = "crate::config::duration_ms",
        rename = "commit_interval_ms",
        default = "default_commit_interval"
    )]
    pub commit_interval: Duration,
    #[serde(default = "default_max_buffered")]
    pub max_buffered_datums: usize,
    #[serde(
        with = "crate::config::duration_ms",
        rename = "participation_horizon_ms",
        default = "default_participation_horizon"
    )]
    pub participation_horizon: Duration,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anonymization: Vec<AnonymizationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensing: Option<SensingConfig>,
}

impl ProtocolConfig {
    pub fn new(name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            encryption_key: String::new(),
            commit_interval: default_commit_interval(),
            max_buffered_datums: DEFAULT_MAX_BUFFERED,
            participation_horizon: default_participation_horizon(),
            probes: Vec::new(),
            anonymization: Vec::new(),
            prompts: None,
            sensing: None,
        }
    }

    /// A runnable protocol using the simulated sources.
    pub fn sample() -> Self {
        let mut random = ProbeConfig::new("simulated.random");
        random.polling_interval_ms = Some(1_000);
        random.parameters = json!({"min": 0.0, "max": 100.0})
            .as_object()
            .cloned()
            .unwrap_or_default();

        let mut stream = ProbeConfig::new("simulated.stream");
        stream.max_data_per_second = Some(2.0);
        stream.parameters = json!({"period_ms": 200})
            .as_object()
            .cloned()
            .unwrap_or_default();

        Self {
            encryption_key: uuid::Uuid::new_v4().simple().to_string(),
            commit_interval: Duration::from_secs(10),
            probes: vec![random, stream],
            anonymization: vec![AnonymizationRule {
                probe_type: "simulated.random".to_string(),
                field: "value".to_string(),
                transform: TransformSpec::Round { decimals: 1 },
            }],
            prompts: Some(PromptConfig {
                interval: Duration::from_secs(30),
                decision_timeout: default_decision_timeout(),
                agent: AgentSpec::Random { p: 0.5 },
            }),
            sensing: serde_json::from_value(json!({
                "action_interval_ms": 5_000,
                "agent": "rule",
                "policy": {
                    "observation_window_ms": 30_000,
                    "statements": [{
                        "id": "high_readings",
                        "criterion": {
                            "logic": "conjunction",
                            "elements": [{
                                "probe_type": "simulated.random",
                                "field": "value",
                                "aggregation": "average",
                                "relation": "greater_than",
                                "target": 75.0
                            }]
                        },
                        "begin_control": [{
                            "probe_type": "simulated.random",
                            "setting": "polling_interval_ms",
                            "value": 250
                        }],
                        "end_control": [{
                            "probe_type": "simulated.random",
                            "setting": "polling_interval_ms",
                            "value": 1_000
                        }]
                    }]
                }
            }))
            .ok(),
            ..Self::new("Sample protocol")
        }
    }

    /// Check the document's invariants.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let invalid = |reason: String| Err(RuntimeError::Protocol(reason));

        if self.id.trim().is_empty() {
            return invalid("protocol id is empty".to_string());
        }
        if self.name.trim().is_empty() {
            return invalid("protocol name is empty".to_string());
        }
        if self.commit_interval.is_zero() {
            return invalid("commit interval must be greater than zero".to_string());
        }
        if self.max_buffered_datums == 0 {
            return invalid("max_buffered_datums must be at least 1".to_string());
        }
        if self.participation_horizon.is_zero() {
            return invalid("participation horizon must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for probe in &self.probes {
            if !seen.insert(probe.probe_type.as_str()) {
                return invalid(format!("duplicate probe type '{}'", probe.probe_type));
            }
            if probe.polling_interval_ms == Some(0) {
                return invalid(format!("probe '{}' has a zero polling interval", probe.probe_type));
            }
            if let Some(rate) = probe.max_data_per_second {
                if !rate.is_finite() || rate < 0.0 {
                    return invalid(format!(
                        "probe '{}' has an invalid max_data_per_second {rate}",
                        probe.probe_type
                    ));
                }
            }
            if probe.failure_threshold == 0 {
                return invalid(format!("probe '{}' has a zero failure threshold", probe.probe_type));
            }
            if probe.capture_timeout_ms == 0 {
                return invalid(format!("probe '{}' has a zero capture timeout", probe.probe_type));
            }
        }

        if let Some(prompts) = &self.prompts {
            if prompts.interval.is_zero() {
                return invalid("prompt interval must be greater than zero".to_string());
            }
            prompts
                .agent
                .build()
                .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        }

        if let Some(sensing) = &self.sensing {
            if sensing.action_interval.is_zero() {
                return invalid("sensing action interval must be greater than zero".to_string());
            }
            sensing
                .agent
                .build()
                .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
            for change in sensing.agent.setting_changes() {
                if self.probe(&change.probe_type).is_none() {
                    return invalid(format!(
                        "sensing agent changes unknown probe type '{}'",
                        change.probe_type
                    ));
                }
            }
        }
        Ok(())
    }

    /// Field transforms from the anonymization rules.
    pub fn anonymizer(&self) -> Anonymizer {
        let mut anonymizer = Anonymizer::new();
        for rule in &self.anonymization {
            match rule.transform {
                TransformSpec::Suppress => {
                    anonymizer.add_rule(&rule.probe_type, &rule.field, Arc::new(Suppress))
                }
                TransformSpec::Round { decimals } => anonymizer.add_rule(
                    &rule.probe_type,
                    &rule.field,
                    Arc::new(RoundNumber { decimals }),
                ),
                TransformSpec::Hash => {
                    anonymizer.add_rule(&rule.probe_type, &rule.field, Arc::new(HashString))
                }
            }
        }
        anonymizer
    }

    pub fn probe(&self, probe_type: &str) -> Option<&ProbeConfig> {
        self.probes.iter().find(|p| p.probe_type == probe_type)
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), RuntimeError> {
        write_with_parents(path, serde_json::to_string_pretty(self)?)
    }

    /// Load a document stored with [`save_encrypted`](Self::save_encrypted).
    pub fn load_encrypted(path: &Path, cipher: &SymmetricEncryption) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&cipher.decrypt_from_base64(&content)?)
    }

    pub fn save_encrypted(&self, path: &Path, cipher: &SymmetricEncryption) -> Result<(), RuntimeError> {
        let json = serde_json::to_string(self)?;
        write_with_parents(path, cipher.encrypt_to_base64(&json)?)
    }

    /// Load plain or encrypted, whichever the file holds.
    pub fn load_any(path: &Path, cipher: &SymmetricEncryption) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        if content.trim_start().starts_with('{') {
            Self::parse(&content)
        } else {
            Self::parse(&cipher.decrypt_from_base64(&content)?)
        }
    }

    fn parse(content: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

fn write_with_parents(path: &Path, content: String) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_valid() {
        let sample = ProtocolConfig::sample();
        sample.validate().unwrap();
        assert_eq!(sample.probes.len(), 2);
        assert!(sample.sensing.is_some());
        assert!(!sample.anonymizer().is_empty());
    }

    #[test]
    fn test_rejects_duplicate_probe_types() {
        let mut config = ProtocolConfig::new("dup");
        config.probes = vec![ProbeConfig::new("a"), ProbeConfig::new("a")];
        assert!(matches!(config.validate(), Err(RuntimeError::Protocol(_))));
    }

    #[test]
    fn test_rejects_zero_commit_interval() {
        let mut config = ProtocolConfig::new("zero");
        config.commit_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_rate_and_bad_agent() {
        let mut config = ProtocolConfig::new("rate");
        let mut probe = ProbeConfig::new("a");
        probe.max_data_per_second = Some(-1.0);
        config.probes.push(probe);
        assert!(config.validate().is_err());

        let mut config = ProtocolConfig::new("agent");
        config.prompts = Some(PromptConfig {
            interval: Duration::from_secs(1),
            decision_timeout: Duration::from_secs(1),
            agent: AgentSpec::Random { p: 3.0 },
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sensing_section() {
        let mut config: ProtocolConfig = serde_json::from_value(json!({
            "id": "x",
            "name": "adaptive",
            "probes": [{"type": "simulated.random"}],
            "sensing": {
                "agent": "rule",
                "policy": {
                    "statements": [{
                        "id": "busy",
                        "criterion": {"logic": "disjunction", "elements": []},
                        "begin_control": [
                            {"probe_type": "simulated.random", "setting": "enabled", "value": false}
                        ]
                    }]
                }
            }
        }))
        .unwrap();
        config.validate().unwrap();
        let sensing = config.sensing.as_ref().unwrap();
        assert_eq!(sensing.action_interval, Duration::from_secs(10));
        assert_eq!(config.participation_horizon, Duration::from_secs(86_400));

        config.probes[0].probe_type = "gps".to_string();
        assert!(matches!(config.validate(), Err(RuntimeError::Protocol(_))));
    }

    #[test]
    fn test_rejects_zero_horizon_and_action_interval() {
        let mut config = ProtocolConfig::new("horizon");
        config.participation_horizon = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ProtocolConfig::new("action");
        config.sensing = Some(SensingConfig {
            action_interval: Duration::ZERO,
            agent: SensingAgentSpec::Rule {
                policy: serde_json::from_value(json!({"statements": []})).unwrap(),
            },
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_field_names() {
        let value = serde_json::to_value(ProtocolConfig::sample()).unwrap();
        assert_eq!(value["commit_interval_ms"], 10_000);
        assert_eq!(value["probes"][0]["type"], "simulated.random");
        assert_eq!(value["prompts"]["agent"], "random");
        assert_eq!(value["prompts"]["p"], 0.5);
        assert_eq!(value["anonymization"][0]["transform"]["kind"], "round");
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"id":"x","name":"n","probes":[{"type":"a"}]}"#).unwrap();
        assert_eq!(config.commit_interval, Duration::from_secs(60));
        assert!(config.probes[0].enabled);
        assert_eq!(config.probes[0].failure_threshold, 3);
    }

    #[test]
    fn test_encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protocol.enc");
        let cipher = SymmetricEncryption::new("device secret");

        let config = ProtocolConfig::sample();
        config.save_encrypted(&path, &cipher).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("simulated.random"));
        assert_eq!(ProtocolConfig::load_encrypted(&path, &cipher).unwrap(), config);
        assert_eq!(ProtocolConfig::load_any(&path, &cipher).unwrap(), config);
        assert!(ProtocolConfig::load_encrypted(&path, &SymmetricEncryption::new("other")).is_err());
    }

    #[test]
    fn test_plain_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("protocol.json");
        let config = ProtocolConfig::sample();
        config.save(&path).unwrap();
        assert_eq!(ProtocolConfig::load(&path).unwrap(), config);
    }
}
