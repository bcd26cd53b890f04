//! Maps probe type names to capture sources.

use super::config::ProbeConfig;
use super::schema::{ParameterSchema, ParameterSpec, ParameterType};
use crate::error::RuntimeError;
use crate::probe::{ProbeKind, RandomSource, StreamSource};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

type SourceFactory = Arc<dyn Fn(&ProbeConfig) -> Result<ProbeKind, String> + Send + Sync>;

struct Registration {
    description: String,
    schema: ParameterSchema,
    factory: SourceFactory,
}

/// Known probe types and how to build their sources.
#[derive(Default)]
pub struct ProbeRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the simulated sources.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(
            "simulated.random",
            "Polls a uniformly distributed random value",
            ParameterSchema(vec![
                ParameterSpec::new("min", ParameterType::Number, "Minimum").default_value(json!(0.0)),
                ParameterSpec::new("max", ParameterType::Number, "Maximum").default_value(json!(1.0)),
                ParameterSpec::new("failure_rate", ParameterType::Number, "Simulated failure rate")
                    .range(Some(0.0), Some(1.0))
                    .default_value(json!(0.0)),
            ]),
            |config| {
                Ok(ProbeKind::Polling {
                    source: Arc::new(RandomSource::from_parameters(&config.parameters)),
                    interval: Duration::from_millis(config.polling_interval_ms.unwrap_or(1_000)),
                })
            },
        );

        registry.register(
            "simulated.stream",
            "Listens to a stream of pushed readings",
            ParameterSchema(vec![ParameterSpec::new(
                "period_ms",
                ParameterType::Integer,
                "Push period (ms)",
            )
            .range(Some(1.0), None)
            .default_value(json!(1_000))]),
            |config| {
                Ok(ProbeKind::Listening {
                    source: Arc::new(StreamSource::from_parameters(&config.parameters)),
                })
            },
        );

        registry
    }

    /// Register (or replace) a probe type.
    pub fn register<F>(&mut self, probe_type: &str, description: &str, schema: ParameterSchema, factory: F)
    where
        F: Fn(&ProbeConfig) -> Result<ProbeKind, String> + Send + Sync + 'static,
    {
        self.entries.insert(
            probe_type.to_string(),
            Registration {
                description: description.to_string(),
                schema,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn contains(&self, probe_type: &str) -> bool {
        self.entries.contains_key(probe_type)
    }

    /// Registered types with their descriptions, sorted by type.
    pub fn types(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.description.as_str()))
            .collect()
    }

    pub fn schema(&self, probe_type: &str) -> Option<&ParameterSchema> {
        self.entries.get(probe_type).map(|entry| &entry.schema)
    }

    /// Validate a probe entry's parameters and build its source.
    pub fn build(&self, config: &ProbeConfig) -> Result<ProbeKind, RuntimeError> {
        let entry = self.entries.get(&config.probe_type).ok_or_else(|| {
            RuntimeError::Protocol(format!("unknown probe type '{}'", config.probe_type))
        })?;

        entry
            .schema
            .validate(&config.parameters)
            .map_err(|reason| RuntimeError::Protocol(format!("{}: {reason}", config.probe_type)))?;

        (entry.factory)(config).map_err(|reason| RuntimeError::Protocol(format!("{}: {reason}", config.probe_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let registry = ProbeRegistry::builtin();
        let types: Vec<&str> = registry.types().into_iter().map(|(t, _)| t).collect();
        assert_eq!(types, vec!["simulated.random", "simulated.stream"]);
    }

    #[test]
    fn test_build_polling_with_interval() {
        let registry = ProbeRegistry::builtin();
        let mut config = ProbeConfig::new("simulated.random");
        config.polling_interval_ms = Some(250);

        match registry.build(&config).unwrap() {
            ProbeKind::Polling { interval, .. } => assert_eq!(interval, Duration::from_millis(250)),
            ProbeKind::Listening { .. } => panic!("expected a polling probe"),
        }
    }

    #[test]
    fn test_unknown_type_and_bad_parameters() {
        let registry = ProbeRegistry::builtin();
        assert!(registry.build(&ProbeConfig::new("gps")).is_err());

        let mut config = ProbeConfig::new("simulated.stream");
        config.parameters = json!({"period_ms": "fast"}).as_object().cloned().unwrap();
        assert!(matches!(registry.build(&config), Err(RuntimeError::Protocol(_))));
    }
}
