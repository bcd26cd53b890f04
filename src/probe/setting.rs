//! Runtime changes to a probe's settings.

use serde::{Deserialize, Serialize};

/// One adjustable probe setting and its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "setting", rename_all = "snake_case")]
pub enum ProbeSetting {
    /// Disabling stops a running probe. Enabling starts it if its protocol is running.
    Enabled { value: bool },
    /// Polling probes only. A running probe restarts on the new cadence.
    PollingIntervalMs { value: u64 },
    /// `None` lifts the limit.
    MaxDataPerSecond { value: Option<f64> },
}

impl ProbeSetting {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ProbeSetting::Enabled { .. } => Ok(()),
            ProbeSetting::PollingIntervalMs { value: 0 } => {
                Err("polling interval must be greater than zero".to_string())
            }
            ProbeSetting::PollingIntervalMs { .. } => Ok(()),
            ProbeSetting::MaxDataPerSecond { value: Some(rate) }
                if !rate.is_finite() || *rate < 0.0 =>
            {
                Err(format!("invalid max_data_per_second {rate}"))
            }
            ProbeSetting::MaxDataPerSecond { .. } => Ok(()),
        }
    }
}

/// A setting addressed to one probe of a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    pub probe_type: String,
    #[serde(flatten)]
    pub setting: ProbeSetting,
}

impl SettingChange {
    pub fn new(probe_type: &str, setting: ProbeSetting) -> Self {
        Self {
            probe_type: probe_type.to_string(),
            setting,
        }
    }
}
