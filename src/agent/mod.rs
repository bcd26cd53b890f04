//! Survey delivery and adaptive sensing policies.
//!
//! A [`ScriptRunnerAgent`] decides, at each prompt opportunity, whether a
//! pending prompt should actually be shown. The scheduler-driven
//! [`ScriptRunner`] asks the agent with a timeout so a slow policy can never
//! stall the scheduler. A [`SensingAgent`] adjusts probe settings from the
//! data it observes.

pub mod runner;
pub mod sensing;

pub use runner::{PromptEvent, ScriptRunner};
pub use sensing::{
    AgentObserver, RuleSensingAgent, SensingAgent, SensingAgentSpec, SensingRunner, SensingState,
};

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use crossbeam_channel::{bounded, RecvTimeoutError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AgentError {
    #[error("invalid policy for agent '{agent}': {reason}")]
    InvalidPolicy { agent: String, reason: String },
    #[error("agent did not decide within {0:?}")]
    TimedOut(Duration),
    #[error("agent panicked while deciding")]
    Panicked,
    #[error("could not run agent: {0}")]
    Unavailable(String),
}

/// What an agent knows when asked to decide.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub now: DateTime<Utc>,
    pub protocol_id: String,
    /// Prompts delivered so far in this session.
    pub delivered: u64,
}

impl DeliveryContext {
    pub fn now(protocol_id: &str, delivered: u64) -> Self {
        Self {
            now: Utc::now(),
            protocol_id: protocol_id.to_string(),
            delivered,
        }
    }
}

/// Pluggable prompt delivery policy.
pub trait ScriptRunnerAgent: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    fn should_deliver_survey(&self, ctx: &DeliveryContext) -> bool;

    /// Replace the agent's policy from a JSON document.
    fn set_policy(&self, _policy: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    /// Current policy as JSON.
    fn policy(&self) -> Value {
        Value::Null
    }
}

/// Ask `agent` to decide, giving up after `timeout`.
///
/// The agent runs on a helper thread. On timeout that thread is abandoned
/// and its eventual answer ignored.
pub fn decide_with_timeout(
    agent: &Arc<dyn ScriptRunnerAgent>,
    ctx: &DeliveryContext,
    timeout: Duration,
) -> Result<bool, AgentError> {
    let (done, decision) = bounded(1);
    let agent = agent.clone();
    let ctx = ctx.clone();

    thread::Builder::new()
        .name("agent-decision".to_string())
        .spawn(move || {
            let _ = done.send(agent.should_deliver_survey(&ctx));
        })
        .map_err(|e| AgentError::Unavailable(e.to_string()))?;

    decision.recv_timeout(timeout).map_err(|e| match e {
        RecvTimeoutError::Timeout => AgentError::TimedOut(timeout),
        RecvTimeoutError::Disconnected => AgentError::Panicked,
    })
}

pub struct AlwaysDeliver;

impl ScriptRunnerAgent for AlwaysDeliver {
    fn id(&self) -> &str {
        "always"
    }

    fn description(&self) -> &str {
        "Delivers every prompt"
    }

    fn should_deliver_survey(&self, _ctx: &DeliveryContext) -> bool {
        true
    }
}

pub struct NeverDeliver;

impl ScriptRunnerAgent for NeverDeliver {
    fn id(&self) -> &str {
        "never"
    }

    fn description(&self) -> &str {
        "Delivers no prompts"
    }

    fn should_deliver_survey(&self, _ctx: &DeliveryContext) -> bool {
        false
    }
}

/// Delivers each prompt independently with probability `p`.
pub struct RandomDelivery {
    p: RwLock<f64>,
}

impl RandomDelivery {
    pub fn new(p: f64) -> Result<Self, AgentError> {
        Ok(Self {
            p: RwLock::new(check_probability(p)?),
        })
    }

    pub fn probability(&self) -> f64 {
        self.p.read().map(|p| *p).unwrap_or(0.0)
    }
}

fn check_probability(p: f64) -> Result<f64, AgentError> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(AgentError::InvalidPolicy {
            agent: "random".to_string(),
            reason: format!("p must be within [0, 1], got {p}"),
        })
    }
}

impl ScriptRunnerAgent for RandomDelivery {
    fn id(&self) -> &str {
        "random"
    }

    fn description(&self) -> &str {
        "Delivers each prompt with a fixed probability"
    }

    fn should_deliver_survey(&self, _ctx: &DeliveryContext) -> bool {
        let p = self.probability();
        // Exact at the bounds.
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < p
    }

    fn set_policy(&self, policy: &Value) -> Result<(), AgentError> {
        let p = policy
            .get("p")
            .and_then(Value::as_f64)
            .ok_or_else(|| AgentError::InvalidPolicy {
                agent: "random".to_string(),
                reason: "expected {\"p\": <number>}".to_string(),
            })?;
        let p = check_probability(p)?;
        if let Ok(mut current) = self.p.write() {
            *current = p;
        }
        Ok(())
    }

    fn policy(&self) -> Value {
        serde_json::json!({ "p": self.probability() })
    }
}

/// Delivers only between `start_hour` (inclusive) and `end_hour` (exclusive)
/// local time in `timezone`. A window with `start_hour > end_hour` wraps midnight.
pub struct TimeWindowDelivery {
    timezone: Tz,
    start_hour: u32,
    end_hour: u32,
}

impl TimeWindowDelivery {
    pub fn new(timezone: &str, start_hour: u32, end_hour: u32) -> Result<Self, AgentError> {
        let invalid = |reason: String| AgentError::InvalidPolicy {
            agent: "time_window".to_string(),
            reason,
        };
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| invalid(format!("unknown timezone '{timezone}'")))?;
        if start_hour > 23 || end_hour > 24 {
            return Err(invalid(format!("hours out of range: {start_hour}-{end_hour}")));
        }
        Ok(Self {
            timezone,
            start_hour,
            end_hour,
        })
    }

    fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl ScriptRunnerAgent for TimeWindowDelivery {
    fn id(&self) -> &str {
        "time_window"
    }

    fn description(&self) -> &str {
        "Delivers prompts only within a local time-of-day window"
    }

    fn should_deliver_survey(&self, ctx: &DeliveryContext) -> bool {
        self.contains(ctx.now.with_timezone(&self.timezone).hour())
    }

    fn policy(&self) -> Value {
        serde_json::json!({
            "timezone": self.timezone.name(),
            "start_hour": self.start_hour,
            "end_hour": self.end_hour,
        })
    }
}

/// Serialized agent choice, as stored in a protocol document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agent", rename_all = "snake_case")]
pub enum AgentSpec {
    Always,
    Never,
    Random {
        p: f64,
    },
    TimeWindow {
        timezone: String,
        start_hour: u32,
        end_hour: u32,
    },
}

impl AgentSpec {
    pub fn build(&self) -> Result<Arc<dyn ScriptRunnerAgent>, AgentError> {
        let agent: Arc<dyn ScriptRunnerAgent> = match self {
            AgentSpec::Always => Arc::new(AlwaysDeliver),
            AgentSpec::Never => Arc::new(NeverDeliver),
            AgentSpec::Random { p } => Arc::new(RandomDelivery::new(*p)?),
            AgentSpec::TimeWindow {
                timezone,
                start_hour,
                end_hour,
            } => Arc::new(TimeWindowDelivery::new(timezone, *start_hour, *end_hour)?),
        };
        Ok(agent)
    }
}
