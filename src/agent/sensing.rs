//! Adaptive sensing.
//!
//! A [`SensingAgent`] observes the datums a protocol stores and, at each
//! action opportunity, may ask for probe setting changes. The
//! [`SensingRunner`] drives the agent from the scheduler and applies what it
//! returns.
//!
//! [`RuleSensingAgent`] evaluates declarative statements over the
//! observations in its window. When a statement is satisfied the agent enters
//! control and returns that statement's `begin_control` changes. It stays in
//! control until the same statement stops being satisfied, then returns the
//! statement's `end_control` changes.

use super::AgentError;
use crate::datum::Datum;
use crate::error::RuntimeError;
use crate::probe::{ProbeHandle, SettingChange};
use crate::scheduler::{CallbackHandle, CallbackScheduler};
use crate::store::DatumObserver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statrs::statistics::Statistics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Observations kept per probe type.
const MAX_OBSERVATIONS: usize = 1024;

const EQUALITY_TOLERANCE: f64 = 1e-7;

fn default_observation_window() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensingState {
    Idle,
    Control,
}

/// Pluggable adaptive sensing policy.
pub trait SensingAgent: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Replace the agent's policy from a JSON document.
    fn set_policy(&self, policy: &Value) -> Result<(), AgentError>;

    fn policy(&self) -> Value;

    /// Called for every datum the protocol stores. Must not block.
    fn observe(&self, datum: &Datum);

    /// Decide at an action opportunity. Changes are applied in order.
    fn act(&self, now: DateTime<Utc>) -> Vec<SettingChange>;

    fn state(&self) -> SensingState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    Conjunction,
    Disjunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Any,
    Average,
    Maximum,
    Minimum,
    MostRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    EqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
}

impl Relation {
    /// Numbers compare numerically. Anything else only supports `equal_to`.
    fn holds(self, value: &Value, target: &Value) -> bool {
        match (self, value.as_f64().zip(target.as_f64())) {
            (Relation::EqualTo, Some((v, t))) => (v - t).abs() < EQUALITY_TOLERANCE,
            (Relation::EqualTo, None) => value == target,
            (Relation::GreaterThan, Some((v, t))) => v > t,
            (Relation::GreaterThanOrEqualTo, Some((v, t))) => v >= t,
            (Relation::LessThan, Some((v, t))) => v < t,
            (Relation::LessThanOrEqualTo, Some((v, t))) => v <= t,
            (_, None) => false,
        }
    }
}

/// A condition on one field of one probe type's observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub probe_type: String,
    pub field: String,
    pub aggregation: Aggregation,
    pub relation: Relation,
    pub target: Value,
}

impl Element {
    fn satisfied_by(&self, observed: &VecDeque<Datum>) -> bool {
        let mut values = observed.iter().filter_map(|d| d.field(&self.field));
        let numbers = || -> Vec<f64> {
            observed
                .iter()
                .filter_map(|d| d.field(&self.field).and_then(Value::as_f64))
                .collect()
        };

        let aggregate = match self.aggregation {
            Aggregation::Any => return values.any(|v| self.relation.holds(v, &self.target)),
            Aggregation::MostRecent => {
                return observed
                    .iter()
                    .filter(|d| d.field(&self.field).is_some())
                    .max_by_key(|d| d.timestamp())
                    .and_then(|d| d.field(&self.field))
                    .is_some_and(|v| self.relation.holds(v, &self.target))
            }
            Aggregation::Average => {
                let numbers = numbers();
                (!numbers.is_empty()).then(|| numbers.iter().mean())
            }
            Aggregation::Maximum => numbers().into_iter().reduce(f64::max),
            Aggregation::Minimum => numbers().into_iter().reduce(f64::min),
        };
        aggregate.is_some_and(|a| self.relation.holds(&Value::from(a), &self.target))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub logic: Logic,
    pub elements: Vec<Element>,
}

impl Criterion {
    /// An element with no observations of its probe type is unsatisfied.
    pub fn satisfied_by(&self, observed: &HashMap<String, VecDeque<Datum>>) -> bool {
        let mut results = self.elements.iter().map(|element| {
            observed
                .get(&element.probe_type)
                .is_some_and(|data| element.satisfied_by(data))
        });
        match self.logic {
            Logic::Conjunction => results.all(|r| r),
            Logic::Disjunction => results.any(|r| r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub criterion: Criterion,
    #[serde(default)]
    pub begin_control: Vec<SettingChange>,
    #[serde(default)]
    pub end_control: Vec<SettingChange>,
}

/// Policy document of a [`RuleSensingAgent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePolicy {
    #[serde(
        with = "crate::config::duration_ms",
        rename = "observation_window_ms",
        default = "default_observation_window"
    )]
    pub observation_window: Duration,
    pub statements: Vec<Statement>,
}

impl RulePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.observation_window.is_zero() {
            return Err("observation window must be greater than zero".to_string());
        }
        let mut ids = HashSet::new();
        for statement in &self.statements {
            if statement.id.trim().is_empty() {
                return Err("statement id is empty".to_string());
            }
            if !ids.insert(statement.id.as_str()) {
                return Err(format!("duplicate statement id '{}'", statement.id));
            }
            for change in statement.begin_control.iter().chain(&statement.end_control) {
                change
                    .setting
                    .validate()
                    .map_err(|e| format!("statement '{}': {e}", statement.id))?;
            }
        }
        Ok(())
    }

    /// Every change any statement can issue.
    pub fn setting_changes(&self) -> impl Iterator<Item = &SettingChange> {
        self.statements
            .iter()
            .flat_map(|s| s.begin_control.iter().chain(&s.end_control))
    }

    fn observes(&self, probe_type: &str) -> bool {
        self.statements
            .iter()
            .flat_map(|s| &s.criterion.elements)
            .any(|e| e.probe_type == probe_type)
    }
}

struct RuleState {
    policy: RulePolicy,
    observed: HashMap<String, VecDeque<Datum>>,
    /// The statement that began the ongoing control.
    control: Option<Statement>,
}

/// Adjusts probe settings when policy statements hold over recent data.
pub struct RuleSensingAgent {
    state: Mutex<RuleState>,
}

fn invalid_policy(reason: String) -> AgentError {
    AgentError::InvalidPolicy {
        agent: "rule".to_string(),
        reason,
    }
}

impl RuleSensingAgent {
    pub fn new(policy: RulePolicy) -> Result<Self, AgentError> {
        policy.validate().map_err(invalid_policy)?;
        Ok(Self {
            state: Mutex::new(RuleState {
                policy,
                observed: HashMap::new(),
                control: None,
            }),
        })
    }

    /// Id of the statement in control, if any.
    pub fn active_statement(&self) -> Option<String> {
        self.lock().control.as_ref().map(|s| s.id.clone())
    }

    fn lock(&self) -> MutexGuard<'_, RuleState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SensingAgent for RuleSensingAgent {
    fn id(&self) -> &str {
        "rule"
    }

    fn description(&self) -> &str {
        "Adjusts probe settings when policy statements hold over recent data"
    }

    /// An ongoing control keeps its statement, so its `end_control` changes
    /// still apply under the new policy.
    fn set_policy(&self, policy: &Value) -> Result<(), AgentError> {
        let policy: RulePolicy =
            serde_json::from_value(policy.clone()).map_err(|e| invalid_policy(e.to_string()))?;
        policy.validate().map_err(invalid_policy)?;

        let mut state = self.lock();
        state.observed.retain(|probe_type, _| policy.observes(probe_type));
        state.policy = policy;
        Ok(())
    }

    fn policy(&self) -> Value {
        serde_json::to_value(&self.lock().policy).unwrap_or(Value::Null)
    }

    fn observe(&self, datum: &Datum) {
        let mut state = self.lock();
        if !state.policy.observes(datum.probe_type()) {
            return;
        }
        let queue = state
            .observed
            .entry(datum.probe_type().to_string())
            .or_default();
        if queue.len() == MAX_OBSERVATIONS {
            queue.pop_front();
        }
        queue.push_back(datum.clone());
    }

    fn act(&self, now: DateTime<Utc>) -> Vec<SettingChange> {
        let mut state = self.lock();
        let window = chrono::Duration::from_std(state.policy.observation_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        let cutoff = now - window;
        for queue in state.observed.values_mut() {
            queue.retain(|d| d.timestamp() >= cutoff);
        }

        let RuleState {
            policy,
            observed,
            control,
        } = &mut *state;
        let observed = &*observed;
        match control.take() {
            None => {
                let Some(statement) = policy
                    .statements
                    .iter()
                    .find(|s| s.criterion.satisfied_by(observed))
                else {
                    return Vec::new();
                };
                info!(statement = %statement.id, "sensing agent entering control");
                *control = Some(statement.clone());
                statement.begin_control.clone()
            }
            Some(active) if active.criterion.satisfied_by(observed) => {
                *control = Some(active);
                Vec::new()
            }
            Some(active) => {
                info!(statement = %active.id, "sensing agent ending control");
                active.end_control
            }
        }
    }

    fn state(&self) -> SensingState {
        if self.lock().control.is_some() {
            SensingState::Control
        } else {
            SensingState::Idle
        }
    }
}

/// Serialized sensing agent choice, as stored in a protocol document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agent", rename_all = "snake_case")]
pub enum SensingAgentSpec {
    Rule { policy: RulePolicy },
}

impl SensingAgentSpec {
    pub fn build(&self) -> Result<Arc<dyn SensingAgent>, AgentError> {
        let agent: Arc<dyn SensingAgent> = match self {
            SensingAgentSpec::Rule { policy } => Arc::new(RuleSensingAgent::new(policy.clone())?),
        };
        Ok(agent)
    }

    /// Every change the agent can issue.
    pub fn setting_changes(&self) -> Vec<&SettingChange> {
        match self {
            SensingAgentSpec::Rule { policy } => policy.setting_changes().collect(),
        }
    }
}

/// Feeds a store's datums to a sensing agent.
pub struct AgentObserver(pub Arc<dyn SensingAgent>);

impl DatumObserver for AgentObserver {
    fn observe(&self, datum: &Datum) {
        self.0.observe(datum);
    }
}

/// Apply one change to the probe it names.
pub fn apply_change(probes: &[ProbeHandle], change: &SettingChange) -> Result<(), RuntimeError> {
    probes
        .iter()
        .find(|p| p.probe_type() == change.probe_type)
        .ok_or_else(|| RuntimeError::Protocol(format!("unknown probe type '{}'", change.probe_type)))?
        .apply(&change.setting)
}

/// Gives a sensing agent an action opportunity every interval.
pub struct SensingRunner {
    scheduler: Arc<CallbackScheduler>,
    agent: Arc<dyn SensingAgent>,
    handle: Option<CallbackHandle>,
    applied: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl SensingRunner {
    pub fn start(
        scheduler: Arc<CallbackScheduler>,
        agent: Arc<dyn SensingAgent>,
        interval: Duration,
        probes: Vec<ProbeHandle>,
    ) -> Result<Self, RuntimeError> {
        let applied = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let tick_agent = agent.clone();
        let tick_applied = applied.clone();
        let tick_failed = failed.clone();
        let handle = scheduler.schedule_repeating("sensing-agent", interval, interval, move |_| {
            let changes = tick_agent.act(Utc::now());
            if changes.is_empty() {
                return;
            }
            debug!(agent = %tick_agent.id(), count = changes.len(), "applying setting changes");
            for change in &changes {
                match apply_change(&probes, change) {
                    Ok(()) => {
                        tick_applied.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tick_failed.fetch_add(1, Ordering::SeqCst);
                        warn!(agent = %tick_agent.id(), probe = %change.probe_type, "{e}");
                    }
                }
            }
        })?;

        info!(agent = %agent.id(), interval_ms = interval.as_millis() as u64, "sensing agent started");
        Ok(Self {
            scheduler,
            agent,
            handle: Some(handle),
            applied,
            failed,
        })
    }

    pub fn agent(&self) -> &Arc<dyn SensingAgent> {
        &self.agent
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.scheduler.cancel(&handle);
            debug!(agent = %self.agent.id(), "sensing agent stopped");
        }
    }
}

impl Drop for SensingRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeSetting;
    use serde_json::{json, Map};

    fn reading(probe_type: &str, at: DateTime<Utc>, value: Value) -> Datum {
        let mut payload = Map::new();
        payload.insert("value".to_string(), value);
        Datum::at(probe_type, at, payload)
    }

    fn element(aggregation: Aggregation, relation: Relation, target: Value) -> Element {
        Element {
            probe_type: "accel".to_string(),
            field: "value".to_string(),
            aggregation,
            relation,
            target,
        }
    }

    fn observed(values: &[f64]) -> VecDeque<Datum> {
        let start = Utc::now() - chrono::Duration::seconds(values.len() as i64);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| reading("accel", start + chrono::Duration::seconds(i as i64), json!(v)))
            .collect()
    }

    fn policy() -> RulePolicy {
        serde_json::from_value(json!({
            "observation_window_ms": 60_000,
            "statements": [{
                "id": "moving",
                "criterion": {
                    "logic": "conjunction",
                    "elements": [{
                        "probe_type": "accel",
                        "field": "value",
                        "aggregation": "most_recent",
                        "relation": "greater_than",
                        "target": 1.5
                    }]
                },
                "begin_control": [
                    {"probe_type": "gps", "setting": "polling_interval_ms", "value": 1000}
                ],
                "end_control": [
                    {"probe_type": "gps", "setting": "polling_interval_ms", "value": 60000}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_aggregations() {
        let data = observed(&[1.0, 5.0, 3.0]);
        let holds = |aggregation, relation, target: f64| {
            element(aggregation, relation, json!(target)).satisfied_by(&data)
        };

        assert!(holds(Aggregation::Average, Relation::EqualTo, 3.0));
        assert!(holds(Aggregation::Maximum, Relation::GreaterThanOrEqualTo, 5.0));
        assert!(!holds(Aggregation::Maximum, Relation::GreaterThan, 5.0));
        assert!(holds(Aggregation::Minimum, Relation::LessThanOrEqualTo, 1.0));
        assert!(holds(Aggregation::MostRecent, Relation::EqualTo, 3.0));
        assert!(!holds(Aggregation::MostRecent, Relation::EqualTo, 5.0));
        assert!(holds(Aggregation::Any, Relation::EqualTo, 5.0));
        assert!(!holds(Aggregation::Any, Relation::LessThan, 1.0));
        assert!(!element(Aggregation::Average, Relation::EqualTo, json!(3.0)).satisfied_by(&VecDeque::new()));
    }

    #[test]
    fn test_non_numeric_values() {
        let data: VecDeque<Datum> = vec![reading("accel", Utc::now(), json!("walking"))].into();
        assert!(element(Aggregation::Any, Relation::EqualTo, json!("walking")).satisfied_by(&data));
        assert!(!element(Aggregation::Any, Relation::GreaterThan, json!("a")).satisfied_by(&data));
        assert!(!element(Aggregation::Average, Relation::EqualTo, json!(0)).satisfied_by(&data));
    }

    #[test]
    fn test_criterion_logic() {
        let mut observed_by_type = HashMap::new();
        observed_by_type.insert("accel".to_string(), observed(&[2.0]));

        let high = element(Aggregation::MostRecent, Relation::GreaterThan, json!(1.0));
        let low = element(Aggregation::MostRecent, Relation::LessThan, json!(1.0));
        let unseen = Element {
            probe_type: "gps".to_string(),
            ..high.clone()
        };

        let criterion = |logic, elements| Criterion { logic, elements };
        assert!(criterion(Logic::Conjunction, vec![high.clone()]).satisfied_by(&observed_by_type));
        assert!(!criterion(Logic::Conjunction, vec![high.clone(), low.clone()]).satisfied_by(&observed_by_type));
        assert!(criterion(Logic::Disjunction, vec![low.clone(), high.clone()]).satisfied_by(&observed_by_type));
        assert!(!criterion(Logic::Disjunction, vec![low, unseen]).satisfied_by(&observed_by_type));
    }

    #[test]
    fn test_control_begins_and_ends_with_same_statement() {
        let agent = RuleSensingAgent::new(policy()).unwrap();
        let now = Utc::now();
        assert!(agent.act(now).is_empty());
        assert_eq!(agent.state(), SensingState::Idle);

        agent.observe(&reading("accel", now, json!(2.0)));
        // Unreferenced types are ignored.
        agent.observe(&reading("battery", now, json!(0.1)));
        let begin = agent.act(now);
        assert_eq!(
            begin,
            vec![SettingChange::new("gps", ProbeSetting::PollingIntervalMs { value: 1000 })]
        );
        assert_eq!(agent.state(), SensingState::Control);
        assert_eq!(agent.active_statement().as_deref(), Some("moving"));

        // Still satisfied: no further changes.
        assert!(agent.act(now).is_empty());

        agent.observe(&reading("accel", now + chrono::Duration::seconds(1), json!(1.0)));
        let end = agent.act(now + chrono::Duration::seconds(1));
        assert_eq!(
            end,
            vec![SettingChange::new("gps", ProbeSetting::PollingIntervalMs { value: 60000 })]
        );
        assert_eq!(agent.state(), SensingState::Idle);
    }

    #[test]
    fn test_observations_outside_window_are_ignored() {
        let agent = RuleSensingAgent::new(policy()).unwrap();
        let now = Utc::now();
        agent.observe(&reading("accel", now - chrono::Duration::minutes(2), json!(9.0)));
        assert!(agent.act(now).is_empty());
        assert_eq!(agent.state(), SensingState::Idle);
    }

    #[test]
    fn test_set_policy_validates() {
        let agent = RuleSensingAgent::new(policy()).unwrap();

        let mut zero_window = serde_json::to_value(policy()).unwrap();
        zero_window["observation_window_ms"] = json!(0);
        assert!(agent.set_policy(&zero_window).is_err());

        let mut duplicate = policy();
        duplicate.statements.push(duplicate.statements[0].clone());
        assert!(agent.set_policy(&serde_json::to_value(duplicate).unwrap()).is_err());

        let mut bad_setting = policy();
        bad_setting.statements[0].begin_control[0].setting =
            ProbeSetting::PollingIntervalMs { value: 0 };
        assert!(RuleSensingAgent::new(bad_setting).is_err());

        assert!(agent.set_policy(&json!({"statements": "none"})).is_err());

        let mut longer = policy();
        longer.observation_window = Duration::from_secs(300);
        agent.set_policy(&serde_json::to_value(&longer).unwrap()).unwrap();
        assert_eq!(agent.policy()["observation_window_ms"], 300_000);
    }

    #[test]
    fn test_spec_json_shape() {
        let spec: SensingAgentSpec = serde_json::from_value(json!({
            "agent": "rule",
            "policy": serde_json::to_value(policy()).unwrap()
        }))
        .unwrap();
        assert_eq!(spec.build().unwrap().id(), "rule");
        assert_eq!(spec.setting_changes().len(), 2);
    }

    #[test]
    fn test_apply_change_to_unknown_probe() {
        let change = SettingChange::new("gps", ProbeSetting::Enabled { value: false });
        assert!(matches!(apply_change(&[], &change), Err(RuntimeError::Protocol(_))));
    }
}
