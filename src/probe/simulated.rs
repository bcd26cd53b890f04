//! Simulated capture sources for hosts without sensor hardware.

use super::source::{
    CaptureContext, CaptureError, ListeningSource, PollingSource, RawReading, ReadingEvent,
};
use crossbeam_channel::Sender;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Polling source producing one uniformly distributed value per poll.
#[derive(Debug, Clone)]
pub struct RandomSource {
    pub min: f64,
    pub max: f64,
    /// Probability that a poll fails with a transient error.
    pub failure_rate: f64,
}

impl Default for RandomSource {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            failure_rate: 0.0,
        }
    }
}

impl RandomSource {
    /// Build from a probe's free-form parameters (`min`, `max`, `failure_rate`).
    pub fn from_parameters(parameters: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let get = |name: &str, fallback: f64| {
            parameters
                .get(name)
                .and_then(Value::as_f64)
                .unwrap_or(fallback)
        };
        Self {
            min: get("min", defaults.min),
            max: get("max", defaults.max),
            failure_rate: get("failure_rate", defaults.failure_rate),
        }
    }
}

impl PollingSource for RandomSource {
    fn initialize(&self) -> Result<(), String> {
        if self.min > self.max {
            return Err(format!("min {} exceeds max {}", self.min, self.max));
        }
        Ok(())
    }

    fn poll(&self, _ctx: &CaptureContext<'_>) -> Result<Vec<RawReading>, CaptureError> {
        let mut rng = rand::thread_rng();
        if self.failure_rate > 0.0 && rng.gen::<f64>() < self.failure_rate {
            return Err(CaptureError::Transient("simulated sensor glitch".to_string()));
        }

        let value = if self.min == self.max {
            self.min
        } else {
            rng.gen_range(self.min..self.max)
        };
        let mut fields = Map::new();
        fields.insert("value".to_string(), json!(value));
        Ok(vec![RawReading::now(fields)])
    }
}

/// Listening source that pushes a reading every `period` from its own thread.
pub struct StreamSource {
    period: Duration,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSource {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Build from a probe's free-form parameters (`period_ms`, default 1000).
    pub fn from_parameters(parameters: &Map<String, Value>) -> Self {
        let period_ms = parameters
            .get("period_ms")
            .and_then(Value::as_u64)
            .unwrap_or(1000)
            .max(1);
        Self::new(Duration::from_millis(period_ms))
    }
}

impl ListeningSource for StreamSource {
    fn subscribe(&self, events: Sender<ReadingEvent>) -> Result<(), CaptureError> {
        let mut thread_slot = self
            .thread
            .lock()
            .map_err(|_| CaptureError::Transient("stream source lock poisoned".to_string()))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::Transient("already subscribed".to_string()));
        }

        let running = self.running.clone();
        let period = self.period;
        let spawned = thread::Builder::new()
            .name("simulated-stream".to_string())
            .spawn(move || {
                let mut sequence: u64 = 0;
                while running.load(Ordering::SeqCst) {
                    let mut fields = Map::new();
                    fields.insert("sequence".to_string(), json!(sequence));
                    fields.insert("level".to_string(), json!(rand::thread_rng().gen::<f64>()));
                    if events.send(Ok(RawReading::now(fields))).is_err() {
                        break;
                    }
                    sequence += 1;
                    thread::sleep(period);
                }
            });

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CaptureError::Transient(format!("could not start stream: {e}")))
            }
        }
    }

    fn unsubscribe(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
