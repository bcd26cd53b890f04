//! Scheduler-driven prompt delivery.
//!
//! The agent decides on a scheduler thread. Approved prompts are handed to
//! the host on the main thread, so nothing reaches the prompt channel until
//! the host pumps its [`MainLoop`](crate::sync::MainLoop).

use super::{decide_with_timeout, DeliveryContext, ScriptRunnerAgent};
use crate::error::RuntimeError;
use crate::scheduler::{CallbackHandle, CallbackScheduler};
use crate::sync::MainThreadSynchronizer;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A prompt the host should present to the participant.
#[derive(Debug, Clone, Serialize)]
pub struct PromptEvent {
    pub id: Uuid,
    pub protocol_id: String,
    pub agent: String,
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

/// Asks an agent at every prompt opportunity and emits the prompts it approves.
pub struct ScriptRunner {
    scheduler: Arc<CallbackScheduler>,
    handle: Option<CallbackHandle>,
    delivered: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl ScriptRunner {
    /// Register the repeating prompt opportunity with the scheduler.
    pub fn start(
        scheduler: Arc<CallbackScheduler>,
        synchronizer: MainThreadSynchronizer,
        agent: Arc<dyn ScriptRunnerAgent>,
        protocol_id: &str,
        interval: Duration,
        decision_timeout: Duration,
        prompts: Sender<PromptEvent>,
    ) -> Result<Self, RuntimeError> {
        let delivered = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let approved = Arc::new(AtomicU64::new(0));

        let tick_delivered = delivered.clone();
        let tick_skipped = skipped.clone();
        let protocol_id = protocol_id.to_string();
        let agent_id = agent.id().to_string();

        let handle = scheduler.schedule_repeating(
            "script-runner",
            interval,
            interval,
            move |_| {
                let sequence = approved.load(Ordering::SeqCst);
                let ctx = DeliveryContext::now(&protocol_id, sequence);

                match decide_with_timeout(&agent, &ctx, decision_timeout) {
                    Ok(true) => {
                        approved.fetch_add(1, Ordering::SeqCst);
                        let event = PromptEvent {
                            id: Uuid::new_v4(),
                            protocol_id: protocol_id.clone(),
                            agent: agent.id().to_string(),
                            sequence,
                            at: ctx.now,
                        };
                        let prompts = prompts.clone();
                        let delivered = tick_delivered.clone();
                        let skipped = tick_skipped.clone();
                        let handoff = synchronizer.execute_async(move || {
                            match prompts.try_send(event) {
                                Ok(()) => {
                                    delivered.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(TrySendError::Full(_)) => {
                                    skipped.fetch_add(1, Ordering::SeqCst);
                                    warn!("prompt queue full, prompt dropped");
                                }
                                Err(TrySendError::Disconnected(_)) => {
                                    skipped.fetch_add(1, Ordering::SeqCst);
                                    debug!("no prompt consumer");
                                }
                            }
                        });
                        if let Err(e) = handoff {
                            tick_skipped.fetch_add(1, Ordering::SeqCst);
                            warn!("{e}; prompt dropped");
                        }
                    }
                    Ok(false) => {
                        tick_skipped.fetch_add(1, Ordering::SeqCst);
                        debug!(agent = %agent.id(), "agent declined prompt");
                    }
                    Err(e) => {
                        tick_skipped.fetch_add(1, Ordering::SeqCst);
                        warn!(agent = %agent.id(), "{e}; prompt skipped");
                    }
                }
            },
        )?;

        info!(agent = %agent_id, interval_ms = interval.as_millis() as u64, "prompt runner started");
        Ok(Self {
            scheduler,
            handle: Some(handle),
            delivered,
            skipped,
        })
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.scheduler.cancel(&handle);
            debug!("prompt runner stopped");
        }
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AlwaysDeliver, NeverDeliver};
    use crate::scheduler::NoopWakeBackend;

    fn scheduler() -> Arc<CallbackScheduler> {
        Arc::new(CallbackScheduler::new(Arc::new(NoopWakeBackend)).unwrap())
    }

    fn main_thread() -> MainThreadSynchronizer {
        MainThreadSynchronizer::spawn_dedicated("test-main").unwrap()
    }

    #[test]
    fn test_always_emits_prompts() {
        let (tx, rx) = crossbeam_channel::bounded(100);
        let mut runner = ScriptRunner::start(
            scheduler(),
            main_thread(),
            Arc::new(AlwaysDeliver),
            "p1",
            Duration::from_millis(10),
            Duration::from_secs(1),
            tx,
        )
        .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.protocol_id, "p1");
        assert_eq!(first.agent, "always");
        assert_eq!(first.sequence, 0);

        std::thread::sleep(Duration::from_millis(30));
        runner.stop();
        assert!(runner.delivered() >= 1);
    }

    #[test]
    fn test_prompts_reach_host_only_when_main_loop_runs() {
        let (sync, main_loop) = MainThreadSynchronizer::for_current_thread();
        let (tx, rx) = crossbeam_channel::bounded(100);
        let mut runner = ScriptRunner::start(
            scheduler(),
            sync,
            Arc::new(AlwaysDeliver),
            "p1",
            Duration::from_millis(10),
            Duration::from_secs(1),
            tx,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.delivered(), 0);

        assert!(main_loop.run_pending() >= 1);
        runner.stop();
        let prompts: Vec<_> = rx.try_iter().collect();
        assert!(!prompts.is_empty());
        assert_eq!(runner.delivered(), prompts.len() as u64);
    }

    #[test]
    fn test_never_emits_nothing() {
        let (tx, rx) = crossbeam_channel::bounded(100);
        let runner = ScriptRunner::start(
            scheduler(),
            main_thread(),
            Arc::new(NeverDeliver),
            "p1",
            Duration::from_millis(10),
            Duration::from_secs(1),
            tx,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert!(rx.try_recv().is_err());
        assert!(runner.skipped() >= 1);
        assert_eq!(runner.delivered(), 0);
    }
}
