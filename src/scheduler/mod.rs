//! Process-wide callback scheduler.
//!
//! A single timer thread keeps a deadline queue and hands due callbacks to
//! their own background threads. Repeating callbacks are re-queued only once
//! the previous firing has returned, so one callback never overlaps itself.
//!
//! While [`suspend`](CallbackScheduler::suspend)ed nothing fires. On
//! [`resume`](CallbackScheduler::resume) every overdue callback fires once and
//! its cadence is realigned, unless it was scheduled with catch-up, in which
//! case each missed interval fires back to back.

pub mod backend;

pub use backend::{FileWakeBackend, NoopWakeBackend, WakeBackend, WakeHandle};

use crate::error::RuntimeError;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};
use uuid::Uuid;

/// Identity of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(Uuid);

impl CallbackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Cooperative cancellation signal shared between a scheduler entry and its body.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Passed to a callback body on every firing.
pub struct CallbackContext<'a> {
    id: CallbackId,
    cancel: &'a CancelFlag,
    scheduled_for: Instant,
}

impl CallbackContext<'_> {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Bodies doing long work should poll this and exit early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        self.cancel
    }

    /// How late this firing is relative to its target time.
    pub fn lateness(&self) -> Duration {
        Instant::now().saturating_duration_since(self.scheduled_for)
    }
}

type CallbackBody = Arc<dyn Fn(&CallbackContext<'_>) + Send + Sync>;

/// Returned by [`CallbackScheduler::schedule`]; used to cancel.
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    id: CallbackId,
    cancel: CancelFlag,
}

impl CallbackHandle {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Timing options for a scheduled callback.
#[derive(Debug, Clone)]
pub struct CallbackOptions {
    pub name: String,
    pub delay: Duration,
    pub repeat: Option<Duration>,
    pub catch_up: bool,
}

impl CallbackOptions {
    pub fn once(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            repeat: None,
            catch_up: false,
        }
    }

    pub fn repeating(name: impl Into<String>, delay: Duration, interval: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            repeat: Some(interval),
            catch_up: false,
        }
    }

    /// Fire once per missed interval after a suspension instead of once in total.
    pub fn with_catch_up(mut self) -> Self {
        self.catch_up = true;
        self
    }
}

struct Entry {
    name: String,
    body: CallbackBody,
    repeat: Option<Duration>,
    catch_up: bool,
    cancel: CancelFlag,
    wake: Option<WakeHandle>,
    queued_seq: u64,
    running: bool,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<(Instant, u64, CallbackId)>>,
    entries: HashMap<CallbackId, Entry>,
    next_seq: u64,
    in_flight: usize,
    suspended: bool,
    shutdown: bool,
}

impl State {
    fn enqueue(&mut self, id: CallbackId, target: Instant) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.queue.push(Reverse((target, seq, id)));
        seq
    }
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    backend: Arc<dyn WakeBackend>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Timer/alarm abstraction that invokes registered work on background threads.
pub struct CallbackScheduler {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackScheduler {
    /// Create a scheduler and start its timer thread.
    ///
    /// Fails with [`RuntimeError::SchedulerPersistence`] if the timer thread
    /// cannot be spawned, since nothing scheduled could ever fire.
    pub fn new(backend: Arc<dyn WakeBackend>) -> Result<Self, RuntimeError> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            backend,
        });

        let timer_inner = inner.clone();
        let timer = thread::Builder::new()
            .name("callback-scheduler".to_string())
            .spawn(move || run_timer(timer_inner))
            .map_err(|e| {
                RuntimeError::SchedulerPersistence(format!("could not start timer thread: {e}"))
            })?;

        Ok(Self {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Schedule `body` according to `options`.
    ///
    /// Fails with [`RuntimeError::SchedulerPersistence`] if the wake backend
    /// cannot register the callback.
    pub fn schedule<F>(&self, options: CallbackOptions, body: F) -> Result<CallbackHandle, RuntimeError>
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        if options.repeat.is_some_and(|r| r.is_zero()) {
            return Err(RuntimeError::InvalidOperation(format!(
                "callback '{}' has a zero repeat interval",
                options.name
            )));
        }

        let id = CallbackId::new();
        let wake_at = Utc::now()
            + chrono::Duration::from_std(options.delay).unwrap_or(chrono::Duration::zero());
        let wake = self
            .inner
            .backend
            .schedule_wake(id, wake_at, options.repeat)
            .map_err(RuntimeError::SchedulerPersistence)?;

        let cancel = CancelFlag::new();
        let target = Instant::now() + options.delay;

        let mut state = self.inner.lock();
        if state.shutdown {
            drop(state);
            self.inner.backend.cancel_wake(&wake);
            return Err(RuntimeError::InvalidOperation(
                "scheduler has been shut down".to_string(),
            ));
        }

        let seq = state.enqueue(id, target);
        debug!(callback = %options.name, id = %id, delay_ms = options.delay.as_millis() as u64, "scheduled callback");
        state.entries.insert(
            id,
            Entry {
                name: options.name,
                body: Arc::new(body),
                repeat: options.repeat,
                catch_up: options.catch_up,
                cancel: cancel.clone(),
                wake: Some(wake),
                queued_seq: seq,
                running: false,
            },
        );
        drop(state);
        self.inner.cond.notify_all();

        Ok(CallbackHandle { id, cancel })
    }

    /// Convenience wrapper for a one-shot callback.
    pub fn schedule_once<F>(
        &self,
        name: &str,
        delay: Duration,
        body: F,
    ) -> Result<CallbackHandle, RuntimeError>
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.schedule(CallbackOptions::once(name, delay), body)
    }

    /// Convenience wrapper for a repeating callback.
    pub fn schedule_repeating<F>(
        &self,
        name: &str,
        delay: Duration,
        interval: Duration,
        body: F,
    ) -> Result<CallbackHandle, RuntimeError>
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.schedule(CallbackOptions::repeating(name, delay, interval), body)
    }

    /// Cancel a callback. An in-flight firing sees the cancellation flag and
    /// is not rescheduled. Returns whether the callback was still scheduled.
    pub fn cancel(&self, handle: &CallbackHandle) -> bool {
        handle.cancel.cancel();

        let removed = self.inner.lock().entries.remove(&handle.id);
        match removed {
            Some(entry) => {
                if let Some(wake) = entry.wake {
                    self.inner.backend.cancel_wake(&wake);
                }
                debug!(callback = %entry.name, "cancelled callback");
                self.inner.cond.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: CallbackId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Number of registered callbacks (including ones currently firing).
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of callback bodies executing right now.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Stop firing until [`resume`](Self::resume). Models the host process
    /// being suspended by the OS.
    pub fn suspend(&self) {
        self.inner.lock().suspended = true;
        debug!("scheduler suspended");
    }

    pub fn resume(&self) {
        self.inner.lock().suspended = false;
        self.inner.cond.notify_all();
        debug!("scheduler resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    /// Cancel everything and stop the timer thread. Bodies already running finish.
    pub fn shutdown(&self) {
        let wakes: Vec<WakeHandle> = {
            let mut state = self.inner.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.clear();
            state
                .entries
                .drain()
                .filter_map(|(_, entry)| {
                    entry.cancel.cancel();
                    entry.wake
                })
                .collect()
        };
        self.inner.cond.notify_all();

        for wake in &wakes {
            self.inner.backend.cancel_wake(wake);
        }

        let timer = self.timer.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = timer {
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(inner: Arc<Inner>) {
    let mut state = inner.lock();
    loop {
        if state.shutdown {
            break;
        }
        if state.suspended {
            state = inner.cond.wait(state).unwrap_or_else(|p| p.into_inner());
            continue;
        }

        let Some(&Reverse((target, seq, id))) = state.queue.peek() else {
            state = inner.cond.wait(state).unwrap_or_else(|p| p.into_inner());
            continue;
        };

        let now = Instant::now();
        if target > now {
            state = inner
                .cond
                .wait_timeout(state, target - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
            continue;
        }

        state.queue.pop();
        let Some(entry) = state.entries.get_mut(&id) else {
            continue;
        };
        if entry.queued_seq != seq || entry.running {
            continue;
        }

        entry.running = true;
        let body = entry.body.clone();
        let cancel = entry.cancel.clone();
        let name = entry.name.clone();
        state.in_flight += 1;

        let fire_inner = inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("callback-{name}"))
            .spawn(move || fire(fire_inner, id, body, cancel, target));

        if let Err(e) = spawned {
            error!(callback = %name, "could not spawn callback thread: {e}");
            state.in_flight -= 1;
            let seq = state.enqueue(id, Instant::now() + Duration::from_secs(1));
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.running = false;
                entry.queued_seq = seq;
            }
        }
    }
}

fn fire(
    inner: Arc<Inner>,
    id: CallbackId,
    body: CallbackBody,
    cancel: CancelFlag,
    scheduled_for: Instant,
) {
    if !cancel.is_cancelled() {
        let context = CallbackContext {
            id,
            cancel: &cancel,
            scheduled_for,
        };
        if catch_unwind(AssertUnwindSafe(|| body(&context))).is_err() {
            error!(id = %id, "callback body panicked");
        }
    }

    let finished_wake = {
        let mut state = inner.lock();
        state.in_flight -= 1;

        let reschedule = state.entries.get(&id).and_then(|entry| match entry.repeat {
            Some(interval) if !entry.cancel.is_cancelled() => Some((interval, entry.catch_up)),
            _ => None,
        });

        match reschedule {
            Some((interval, catch_up)) => {
                let next = if catch_up {
                    scheduled_for + interval
                } else {
                    realign(scheduled_for, interval, Instant::now())
                };
                let seq = state.enqueue(id, next);
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.running = false;
                    entry.queued_seq = seq;
                }
                None
            }
            None => state.entries.remove(&id).and_then(|entry| entry.wake),
        }
    };
    inner.cond.notify_all();

    if let Some(wake) = finished_wake {
        inner.backend.cancel_wake(&wake);
    }
}

/// The first point on `previous`'s cadence that lies after `now`.
fn realign(previous: Instant, interval: Duration, now: Instant) -> Instant {
    let next = previous + interval;
    if next > now {
        return next;
    }
    let interval_ns = interval.as_nanos().max(1);
    let steps = now.duration_since(next).as_nanos() / interval_ns + 1;
    steps
        .checked_mul(interval_ns)
        .and_then(|ns| u64::try_from(ns).ok())
        .and_then(|ns| next.checked_add(Duration::from_nanos(ns)))
        .unwrap_or(now + interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> CallbackScheduler {
        CallbackScheduler::new(Arc::new(NoopWakeBackend)).unwrap()
    }

    #[test]
    fn test_one_shot_fires_after_delay() {
        let scheduler = scheduler();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let start = Instant::now();

        scheduler
            .schedule_once("once", Duration::from_millis(50), move |_| {
                let _ = tx.send(Instant::now());
            })
            .unwrap();

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(50));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_cancelled_never_fires() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let handle = scheduler
            .schedule_once("cancel-me", Duration::from_millis(50), move |_| {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert!(scheduler.cancel(&handle));
        assert!(!scheduler.cancel(&handle));

        thread::sleep(Duration::from_millis(150));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_repeating_never_overlaps() {
        let scheduler = scheduler();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, m, r) = (active.clone(), max_active.clone(), runs.clone());
        let handle = scheduler
            .schedule_repeating("slow", Duration::ZERO, Duration::from_millis(5), move |_| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                a.fetch_sub(1, Ordering::SeqCst);
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        scheduler.cancel(&handle);

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_fires_overdue_once() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();

        scheduler
            .schedule_repeating("tick", Duration::from_millis(20), Duration::from_millis(20), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.suspend();
        let before = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), before);

        scheduler.resume();
        thread::sleep(Duration::from_millis(50));
        let after = runs.load(Ordering::SeqCst);
        assert!(after > before);
        assert!(after - before <= 4, "fired {} times after resume", after - before);
    }

    #[test]
    fn test_resume_with_catch_up_fires_missed_intervals() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();

        scheduler.suspend();
        scheduler
            .schedule(
                CallbackOptions::repeating("catch-up", Duration::from_millis(20), Duration::from_millis(20))
                    .with_catch_up(),
                move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        scheduler.resume();
        thread::sleep(Duration::from_millis(150));
        assert!(runs.load(Ordering::SeqCst) >= 10);
    }

    #[test]
    fn test_backend_failure_is_surfaced() {
        struct Failing;
        impl WakeBackend for Failing {
            fn schedule_wake(
                &self,
                _id: CallbackId,
                _at: chrono::DateTime<Utc>,
                _repeat: Option<Duration>,
            ) -> Result<WakeHandle, String> {
                Err("alarm service unavailable".to_string())
            }
            fn cancel_wake(&self, _handle: &WakeHandle) {}
        }

        let scheduler = CallbackScheduler::new(Arc::new(Failing)).unwrap();
        let result = scheduler.schedule_once("x", Duration::ZERO, |_| {});
        assert!(matches!(result, Err(RuntimeError::SchedulerPersistence(_))));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_realign_after_long_suspension_with_tiny_interval() {
        let now = Instant::now();
        let Some(previous) = now.checked_sub(Duration::from_secs(10)) else {
            return;
        };
        let interval = Duration::from_nanos(1);

        // Ten billion missed ticks do not fit in a u32.
        let next = realign(previous, interval, now);
        assert!(next > now);
        assert!(next <= now + interval);

        let interval = Duration::from_millis(300);
        let next = realign(previous, interval, now);
        assert!(next > now);
        assert!(next <= now + interval);
        assert_eq!(next.duration_since(previous).as_nanos() % interval.as_nanos(), 0);
    }

    #[test]
    fn test_realign_keeps_cadence_when_on_time() {
        let now = Instant::now();
        let interval = Duration::from_millis(50);
        assert_eq!(realign(now, interval, now), now + interval);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = scheduler().schedule_repeating("bad", Duration::ZERO, Duration::ZERO, |_| {});
        assert!(matches!(result, Err(RuntimeError::InvalidOperation(_))));
    }

    #[test]
    fn test_panicking_body_does_not_kill_scheduler() {
        let scheduler = scheduler();
        scheduler
            .schedule_once("boom", Duration::ZERO, |_| panic!("boom"))
            .unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        scheduler
            .schedule_once("after", Duration::from_millis(20), move |_| {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
