//! Synchronous bridge onto the UI-affinity thread.
//!
//! [`MainThreadSynchronizer::execute_thread_safe`] sends a unit of work to the
//! thread that owns the [`MainLoop`] and blocks until it has run. Called from
//! that thread it runs the work inline, so it never deadlocks on itself.
//!
//! This is a blocking bridge for the few places that need UI-thread work from
//! a background context. It is not a general-purpose executor.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("work panicked on the main thread")]
    Panicked,
    #[error("main thread did not run the work within {0:?}")]
    TimedOut(Duration),
    #[error("main loop is no longer running")]
    Closed,
}

/// Handle for marshaling work onto the main thread. Cheap to clone.
#[derive(Clone)]
pub struct MainThreadSynchronizer {
    jobs: Sender<Job>,
    main_thread: ThreadId,
    wait_limit: Option<Duration>,
}

/// The receiving end, pumped by the main thread.
pub struct MainLoop {
    jobs: Receiver<Job>,
}

impl MainThreadSynchronizer {
    /// Treat the calling thread as the main thread. It must pump the returned loop.
    pub fn for_current_thread() -> (Self, MainLoop) {
        let (jobs, receiver) = unbounded();
        let sync = Self {
            jobs,
            main_thread: thread::current().id(),
            wait_limit: None,
        };
        (sync, MainLoop { jobs: receiver })
    }

    /// Run a dedicated thread as the main thread, for hosts without a UI loop.
    /// The thread exits once every synchronizer clone is dropped.
    pub fn spawn_dedicated(name: &str) -> std::io::Result<Self> {
        let (jobs, receiver) = unbounded::<Job>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in receiver {
                job();
            }
        })?;

        Ok(Self {
            jobs,
            main_thread: handle.thread().id(),
            wait_limit: None,
        })
    }

    /// Give up waiting after `limit` instead of blocking indefinitely.
    pub fn with_wait_limit(mut self, limit: Duration) -> Self {
        self.wait_limit = Some(limit);
        self
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Run `work` on the main thread and wait for its result.
    pub fn execute_thread_safe<T, F>(&self, work: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_main_thread() {
            return catch_unwind(AssertUnwindSafe(work)).map_err(|_| SyncError::Panicked);
        }

        let (done, outcome) = bounded(1);
        self.jobs
            .send(Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(work));
                let _ = done.send(result);
            }))
            .map_err(|_| SyncError::Closed)?;

        let result = match self.wait_limit {
            Some(limit) => outcome.recv_timeout(limit).map_err(|e| match e {
                RecvTimeoutError::Timeout => SyncError::TimedOut(limit),
                RecvTimeoutError::Disconnected => SyncError::Closed,
            })?,
            None => outcome.recv().map_err(|_| SyncError::Closed)?,
        };
        result.map_err(|_| SyncError::Panicked)
    }

    /// Queue `work` on the main thread without waiting.
    pub fn execute_async<F>(&self, work: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs
            .send(Box::new(move || {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    tracing::error!("queued main-thread work panicked");
                }
            }))
            .map_err(|_| SyncError::Closed)
    }
}

impl MainLoop {
    /// Run everything queued right now. Returns how many jobs ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.jobs.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for work, then run everything queued.
    pub fn pump(&self, timeout: Duration) -> usize {
        match self.jobs.recv_timeout(timeout) {
            Ok(job) => {
                job();
                1 + self.run_pending()
            }
            Err(_) => 0,
        }
    }

    /// Pump until `running` is cleared.
    pub fn run_while(&self, running: &AtomicBool, tick: Duration) {
        while running.load(Ordering::SeqCst) {
            self.pump(tick);
        }
    }
}
