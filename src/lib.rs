//! Sensing Runtime - on-device continuous data collection for sensing studies.
//!
//! Independently lifecycled probes produce time-stamped datums. A per-protocol
//! data store buffers them, applies field anonymization, encrypts each batch and
//! hands it to a commit sink on a schedule.
//!
//! # Guarantees
//!
//! - **No silent loss**: a batch the sink rejects is requeued, and anything dropped
//!   (rate limit, buffer cap) is counted in the transparency log
//! - **Nothing after stop**: once `Probe::stop` returns, that probe adds no datum
//! - **Background only**: capture and commit work never runs on the UI thread
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       ProtocolController                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐                                                 │
//! │  │   Probe     │──┐                                              │
//! │  │  (polling)  │  │    ┌─────────────┐     ┌─────────────┐       │
//! │  └─────────────┘  ├──▶│  DataStore  │───▶│ CommitSink  │       │
//! │  ┌─────────────┐  │    │ (anonymize, │     │ (file/HTTP) │       │
//! │  │   Probe     │──┘    │  encrypt)   │     └─────────────┘       │
//! │  │ (listening) │       └─────────────┘                           │
//! │  └─────────────┘              │                                  │
//! │         ▲                     ▼                                  │
//! │  ┌─────────────┐       ┌─────────────┐     ┌─────────────┐       │
//! │  │  Callback   │       │Transparency │     │ScriptRunner │       │
//! │  │  Scheduler  │──────────────────────────▶│  (prompts)  │       │
//! │  └─────────────┘       │    Log      │     └─────────────┘       │
//! │                        └─────────────┘                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sensing_runtime::{
//!     FileSink, Protocol, ProtocolConfig, ProtocolController, ProbeRegistry, RuntimeContext,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), sensing_runtime::RuntimeError> {
//! let context = RuntimeContext::ephemeral("demo-device")?;
//! let protocol = Protocol::build(
//!     ProtocolConfig::sample(),
//!     &ProbeRegistry::builtin(),
//!     &context,
//!     Arc::new(FileSink::new("batches")),
//! )?;
//!
//! let controller = ProtocolController::new(protocol, context);
//! controller.execute_protocol()?;
//! // ... collect ...
//! controller.halt_protocol()?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod context;
pub mod datum;
pub mod encryption;
pub mod error;
pub mod gateway;
pub mod health;
pub mod probe;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use agent::{
    AgentSpec, PromptEvent, ScriptRunner, ScriptRunnerAgent, SensingAgent, SensingAgentSpec,
    SensingRunner,
};
pub use config::RuntimeConfig;
pub use context::RuntimeContext;
pub use datum::{Anonymizer, Datum};
pub use encryption::SymmetricEncryption;
pub use error::RuntimeError;
pub use health::HealthReport;
pub use probe::{Probe, ProbeHandle, ProbeKind, ProbeSetting, ProbeSettings, ProbeState, SettingChange};
pub use protocol::{ProbeRegistry, Protocol, ProtocolConfig, ProtocolController};
pub use scheduler::{CallbackHandle, CallbackOptions, CallbackScheduler};
pub use store::{CommitSink, DataStore, DatumObserver, EncryptedBatch, FileSink, SinkError};
pub use sync::MainThreadSynchronizer;
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

#[cfg(feature = "gateway")]
pub use gateway::{GatewayConfig, GatewaySink};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
