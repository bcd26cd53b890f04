//! Transparency module for the sensing runtime.
//!
//! Tracks what the runtime collected, dropped and committed so the
//! participant (and the study team) can audit collection at any time.

pub mod log;

pub use log::{
    create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
