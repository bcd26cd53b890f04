//! Protocols: persisted configuration, probe registry and orchestration.

pub mod config;
pub mod controller;
pub mod registry;
pub mod schema;

pub use config::{
    AnonymizationRule, ProbeConfig, PromptConfig, ProtocolConfig, SensingConfig, TransformSpec,
};
pub use controller::{Protocol, ProtocolController, ProtocolHealth, ProtocolStatus};
pub use registry::ProbeRegistry;
pub use schema::{probe_schema, store_schema, Constraints, ParameterSchema, ParameterSpec, ParameterType};
