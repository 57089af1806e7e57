//! Core types for modelserve.
//!
//! - **IDs**: Strongly-typed identifiers (InstanceId, CorrelationId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Runtime-wide configuration (IPC, observability)
//! - **Model**: Per-model configuration record (launch, health, resources)

mod config;
mod errors;
mod ids;
mod model;

pub use config::{IpcConfig, ObservabilityConfig, RuntimeConfig};
pub use errors::{Error, Result};
pub use ids::{CorrelationId, InstanceId};
pub use model::{
    HealthPolicy, LaunchCommand, ModelConfig, ModelTimeouts, ResourceLimits,
    RestartBackoffPolicy, GPU_VISIBILITY_ENV, RESOURCE_ENV_PREFIX,
};
