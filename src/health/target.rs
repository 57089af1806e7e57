//! What the health checker probes and who hears about it.

use async_trait::async_trait;
use std::time::Duration;

use super::record::{HealthRecord, SharedHealth};
use crate::process::ProcessState;
use crate::types::{HealthPolicy, Result};

/// A probeable, restartable model. Implemented by `ModelManager`.
#[async_trait]
pub trait HealthTarget: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> HealthPolicy;

    fn process_state(&self) -> ProcessState;

    /// Cheap first-order check before a protocol probe.
    fn is_alive(&self) -> bool;

    /// Protocol-level probe. Returns the round-trip latency.
    async fn probe(&self, timeout: Duration) -> Result<Duration>;

    async fn restart(&self) -> Result<()>;

    fn health(&self) -> SharedHealth;
}

/// Callbacks fired by the health checker. Both default to no-ops.
#[cfg_attr(test, mockall::automock)]
pub trait HealthObserver: Send + Sync {
    fn on_failure(&self, _name: &str, _record: &HealthRecord) {}

    fn on_restart(&self, _name: &str) {}
}

/// Observer that logs at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl HealthObserver for LoggingObserver {
    fn on_failure(&self, name: &str, record: &HealthRecord) {
        tracing::warn!(
            model = %name,
            consecutive_failures = record.consecutive_failures,
            error = ?record.last_error,
            "health probe failed"
        );
    }

    fn on_restart(&self, name: &str) {
        tracing::warn!(model = %name, "model restarted by health checker");
    }
}
