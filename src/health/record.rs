//! Per-model health record and its shared, observable slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// State
// =============================================================================

/// Health classification of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    /// At least one recent probe failed.
    Degraded,
    Restarting,
    /// Restart policy exhausted or disabled. Only an explicit restart clears it.
    Dead,
}

// =============================================================================
// Record
// =============================================================================

/// Probe history of one model. Survives worker restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthRecord {
    pub consecutive_failures: u32,
    pub state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    /// Restarts performed, health-driven or explicit.
    pub restarts: u64,
}

impl HealthRecord {
    pub fn is_dead(&self) -> bool {
        self.state == HealthState::Dead
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_failures = 0;
        self.state = HealthState::Healthy;
        self.last_checked_at = Some(Utc::now());
        self.last_error = None;
        self.last_latency_ms = Some(latency.as_millis() as u64);
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state != HealthState::Dead {
            self.state = HealthState::Degraded;
        }
        self.last_checked_at = Some(Utc::now());
        self.last_error = Some(error.into());
        self.last_latency_ms = None;
    }

    pub fn mark_restarting(&mut self) {
        self.state = HealthState::Restarting;
    }

    /// Fresh worker is up: forget past failures.
    pub fn mark_restarted(&mut self) {
        self.consecutive_failures = 0;
        self.state = HealthState::Healthy;
        self.last_error = None;
    }

    pub fn count_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn mark_dead(&mut self, error: impl Into<String>) {
        self.consecutive_failures = 0;
        self.state = HealthState::Dead;
        self.last_error = Some(error.into());
    }

    /// Back to Healthy without counting a restart (fresh start after stop).
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.state = HealthState::Healthy;
        self.last_error = None;
    }
}

// =============================================================================
// Shared slot
// =============================================================================

/// Cloneable handle to one model's record. Writers are the manager and the
/// health checker; readers may subscribe to changes.
#[derive(Debug, Clone)]
pub struct SharedHealth {
    tx: Arc<watch::Sender<HealthRecord>>,
}

impl Default for SharedHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedHealth {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HealthRecord::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> HealthRecord {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> HealthState {
        self.tx.borrow().state
    }

    /// Apply `f` and return the updated record.
    pub fn update(&self, f: impl FnOnce(&mut HealthRecord)) -> HealthRecord {
        self.tx.send_modify(f);
        self.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthRecord> {
        self.tx.subscribe()
    }
}
