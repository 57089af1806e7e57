//! Worker process types: ProcessState, ProcessHandle, exit information.

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::types::InstanceId;

/// Worker lifecycle state.
///
/// State transitions:
/// ```text
/// STOPPED → STARTING → RUNNING → STOPPING → STOPPED
///              ↑          ↓          ↑
///              └──── CRASHED ────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        match (self, to) {
            // STOPPED
            (ProcessState::Stopped, ProcessState::Starting) => true,
            // STARTING
            (ProcessState::Starting, ProcessState::Running) => true,
            (ProcessState::Starting, ProcessState::Stopped) => true, // Startup failed
            // RUNNING
            (ProcessState::Running, ProcessState::Stopping) => true,
            (ProcessState::Running, ProcessState::Crashed) => true,
            // STOPPING
            (ProcessState::Stopping, ProcessState::Stopped) => true,
            // CRASHED
            (ProcessState::Crashed, ProcessState::Starting) => true,
            (ProcessState::Crashed, ProcessState::Stopping) => true,
            _ => false,
        }
    }

    /// Deliberately not running: never started, stopped, or on the way there.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Stopping | ProcessState::Starting
        )
    }
}

/// Why a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Exited { code: i32 },
    Signaled { signal: String },
    Unknown,
}

impl TerminationReason {
    pub fn from_status(status: &ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        match status.signal() {
            Some(raw) => Self::Signaled {
                signal: Signal::try_from(raw)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| format!("signal {}", raw)),
            },
            None => Self::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {}", code),
            Self::Signaled { signal } => write!(f, "killed by {}", signal),
            Self::Unknown => write!(f, "unknown termination"),
        }
    }
}

/// Last observed exit of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub reason: TerminationReason,
    pub exited_at: DateTime<Utc>,
}

impl ExitInfo {
    pub fn from_status(status: &ExitStatus) -> Self {
        Self {
            reason: TerminationReason::from_status(status),
            exited_at: Utc::now(),
        }
    }
}

/// Snapshot of one worker instance, published by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub instance_id: InstanceId,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub state: ProcessState,
    pub exit: Option<ExitInfo>,
}

impl ProcessHandle {
    /// Handle of a supervisor that has never launched anything.
    pub fn idle() -> Self {
        Self {
            instance_id: InstanceId::new(),
            pid: None,
            started_at: None,
            state: ProcessState::Stopped,
            exit: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }
}
