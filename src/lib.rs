//! # modelserve
//!
//! Runs model-serving code in supervised worker processes and exposes a
//! request/response API over framed named-pipe IPC:
//! - Process supervision with a readiness handshake, crash detection and
//!   collapsed concurrent restarts
//! - Length-prefixed JSON framing over a FIFO pair per worker
//! - Correlated, concurrent requests with per-call timeouts
//! - Periodic health probes with restart policy and backoff
//!
//! ## Architecture
//!
//! ```text
//!   caller ─→ ModelRegistry ─→ ModelManager ─→ RequestDispatcher ─→ Channel ══╗
//!                                  │                  ↑                      ║ pipe_in
//!                                  │            receive loop ←── Channel ←═══╣ pipe_out
//!                                  ↓                                         ║
//!                           ProcessSupervisor ─── spawn / signal ──→ worker ═╝
//!                                  ↑
//!                           HealthChecker (one task per model)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod health;
pub mod ipc;
pub mod manager;
pub mod process;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;

pub use health::{CheckOutcome, HealthChecker, HealthRecord, HealthState};
pub use ipc::Payload;
pub use manager::{
    with_started, DirectProvisioner, EnvironmentProvisioner, ModelManager, ModelRegistry,
    ModelStatus, PingReport,
};
pub use process::{ProcessHandle, ProcessState};
pub use types::{Error, ModelConfig, Result, RuntimeConfig};
