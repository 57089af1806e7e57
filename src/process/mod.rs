//! Worker process supervision.
//!
//! - [`ProcessSupervisor`]: spawn, handshake, crash detection, stop, restart
//! - [`LaunchSpec`]: resolved command/environment for one launch
//! - [`OutputTail`]: recent worker output for diagnostics

mod launch;
mod output;
mod supervisor;
mod types;

pub use launch::LaunchSpec;
pub use output::{OutputTail, TAIL_LINES};
pub use supervisor::{ProcessSupervisor, KILL_WAIT, TERMINATE_GRACE};
pub use types::{ExitInfo, ProcessHandle, ProcessState, TerminationReason};
