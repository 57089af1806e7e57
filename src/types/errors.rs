//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Transport
//! errors (`Channel*`) are converted into `WorkerCrashed` / `Protocol` by the
//! dispatcher before they reach callers of `request()`.

use std::time::Duration;
use thiserror::Error;

use crate::ipc::protocol::Payload;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for modelserve.
#[derive(Error, Debug)]
pub enum Error {
    /// Provisioning, launch or handshake failure. Never retried by the core.
    #[error("startup error: {0}")]
    Startup(String),

    /// Pipe ends could not be connected before the connect timeout.
    #[error("channel open error: {0}")]
    ChannelOpen(String),

    /// Frame could not be written (broken pipe, closed channel, write timeout).
    #[error("channel write error: {0}")]
    ChannelWrite(String),

    /// The peer closed its end of the channel.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Malformed frame (length mismatch, truncated payload, undecodable body).
    #[error("channel framing error: {0}")]
    ChannelFraming(String),

    /// Per-call timeout. Says nothing about worker health.
    #[error("request timeout: handler '{handler}' did not answer within {timeout:?}")]
    RequestTimeout { handler: String, timeout: Duration },

    /// Worker-reported application failure, returned as data.
    #[error("handler error in '{handler}': {message}")]
    Handler {
        handler: String,
        message: String,
        payload: Payload,
    },

    /// The worker process died or its channel broke.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// The worker violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Outstanding call failed by stop() or restart().
    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("duplicate model: {0}")]
    DuplicateModel(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("manager not running: {0}")]
    ManagerNotRunning(String),

    /// Restart policy exhausted; only an explicit restart revives the model.
    #[error("model '{0}' is dead; an explicit restart is required")]
    ModelDead(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// Recovered panic or broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code, used in worker-sent error messages and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Startup(_) => "STARTUP_ERROR",
            Error::ChannelOpen(_) => "CHANNEL_OPEN",
            Error::ChannelWrite(_) => "CHANNEL_WRITE",
            Error::ChannelClosed(_) => "CHANNEL_CLOSED",
            Error::ChannelFraming(_) => "CHANNEL_FRAMING",
            Error::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Error::Handler { .. } => "HANDLER_ERROR",
            Error::WorkerCrashed(_) => "WORKER_CRASHED",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Cancelled(_) => "CANCELLED",
            Error::DuplicateModel(_) => "DUPLICATE_MODEL",
            Error::UnknownModel(_) => "UNKNOWN_MODEL",
            Error::ManagerNotRunning(_) => "MANAGER_NOT_RUNNING",
            Error::ModelDead(_) => "MODEL_DEAD",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// True for failures that mean the worker process is gone or unusable.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Error::WorkerCrashed(_)
                | Error::ChannelClosed(_)
                | Error::ChannelWrite(_)
                | Error::Protocol(_)
                | Error::ChannelFraming(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        Self::WorkerCrashed(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn not_running(msg: impl Into<String>) -> Self {
        Self::ManagerNotRunning(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::startup("x").code(), "STARTUP_ERROR");
        assert_eq!(
            Error::RequestTimeout {
                handler: "echo".into(),
                timeout: Duration::from_millis(5)
            }
            .code(),
            "REQUEST_TIMEOUT"
        );
        assert_eq!(Error::validation("bad").code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_handler_error_is_not_a_worker_failure() {
        let err = Error::Handler {
            handler: "classify".into(),
            message: "bad input".into(),
            payload: Payload::new(),
        };
        assert!(!err.is_worker_failure());
        assert!(Error::worker_crashed("eof").is_worker_failure());
        assert!(err.to_string().contains("classify"));
    }
}
