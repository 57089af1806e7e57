//! Wire messages exchanged between a manager and its worker.
//!
//! Every frame body is one JSON-encoded [`Message`]. Unknown top-level fields
//! are ignored on decode; payload keys keep their insertion order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CorrelationId, Error, Result};

/// Ordered string → value mapping carried by every message.
pub type Payload = serde_json::Map<String, Value>;

/// Reserved probe handler. Must answer `{"status": "pong"}`.
pub const PING_HANDLER: &str = "ping";

/// Reserved teardown handler.
pub const SHUTDOWN_HANDLER: &str = "shutdown";

/// Handler names that model code may not define.
pub const RESERVED_HANDLERS: &[&str] = &[PING_HANDLER, SHUTDOWN_HANDLER];

pub fn is_reserved_handler(name: &str) -> bool {
    RESERVED_HANDLERS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    /// Peer could not make sense of a message. Not a handler failure.
    Error,
    /// Worker readiness handshake, sent once after setup.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    HandlerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub correlation_id: CorrelationId,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
}

impl Message {
    pub fn request(id: CorrelationId, handler: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: id,
            kind: MessageKind::Request,
            handler: Some(handler.into()),
            payload,
            status: None,
        }
    }

    pub fn response(id: CorrelationId, payload: Payload) -> Self {
        Self {
            correlation_id: id,
            kind: MessageKind::Response,
            handler: None,
            payload,
            status: Some(ResponseStatus::Ok),
        }
    }

    /// Handler failure response. `payload["error"]` holds the message.
    pub fn handler_error(id: CorrelationId, message: impl Into<String>, mut extra: Payload) -> Self {
        extra.insert("error".to_string(), Value::String(message.into()));
        Self {
            correlation_id: id,
            kind: MessageKind::Response,
            handler: None,
            payload: extra,
            status: Some(ResponseStatus::HandlerError),
        }
    }

    /// Protocol-level error, tagged with one of [`Error::code`]'s values.
    pub fn error(id: CorrelationId, code: &str, message: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert("code".to_string(), Value::String(code.to_string()));
        payload.insert("message".to_string(), Value::String(message.into()));
        Self {
            correlation_id: id,
            kind: MessageKind::Error,
            handler: None,
            payload,
            status: None,
        }
    }

    pub fn ready(handlers: &[String], pid: u32) -> Self {
        let mut payload = Payload::new();
        payload.insert(
            "handlers".to_string(),
            Value::Array(handlers.iter().cloned().map(Value::String).collect()),
        );
        payload.insert("pid".to_string(), Value::from(pid));
        Self {
            correlation_id: CorrelationId::UNSOLICITED,
            kind: MessageKind::Ready,
            handler: None,
            payload,
            status: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::ChannelFraming(format!("undecodable message body: {}", e)))
    }

    /// Human-readable description carried by an Error or HandlerError message.
    pub fn error_text(&self) -> String {
        ["error", "message"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| "no error message".to_string())
    }

    /// Handler names announced in a Ready or pong payload.
    pub fn handler_names(&self) -> Vec<String> {
        payload_handlers(&self.payload)
    }
}

pub(crate) fn payload_handlers(payload: &Payload) -> Vec<String> {
    payload
        .get("handlers")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
