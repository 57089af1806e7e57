//! Static handler table for the worker side.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::ipc::protocol::is_reserved_handler;
use crate::ipc::{Message, Payload};
use crate::manager::extract_panic_message;
use crate::types::{CorrelationId, Error, Result};

type HandlerFn = Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

/// Name → async function map, fixed once built.
///
/// A handler returning [`Error::Handler`] has its payload forwarded to the
/// caller; any other error is reported with its `code`.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, HandlerFn>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// Handler names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `handler` and build the response message for `id`.
    pub async fn dispatch(&self, id: CorrelationId, handler: &str, payload: Payload) -> Message {
        let Some(f) = self.handlers.get(handler) else {
            let mut extra = Payload::new();
            extra.insert(
                "available_handlers".to_string(),
                Value::Array(self.names().into_iter().map(Value::String).collect()),
            );
            return Message::handler_error(id, format!("unknown handler '{}'", handler), extra);
        };

        match AssertUnwindSafe(f(payload)).catch_unwind().await {
            Ok(Ok(result)) => Message::response(id, result),
            Ok(Err(Error::Handler {
                message, payload, ..
            })) => Message::handler_error(id, message, payload),
            Ok(Err(e)) => {
                let mut extra = Payload::new();
                extra.insert("code".to_string(), Value::String(e.code().to_string()));
                Message::handler_error(id, e.to_string(), extra)
            }
            Err(panic) => {
                let msg = extract_panic_message(&panic);
                tracing::error!(handler = %handler, panic = %msg, "handler panicked");
                Message::handler_error(id, format!("handler panicked: {}", msg), Payload::new())
            }
        }
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Collects handlers; the first invalid registration fails [`build`](Self::build).
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: BTreeMap<String, HandlerFn>,
    error: Option<Error>,
}

impl HandlerTableBuilder {
    pub fn handler<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        let name = name.into();
        if name.is_empty() {
            self.error = Some(Error::validation("handler name must not be empty"));
        } else if is_reserved_handler(&name) {
            self.error = Some(Error::validation(format!(
                "handler name '{}' is reserved",
                name
            )));
        } else if self.handlers.contains_key(&name) {
            self.error = Some(Error::validation(format!(
                "handler '{}' registered twice",
                name
            )));
        } else {
            self.handlers.insert(name, Arc::new(move |p| f(p).boxed()));
        }
        self
    }

    pub fn build(self) -> Result<HandlerTable> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(HandlerTable {
                handlers: self.handlers,
            }),
        }
    }
}

impl fmt::Debug for HandlerTableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTableBuilder")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ResponseStatus;
    use serde_json::json;

    fn table() -> HandlerTable {
        HandlerTable::builder()
            .handler("echo", |p| async move { Ok(p) })
            .handler("reject", |_| async {
                let mut payload = Payload::new();
                payload.insert("field".into(), json!("text"));
                Err::<Payload, _>(Error::Handler {
                    handler: "reject".into(),
                    message: "text is required".into(),
                    payload,
                })
            })
            .handler("broken", |_| async {
                Err::<Payload, _>(Error::internal("gpu fell off"))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_known_handler() {
        let mut payload = Payload::new();
        payload.insert("text".into(), json!("hi"));
        let reply = table()
            .dispatch(CorrelationId::new(4), "echo", payload.clone())
            .await;
        assert_eq!(reply.correlation_id, CorrelationId::new(4));
        assert_eq!(reply.status, Some(ResponseStatus::Ok));
        assert_eq!(reply.payload, payload);
    }

    #[tokio::test]
    async fn test_unknown_handler_lists_available() {
        let reply = table()
            .dispatch(CorrelationId::new(1), "predict", Payload::new())
            .await;
        assert_eq!(reply.status, Some(ResponseStatus::HandlerError));
        assert_eq!(
            reply.payload["available_handlers"],
            json!(["broken", "echo", "reject"])
        );
        assert!(reply.error_text().contains("predict"));
    }

    #[tokio::test]
    async fn test_handler_errors_become_error_responses() {
        let reply = table()
            .dispatch(CorrelationId::new(2), "reject", Payload::new())
            .await;
        assert_eq!(reply.status, Some(ResponseStatus::HandlerError));
        assert_eq!(reply.error_text(), "text is required");
        assert_eq!(reply.payload["field"], json!("text"));

        let reply = table()
            .dispatch(CorrelationId::new(3), "broken", Payload::new())
            .await;
        assert_eq!(reply.payload["code"], json!("INTERNAL"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let table = HandlerTable::builder()
            .handler("boom", |p: Payload| async move {
                if p.is_empty() {
                    panic!("tensor shape mismatch");
                }
                Ok(p)
            })
            .build()
            .unwrap();
        let reply = table
            .dispatch(CorrelationId::new(9), "boom", Payload::new())
            .await;
        assert_eq!(reply.status, Some(ResponseStatus::HandlerError));
        assert!(reply.error_text().contains("tensor shape mismatch"));
    }

    #[test]
    fn test_reserved_and_duplicate_names_rejected() {
        let err = HandlerTable::builder()
            .handler("ping", |p| async move { Ok(p) })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("reserved")));

        let err = HandlerTable::builder()
            .handler("echo", |p| async move { Ok(p) })
            .handler("echo", |p| async move { Ok(p) })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("twice")));
    }
}
