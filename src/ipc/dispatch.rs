//! Correlated request/response multiplexing over one channel.
//!
//! Callers register a pending call under a fresh correlation id and suspend
//! on a oneshot slot. A single receive loop owns the read half and resolves
//! slots as responses arrive, in whatever order the worker produces them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::channel::{Channel, ChannelReader, ChannelWriter};
use super::protocol::{Message, MessageKind, Payload, ResponseStatus};
use crate::types::{CorrelationId, Error, Result};

/// Why outstanding calls were failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    Stopped,
    Restarting,
    WorkerCrashed(String),
    Protocol(String),
}

impl CancelReason {
    pub fn to_error(&self) -> Error {
        match self {
            CancelReason::Stopped => Error::cancelled("model stopped"),
            CancelReason::Restarting => Error::cancelled("model restarting"),
            CancelReason::WorkerCrashed(msg) => Error::worker_crashed(msg.clone()),
            CancelReason::Protocol(msg) => Error::protocol(msg.clone()),
        }
    }
}

struct PendingCall {
    handler: String,
    submitted_at: Instant,
    slot: oneshot::Sender<Result<Payload>>,
}

#[derive(Default)]
struct DispatchState {
    pending: HashMap<CorrelationId, PendingCall>,
    closed: Option<CancelReason>,
}

struct Shared {
    state: Mutex<DispatchState>,
    terminated: CancellationToken,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        // Never held across an await; a poisoned table is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: CorrelationId) -> Option<PendingCall> {
        self.lock().pending.remove(&id)
    }

    /// Fail every pending call and refuse new ones. First reason wins.
    fn close(&self, reason: CancelReason) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(Err(reason.to_error()));
        }
        self.terminated.cancel();
        count
    }

    fn dispatch(&self, message: Message) {
        let id = message.correlation_id;
        match message.kind {
            MessageKind::Response => {
                let Some(call) = self.remove(id) else {
                    tracing::debug!(correlation_id = %id, "discarding response for unknown correlation id");
                    return;
                };
                let result = match message.status {
                    Some(ResponseStatus::HandlerError) => Err(Error::Handler {
                        message: message.error_text(),
                        handler: call.handler.clone(),
                        payload: message.payload,
                    }),
                    Some(ResponseStatus::Ok) | None => Ok(message.payload),
                };
                tracing::trace!(
                    correlation_id = %id,
                    handler = %call.handler,
                    latency_ms = call.submitted_at.elapsed().as_millis() as u64,
                    "call resolved"
                );
                let _ = call.slot.send(result);
            }
            MessageKind::Error => {
                let text = message.error_text();
                match self.remove(id) {
                    Some(call) => {
                        let _ = call.slot.send(Err(Error::protocol(format!(
                            "worker rejected request: {}",
                            text
                        ))));
                    }
                    None => {
                        tracing::warn!(correlation_id = %id, error = %text, "worker reported an unsolicited error");
                    }
                }
            }
            MessageKind::Ready => {
                tracing::warn!("ignoring repeated readiness message");
            }
            MessageKind::Request => {
                tracing::warn!(correlation_id = %id, "ignoring request sent by worker");
            }
        }
    }
}

/// Removes its pending call when the awaiting future completes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove(self.id);
    }
}

/// Turns one ordered channel into a concurrent call facility.
pub struct RequestDispatcher {
    shared: Arc<Shared>,
    writer: ChannelWriter,
    next_id: AtomicU64,
    cancel: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestDispatcher {
    /// Take ownership of the channel and spawn the receive loop.
    pub fn start(channel: Channel) -> Arc<Self> {
        let (reader, writer) = channel.split();
        let shared = Arc::new(Shared {
            state: Mutex::new(DispatchState::default()),
            terminated: CancellationToken::new(),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(reader, shared.clone(), cancel.clone()));
        Arc::new(Self {
            shared,
            writer,
            next_id: AtomicU64::new(1),
            cancel,
            receive_task: Mutex::new(Some(task)),
        })
    }

    fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send one request and wait for its response, bounded by `timeout`.
    pub async fn call(&self, handler: &str, payload: Payload, timeout: Duration) -> Result<Payload> {
        let id = self.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if let Some(reason) = &state.closed {
                return Err(reason.to_error());
            }
            state.pending.insert(
                id,
                PendingCall {
                    handler: handler.to_string(),
                    submitted_at: Instant::now(),
                    slot: tx,
                },
            );
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let exchange = async {
            tracing::trace!(correlation_id = %id, handler = %handler, "sending request");
            if let Err(e) = self.writer.send(&Message::request(id, handler, payload)).await {
                if let Some(reason) = self.closed_reason() {
                    return Err(reason.to_error());
                }
                return Err(match e {
                    Error::ChannelWrite(msg) => {
                        Error::worker_crashed(format!("request write failed: {}", msg))
                    }
                    other => other,
                });
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(self.terminal_error()),
            }
        };

        // The deadline covers the write as well as the wait for the answer.
        let outcome = tokio::select! {
            biased;
            outcome = tokio::time::timeout(timeout, exchange) => outcome,
            _ = self.shared.terminated.cancelled() => Ok(Err(self.terminal_error())),
        };
        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(correlation_id = %id, handler = %handler, ?timeout, "request timed out");
                Err(Error::RequestTimeout {
                    handler: handler.to_string(),
                    timeout,
                })
            }
        }
    }

    fn terminal_error(&self) -> Error {
        self.closed_reason()
            .map(|reason| reason.to_error())
            .unwrap_or_else(|| Error::worker_crashed("dispatcher dropped the call"))
    }

    /// Fire-and-forget request.
    pub async fn notify(&self, handler: &str, payload: Payload) -> Result<()> {
        let id = self.next_correlation_id();
        self.writer
            .send(&Message::request(id, handler, payload))
            .await
    }

    /// Fail every pending call with `reason`; later calls fail at once.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let count = self.shared.close(reason.clone());
        if count > 0 {
            tracing::debug!(count, ?reason, "cancelled outstanding calls");
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn closed_reason(&self) -> Option<CancelReason> {
        self.shared.lock().closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_reason().is_some()
    }

    /// Resolves once the dispatcher stopped accepting calls (cancelled, EOF or
    /// framing failure).
    pub async fn closed(&self) {
        self.shared.terminated.cancelled().await
    }

    /// Cancel pending calls, stop the receive loop and release the write end.
    pub async fn shutdown(&self, reason: CancelReason) {
        self.cancel_all(reason);
        self.cancel.cancel();
        self.writer.close().await;
        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("outstanding", &self.outstanding())
            .field("closed", &self.closed_reason())
            .finish()
    }
}

async fn receive_loop(mut reader: ChannelReader, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = reader.receive() => received,
        };
        match received {
            Ok(message) => shared.dispatch(message),
            Err(Error::ChannelFraming(msg)) => {
                tracing::warn!(error = %msg, "malformed frame from worker");
                shared.close(CancelReason::Protocol(msg));
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "worker channel closed");
                shared.close(CancelReason::WorkerCrashed(format!(
                    "worker channel closed: {}",
                    e
                )));
                break;
            }
        }
    }
}
