//! Worker-side serve loop.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;

use super::HandlerTable;
use crate::ipc::{
    Channel, ChannelWriter, Message, MessageKind, Payload, PipePaths, PING_HANDLER,
    SHUTDOWN_HANDLER,
};
use crate::types::{Error, IpcConfig, Result};

/// Connects to the manager, announces readiness and serves requests.
#[derive(Debug)]
pub struct WorkerRuntime {
    table: Arc<HandlerTable>,
    paths: PipePaths,
    ipc: IpcConfig,
}

impl WorkerRuntime {
    pub fn new(table: HandlerTable, paths: PipePaths, ipc: IpcConfig) -> Self {
        Self {
            table: Arc::new(table),
            paths,
            ipc,
        }
    }

    /// Pipe locations from the launch environment.
    pub fn from_env(table: HandlerTable) -> Result<Self> {
        Ok(Self::new(table, PipePaths::from_env()?, IpcConfig::default()))
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.table
    }

    /// Connect, run `setup` once, then serve until `shutdown` or EOF.
    ///
    /// A failing `setup` returns before Ready is sent; the manager sees the
    /// exit as a startup failure.
    pub async fn run<F, Fut>(self, setup: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let channel = Channel::connect_worker(&self.paths, &self.ipc).await?;
        tracing::debug!(request = %self.paths.request.display(), "connected to manager");
        self.serve(channel, setup).await
    }

    /// Serve over an already connected channel.
    pub async fn serve<F, Fut>(self, channel: Channel, setup: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Err(e) = setup().await {
            tracing::error!(error = %e, "worker setup failed");
            channel.close().await;
            return Err(Error::startup(format!("setup failed: {}", e)));
        }

        let (mut reader, writer) = channel.split();
        let handlers = self.table.names();
        writer
            .send(&Message::ready(&handlers, std::process::id()))
            .await?;
        tracing::info!(?handlers, "worker ready");

        let mut in_flight = JoinSet::new();
        let outcome = loop {
            while in_flight.try_join_next().is_some() {}

            let message = match reader.receive().await {
                Ok(message) => message,
                Err(Error::ChannelClosed(_)) => {
                    tracing::info!("manager closed the channel");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "unreadable frame from manager");
                    break Err(e);
                }
            };

            let id = message.correlation_id;
            if message.kind != MessageKind::Request {
                let reply = Message::error(
                    id,
                    "PROTOCOL_ERROR",
                    format!("worker only accepts requests, got {:?}", message.kind),
                );
                send_reply(&writer, &reply).await;
                continue;
            }
            let Some(handler) = message.handler else {
                let reply = Message::error(id, "PROTOCOL_ERROR", "request without handler");
                send_reply(&writer, &reply).await;
                continue;
            };

            match handler.as_str() {
                PING_HANDLER => {
                    let reply = Message::response(id, pong(&handlers));
                    send_reply(&writer, &reply).await;
                }
                SHUTDOWN_HANDLER => {
                    tracing::info!("shutdown requested");
                    let reply = Message::response(id, status_payload("shutting_down"));
                    send_reply(&writer, &reply).await;
                    break Ok(());
                }
                _ => {
                    let table = self.table.clone();
                    let writer = writer.clone();
                    in_flight.spawn(async move {
                        let reply = table.dispatch(id, &handler, message.payload).await;
                        send_reply(&writer, &reply).await;
                    });
                }
            }
        };

        in_flight.shutdown().await;
        writer.close().await;
        outcome
    }
}

async fn send_reply(writer: &ChannelWriter, reply: &Message) {
    if let Err(e) = writer.send(reply).await {
        tracing::warn!(correlation_id = %reply.correlation_id, error = %e, "failed to send reply");
    }
}

fn status_payload(status: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("status".to_string(), Value::String(status.to_string()));
    payload
}

fn pong(handlers: &[String]) -> Payload {
    let mut payload = status_payload("pong");
    payload.insert("handlers".to_string(), json!(handlers));
    payload
}
