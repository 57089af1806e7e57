//! Framed duplex channel over a pair of named pipes.
//!
//! One FIFO carries requests (manager → worker), the other responses
//! (worker → manager). Both live in a private per-instance directory.
//!
//! Connect order is fixed so that neither side ever reads a spurious EOF:
//!
//! 1. manager opens its response reader (non-blocking, succeeds at once)
//! 2. worker opens its response writer (blocks until step 1 happened)
//! 3. worker opens its request reader (blocks until step 4)
//! 4. manager opens its request writer, retrying `ENXIO` until the worker's
//!    reader exists; success implies step 2 already completed

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::codec::{read_frame, write_frame};
use super::protocol::Message;
use crate::types::{Error, IpcConfig, Result};

/// Request pipe file name inside the pipe directory.
pub const REQUEST_PIPE_NAME: &str = "pipe_in";
/// Response pipe file name inside the pipe directory.
pub const RESPONSE_PIPE_NAME: &str = "pipe_out";

pub const PIPE_DIR_ENV: &str = "MODELSERVE_PIPE_DIR";
pub const REQUEST_PIPE_ENV: &str = "MODELSERVE_REQUEST_PIPE";
pub const RESPONSE_PIPE_ENV: &str = "MODELSERVE_RESPONSE_PIPE";

type BoxReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Filesystem locations of one worker instance's pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    pub request: PathBuf,
    pub response: PathBuf,
}

impl PipePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            request: dir.join(REQUEST_PIPE_NAME),
            response: dir.join(RESPONSE_PIPE_NAME),
        }
    }

    /// Create both FIFOs (owner read/write only) inside `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        let paths = Self::in_dir(dir);
        for path in [&paths.request, &paths.response] {
            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                Error::ChannelOpen(format!("mkfifo {} failed: {}", path.display(), e))
            })?;
        }
        Ok(paths)
    }

    /// Worker-side lookup from the launch environment.
    ///
    /// Explicit pipe variables win over the directory variable.
    pub fn from_env() -> Result<Self> {
        let explicit = (
            std::env::var_os(REQUEST_PIPE_ENV),
            std::env::var_os(RESPONSE_PIPE_ENV),
        );
        if let (Some(request), Some(response)) = explicit {
            return Ok(Self {
                request: request.into(),
                response: response.into(),
            });
        }
        match std::env::var_os(PIPE_DIR_ENV) {
            Some(dir) => Ok(Self::in_dir(Path::new(&dir))),
            None => Err(Error::startup(format!("{} not set", PIPE_DIR_ENV))),
        }
    }

    /// Launch environment that points a worker at these pipes.
    pub fn to_env(&self, dir: &Path) -> Vec<(String, String)> {
        vec![
            (PIPE_DIR_ENV.to_string(), dir.display().to_string()),
            (REQUEST_PIPE_ENV.to_string(), self.request.display().to_string()),
            (RESPONSE_PIPE_ENV.to_string(), self.response.display().to_string()),
        ]
    }
}

/// Both halves of a connected channel.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    /// Manager side. Fails with `ChannelOpen` if the worker has not attached
    /// within `connect_timeout`.
    pub async fn open(
        paths: &PipePaths,
        connect_timeout: Duration,
        ipc: &IpcConfig,
    ) -> Result<Self> {
        let receiver = pipe::OpenOptions::new()
            .open_receiver(&paths.response)
            .map_err(|e| {
                Error::ChannelOpen(format!("open {}: {}", paths.response.display(), e))
            })?;

        let started = Instant::now();
        let sender = loop {
            match pipe::OpenOptions::new().open_sender(&paths.request) {
                Ok(sender) => break sender,
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                    if started.elapsed() >= connect_timeout {
                        return Err(Error::ChannelOpen(format!(
                            "worker did not connect within {:?}",
                            connect_timeout
                        )));
                    }
                    tokio::time::sleep(ipc.connect_poll_interval).await;
                }
                Err(e) => {
                    return Err(Error::ChannelOpen(format!(
                        "open {}: {}",
                        paths.request.display(),
                        e
                    )))
                }
            }
        };

        Ok(Self::from_streams(receiver, sender, ipc))
    }

    /// Worker side. Blocks until the manager has opened its ends.
    pub async fn connect_worker(paths: &PipePaths, ipc: &IpcConfig) -> Result<Self> {
        let response = paths.response.clone();
        let out_file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(&response)
        })
        .await
        .map_err(|e| Error::ChannelOpen(format!("response pipe open task failed: {}", e)))?
        .map_err(|e| Error::ChannelOpen(format!("open {}: {}", paths.response.display(), e)))?;
        let sender = pipe::Sender::from_file(out_file)
            .map_err(|e| Error::ChannelOpen(format!("response pipe: {}", e)))?;

        let request = paths.request.clone();
        let in_file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().read(true).open(&request)
        })
        .await
        .map_err(|e| Error::ChannelOpen(format!("request pipe open task failed: {}", e)))?
        .map_err(|e| Error::ChannelOpen(format!("open {}: {}", paths.request.display(), e)))?;
        let receiver = pipe::Receiver::from_file(in_file)
            .map_err(|e| Error::ChannelOpen(format!("request pipe: {}", e)))?;

        Ok(Self::from_streams(receiver, sender, ipc))
    }

    /// Wrap arbitrary byte streams (tests use `tokio::io::duplex`).
    pub fn from_streams<R, W>(reader: R, writer: W, ipc: &IpcConfig) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: ChannelReader {
                inner: Box::new(reader),
                max_frame_bytes: ipc.max_frame_bytes,
            },
            writer: ChannelWriter {
                inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
                write_timeout: ipc.write_timeout,
                max_frame_bytes: ipc.max_frame_bytes,
            },
        }
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn receive(&mut self) -> Result<Message> {
        self.reader.receive().await
    }

    /// Separate the receive side (owned by one reader task) from the
    /// cloneable, serialized send side.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }

    pub async fn close(self) {
        self.writer.close().await;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

/// Receive half. Exactly one task owns it.
pub struct ChannelReader {
    inner: BoxReader,
    max_frame_bytes: u32,
}

impl ChannelReader {
    /// Next full message. `ChannelClosed` on EOF, `ChannelFraming` on a
    /// malformed frame.
    pub async fn receive(&mut self) -> Result<Message> {
        match read_frame(&mut self.inner, self.max_frame_bytes).await {
            Ok(Some(body)) => Message::decode(&body),
            Ok(None) => Err(Error::ChannelClosed("peer closed the channel".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(Error::ChannelFraming(e.to_string()))
            }
            Err(e) => Err(Error::ChannelClosed(e.to_string())),
        }
    }
}

impl fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReader")
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

/// Send half. Clones share one underlying stream; frames never interleave.
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Mutex<Option<BoxWriter>>>,
    write_timeout: Duration,
    max_frame_bytes: u32,
}

impl ChannelWriter {
    pub async fn send(&self, message: &Message) -> Result<()> {
        let body = message.encode()?;
        if body.len() > self.max_frame_bytes as usize {
            return Err(Error::ChannelFraming(format!(
                "outgoing frame of {} bytes exceeds limit {}",
                body.len(),
                self.max_frame_bytes
            )));
        }

        let mut guard = self.inner.lock().await;
        let mut in_flight = FrameInFlight {
            slot: &mut *guard,
            written: false,
        };
        let Some(writer) = in_flight.slot.as_mut() else {
            return Err(Error::ChannelWrite("channel is closed".to_string()));
        };
        let outcome = tokio::time::timeout(self.write_timeout, write_frame(writer, &body)).await;
        match outcome {
            Ok(Ok(())) => {
                in_flight.written = true;
                Ok(())
            }
            Ok(Err(e)) => Err(Error::ChannelWrite(e.to_string())),
            Err(_) => Err(Error::ChannelWrite(format!(
                "write did not complete within {:?}",
                self.write_timeout
            ))),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }

    /// Release the write end. Idempotent.
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Drops the write end unless the frame went out whole. Covers write
/// errors, the write timeout, and a caller abandoning `send` mid-frame.
struct FrameInFlight<'a> {
    slot: &'a mut Option<BoxWriter>,
    written: bool,
}

impl Drop for FrameInFlight<'_> {
    fn drop(&mut self) {
        // A partially written frame poisons the stream.
        if !self.written && self.slot.take().is_some() {
            tracing::debug!("write end closed after an incomplete frame write");
        }
    }
}

impl fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}
