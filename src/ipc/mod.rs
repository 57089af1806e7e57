//! Named-pipe IPC transport between a manager and its worker.
//!
//! Length-prefixed JSON framing ([`codec`]), the message model
//! ([`protocol`]), the FIFO pair transport ([`channel`]) and correlated
//! request multiplexing on top of it ([`dispatch`]).

pub mod channel;
pub mod codec;
pub mod dispatch;
pub mod protocol;

pub use channel::{Channel, ChannelReader, ChannelWriter, PipePaths};
pub use dispatch::{CancelReason, RequestDispatcher};
pub use protocol::{Message, MessageKind, Payload, ResponseStatus, PING_HANDLER, SHUTDOWN_HANDLER};
