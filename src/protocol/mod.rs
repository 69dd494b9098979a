//! Client-proxy communication protocol.
//!
//! This module defines the framed binary protocol spoken between clients and the proxy,
//! the per-connection state machine that serves it, and the listener that hands each
//! connection to its own thread.
//!
//! # Overview
//!
//! A client opens a connection and sends one request frame: `Cat` to stream an object back,
//! `Put` followed by `CopyData` chunks and a `CommandComplete` to store one, or `List` to
//! enumerate objects under a prefix. The proxy replies with raw object bytes, `ObjectMeta`
//! batches, a `ReadyForQuery` sentinel, or an `Error` frame, then closes the connection.
//!
//! # Binary Format
//!
//! All integers are big-endian.
//!
//! - Each frame opens with a `u64` total length (covering the whole frame, the length
//!   itself included), a `u8` message type and three reserved bytes.
//! - Variable-length fields are prefixed with their `u64` length.
//! - Offsets, sizes and flags use fixed-width integers.
//!
//! # Key Components
//!
//! - [`Message`]: Every request and response variant, with its encoder and decoder.
//! - [`ProtocolTransport`]: Reads and writes whole frames over a byte stream.
//! - [`handle_connection`]: Serves one exchange end-to-end.
//! - [`ProxyServer`]: Accepts connections and serves each on its own thread.
//!
//! # See Also
//!
//! - [`storage`](crate::storage): The backends requests are translated into.
//! - [`crypt`](crate::crypt): Optional encryption applied to stored objects.
use std::io::{self, Write};

use thiserror::Error;

use crate::storage::{RetriesExhausted, StorageError};

mod connection;
mod message;
pub mod pipe;
mod server;
mod transport;

pub use connection::{LIST_BATCH_SIZE, handle_connection};
pub use message::{HEADER_SIZE, MAX_FRAME_SIZE, Message, MessageType};
pub use server::{DEFAULT_SOCKET_PATH, ProxyServer, ServerConfig};
pub use transport::{Frame, ProtocolTransport};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("transport io error: {0}")]
    Io(io::Error),

    #[error("{0}")]
    RetriesExhausted(RetriesExhausted),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unexpected {0} message")]
    UnexpectedMessage(MessageType),

    #[error(transparent)]
    Backend(#[from] StorageError),

    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("{error}: {message}")]
    Remote { error: String, message: String },
}

impl From<bincode::error::DecodeError> for ProtocolError {
    fn from(value: bincode::error::DecodeError) -> Self {
        ProtocolError::MalformedFrame(value.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(value: io::Error) -> Self {
        if let Some(exhausted) = value
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<RetriesExhausted>())
        {
            return ProtocolError::RetriesExhausted(*exhausted);
        }
        ProtocolError::Io(value)
    }
}

/// A byte sink with an explicit end of stream.
///
/// Dropping a sink without calling [`StreamSink::finish`] abandons the stream; whatever is
/// downstream must treat it as incomplete.
pub trait StreamSink: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl StreamSink for pipe::PipeWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        (*self).close();
        Ok(())
    }
}
