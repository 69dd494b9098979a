use std::io::{self, Read, Write};

use log::debug;

use super::{
    ProtocolError,
    message::{HEADER_SIZE, LENGTH_SIZE, MAX_FRAME_SIZE, Message, MessageType},
};

/// One frame as read off the wire, before its body is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.tag)
    }

    pub fn decode(&self) -> Result<Message, ProtocolError> {
        Message::decode_body(self.tag, &self.body)
    }
}

/// Frames messages over a bidirectional byte stream.
///
/// Reads are unbuffered: exactly one frame is consumed per call, so bytes belonging to a
/// later frame are never pulled off the stream early.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    /// Direct access to the stream, for raw payloads that bypass framing.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Reads exactly one frame.
    pub fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        let mut len = [0_u8; LENGTH_SIZE];
        self.stream.read_exact(&mut len).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        })?;

        let len = u64::from_be_bytes(len);
        if len < HEADER_SIZE as u64 || len > MAX_FRAME_SIZE as u64 {
            return Err(ProtocolError::MalformedFrame(format!(
                "frame length {len} outside [{HEADER_SIZE}, {MAX_FRAME_SIZE}]"
            )));
        }

        let mut rest = vec![0_u8; len as usize - LENGTH_SIZE];
        self.stream.read_exact(&mut rest).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        })?;

        let tag = rest[0];
        rest.drain(..HEADER_SIZE - LENGTH_SIZE);
        debug!("read frame: tag {tag}, {} body bytes", rest.len());

        Ok(Frame { tag, body: rest })
    }

    pub fn read_message(&mut self) -> Result<Message, ProtocolError> {
        self.read_frame()?.decode()
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let frame = message.encode()?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Sends an [`Message::Error`] frame describing `cause`.
    pub fn reply_error(
        &mut self,
        cause: &dyn std::fmt::Display,
        message: &str,
    ) -> Result<(), ProtocolError> {
        self.write_message(&Message::error(cause, message))
    }
}
