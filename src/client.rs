//! Blocking client for the proxy protocol.
//!
//! Every call opens a fresh connection to the proxy socket and performs exactly one
//! exchange on it.
use std::{
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    protocol::{Message, ProtocolError, ProtocolTransport},
    storage::ObjectInfo,
};

/// Largest `CopyData` payload sent by [`ProxyClient::put`].
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyClient {
    socket: PathBuf,
}

impl ProxyClient {
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<ProtocolTransport<UnixStream>, ProtocolError> {
        debug!("connecting to {}", self.socket.display());
        Ok(ProtocolTransport::new(UnixStream::connect(&self.socket)?))
    }

    /// Streams `name` from `offset` into `sink`, returning the number of bytes copied.
    ///
    /// The proxy sends raw object bytes and closes the connection, so a failure reported
    /// after the first byte cannot be told apart from object content.
    pub fn cat(
        &self,
        name: &str,
        offset: i64,
        decrypt: bool,
        sink: &mut dyn Write,
    ) -> Result<u64, ProtocolError> {
        let mut transport = self.connect()?;
        transport.write_message(&Message::Cat {
            name: name.to_string(),
            offset,
            decrypt,
        })?;

        let copied = io::copy(transport.get_mut(), &mut *sink)?;
        sink.flush()?;
        Ok(copied)
    }

    /// Uploads everything readable from `source` as `name`.
    pub fn put(
        &self,
        name: &str,
        encrypt: bool,
        source: &mut dyn Read,
    ) -> Result<(), ProtocolError> {
        let mut transport = self.connect()?;

        if let Err(e) = send_upload(&mut transport, name, encrypt, source) {
            // The proxy may have rejected the upload and hung up; prefer its explanation.
            return match transport.read_message() {
                Ok(Message::Error { error, message }) => {
                    Err(ProtocolError::Remote { error, message })
                }
                _ => Err(e),
            };
        }

        match transport.read_message()? {
            Message::ReadyForQuery => Ok(()),
            Message::Error { error, message } => Err(ProtocolError::Remote { error, message }),
            other => Err(ProtocolError::UnexpectedMessage(other.kind())),
        }
    }

    /// Lists every object whose key starts with `prefix`.
    pub fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, ProtocolError> {
        let mut transport = self.connect()?;
        transport.write_message(&Message::List {
            prefix: prefix.to_string(),
        })?;

        let mut objects = Vec::new();
        loop {
            match transport.read_message()? {
                Message::ObjectMeta { entries } => objects.extend(entries),
                Message::ReadyForQuery => return Ok(objects),
                Message::Error { error, message } => {
                    return Err(ProtocolError::Remote { error, message });
                }
                other => return Err(ProtocolError::UnexpectedMessage(other.kind())),
            }
        }
    }
}

fn send_upload(
    transport: &mut ProtocolTransport<UnixStream>,
    name: &str,
    encrypt: bool,
    source: &mut dyn Read,
) -> Result<(), ProtocolError> {
    transport.write_message(&Message::Put {
        name: name.to_string(),
        encrypt,
    })?;

    let mut buf = vec![0_u8; CHUNK_SIZE];
    let mut sent = 0_u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        transport.write_message(&Message::CopyData {
            data: buf[..n].to_vec(),
        })?;
        sent += n as u64;
    }
    debug!("sent {sent} bytes for '{name}'");

    transport.write_message(&Message::CommandComplete)
}
