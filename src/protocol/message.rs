use std::fmt;

use bincode::{
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, encode_into_std_write,
};

use crate::storage::ObjectInfo;

use super::ProtocolError;

/// Size of the length prefix that opens every frame.
pub const LENGTH_SIZE: usize = size_of::<u64>();
/// Length prefix, type tag and reserved padding.
pub const HEADER_SIZE: usize = LENGTH_SIZE + 4;
/// Largest frame accepted from a peer, header included.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

pub(crate) type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_FRAME_SIZE>>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_FRAME_SIZE>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Cat = 42,
    ReadyForQuery = 43,
    CommandComplete = 44,
    CopyData = 45,
    Put = 46,
    List = 47,
    ObjectMeta = 48,
    Error = 49,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            42 => Ok(MessageType::Cat),
            43 => Ok(MessageType::ReadyForQuery),
            44 => Ok(MessageType::CommandComplete),
            45 => Ok(MessageType::CopyData),
            46 => Ok(MessageType::Put),
            47 => Ok(MessageType::List),
            48 => Ok(MessageType::ObjectMeta),
            49 => Ok(MessageType::Error),
            tag => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Cat => "CAT",
            MessageType::ReadyForQuery => "READY FOR QUERY",
            MessageType::CommandComplete => "COMMAND COMPLETE",
            MessageType::CopyData => "COPY DATA",
            MessageType::Put => "PUT",
            MessageType::List => "LIST",
            MessageType::ObjectMeta => "OBJECT META",
            MessageType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Every message that can cross the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Stream an object back to the client, starting at `offset`.
    Cat {
        name: String,
        offset: i64,
        decrypt: bool,
    },
    /// Store an object from the `CopyData` frames that follow.
    Put { name: String, encrypt: bool },
    /// List objects under a key prefix.
    List { prefix: String },
    /// One chunk of a `Put` stream.
    CopyData { data: Vec<u8> },
    /// Terminates a `Put` stream.
    CommandComplete,
    /// A batch of listing results.
    ObjectMeta { entries: Vec<ObjectInfo> },
    /// The exchange finished successfully.
    ReadyForQuery,
    /// The exchange failed.
    Error { error: String, message: String },
}

impl Message {
    pub fn error(error: impl ToString, message: impl Into<String>) -> Self {
        Message::Error {
            error: error.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Message::Cat { .. } => MessageType::Cat,
            Message::Put { .. } => MessageType::Put,
            Message::List { .. } => MessageType::List,
            Message::CopyData { .. } => MessageType::CopyData,
            Message::CommandComplete => MessageType::CommandComplete,
            Message::ObjectMeta { .. } => MessageType::ObjectMeta,
            Message::ReadyForQuery => MessageType::ReadyForQuery,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Encodes the message as one complete frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let config = wire_config();
        let mut frame = vec![0_u8; LENGTH_SIZE];
        frame.extend_from_slice(&[self.kind() as u8, 0, 0, 0]);

        match self {
            Message::Cat {
                name,
                offset,
                decrypt,
            } => {
                encode_into_std_write((name, offset, u8::from(*decrypt)), &mut frame, config)?;
            }
            Message::Put { name, encrypt } => {
                encode_into_std_write((name, u8::from(*encrypt)), &mut frame, config)?;
            }
            Message::List { prefix } => {
                encode_into_std_write(prefix, &mut frame, config)?;
            }
            Message::CopyData { data } => {
                encode_into_std_write(data, &mut frame, config)?;
            }
            Message::ObjectMeta { entries } => {
                let count = u32::try_from(entries.len()).map_err(|_| {
                    ProtocolError::MalformedFrame(format!(
                        "{} entries do not fit in one frame",
                        entries.len()
                    ))
                })?;
                encode_into_std_write(count, &mut frame, config)?;
                for entry in entries {
                    encode_into_std_write(entry, &mut frame, config)?;
                }
            }
            Message::Error { error, message } => {
                encode_into_std_write((error, message), &mut frame, config)?;
            }
            Message::CommandComplete | Message::ReadyForQuery => {}
        }

        let len = frame.len() as u64;
        frame[..LENGTH_SIZE].copy_from_slice(&len.to_be_bytes());
        Ok(frame)
    }

    /// Decodes one complete frame, length prefix included.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let mut len = [0_u8; LENGTH_SIZE];
        len.copy_from_slice(&frame[..LENGTH_SIZE]);
        let len = u64::from_be_bytes(len);
        if len != frame.len() as u64 {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared length {len} does not match frame of {} bytes",
                frame.len()
            )));
        }

        Self::decode_body(frame[LENGTH_SIZE], &frame[HEADER_SIZE..])
    }

    /// Decodes the body that follows a frame header carrying `tag`.
    pub fn decode_body(tag: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        let config = wire_config();

        let message = match MessageType::try_from(tag)? {
            MessageType::Cat => {
                let ((name, offset, decrypt), _): ((String, i64, u8), _) =
                    decode_from_slice(body, config)?;
                Message::Cat {
                    name,
                    offset,
                    decrypt: decrypt != 0,
                }
            }
            MessageType::Put => {
                let ((name, encrypt), _): ((String, u8), _) = decode_from_slice(body, config)?;
                Message::Put {
                    name,
                    encrypt: encrypt != 0,
                }
            }
            MessageType::List => {
                let (prefix, _) = decode_from_slice(body, config)?;
                Message::List { prefix }
            }
            MessageType::CopyData => {
                let (data, _) = decode_from_slice(body, config)?;
                Message::CopyData { data }
            }
            MessageType::ObjectMeta => {
                let (count, mut read): (u32, usize) = decode_from_slice(body, config)?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let (entry, n): (ObjectInfo, usize) =
                        decode_from_slice(&body[read..], config)?;
                    entries.push(entry);
                    read += n;
                }
                Message::ObjectMeta { entries }
            }
            MessageType::Error => {
                let ((error, message), _): ((String, String), _) =
                    decode_from_slice(body, config)?;
                Message::Error { error, message }
            }
            MessageType::CommandComplete => Message::CommandComplete,
            MessageType::ReadyForQuery => Message::ReadyForQuery,
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let frame = message.encode().unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), message);
    }

    #[test]
    fn every_variant_round_trips() {
        let messages = vec![
            Message::Cat {
                name: "seg/1/2".into(),
                offset: 1 << 40,
                decrypt: true,
            },
            Message::Cat {
                name: String::new(),
                offset: 0,
                decrypt: false,
            },
            Message::Put {
                name: "a".into(),
                encrypt: true,
            },
            Message::List {
                prefix: String::new(),
            },
            Message::CopyData { data: vec![] },
            Message::CopyData {
                data: (0..=255).collect(),
            },
            Message::CommandComplete,
            Message::ObjectMeta { entries: vec![] },
            Message::ObjectMeta {
                entries: vec![ObjectInfo::new("x", 0), ObjectInfo::new("y/z", i64::MAX)],
            },
            Message::ReadyForQuery,
            Message::error("boom", ""),
        ];

        for message in messages {
            round_trip(message);
        }
    }

    #[test]
    fn cat_wire_layout() {
        let frame = Message::Cat {
            name: "ab".into(),
            offset: 5,
            decrypt: true,
        }
        .encode()
        .unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&31_u64.to_be_bytes());
        expected.extend_from_slice(&[42, 0, 0, 0]);
        expected.extend_from_slice(&2_u64.to_be_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&5_i64.to_be_bytes());
        expected.push(1);

        assert_eq!(frame, expected);
    }

    #[test]
    fn object_meta_wire_layout() {
        let frame = Message::ObjectMeta {
            entries: vec![ObjectInfo::new("p", 7)],
        }
        .encode()
        .unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&33_u64.to_be_bytes());
        expected.extend_from_slice(&[48, 0, 0, 0]);
        expected.extend_from_slice(&1_u32.to_be_bytes());
        expected.extend_from_slice(&1_u64.to_be_bytes());
        expected.push(b'p');
        expected.extend_from_slice(&7_i64.to_be_bytes());

        assert_eq!(frame, expected);
    }

    #[test]
    fn empty_messages_are_header_only() {
        let frame = Message::ReadyForQuery.encode().unwrap();
        assert_eq!(frame, [0, 0, 0, 0, 0, 0, 0, 12, 43, 0, 0, 0]);
    }

    #[test]
    fn overlong_string_length_is_malformed() {
        let mut frame = Message::List {
            prefix: "abc".into(),
        }
        .encode()
        .unwrap();
        // Claim far more prefix bytes than the frame carries.
        frame[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&u64::MAX.to_be_bytes());

        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let frame = Message::Put {
            name: "object".into(),
            encrypt: false,
        }
        .encode()
        .unwrap();
        let cut = &frame[HEADER_SIZE..frame.len() - 3];

        assert!(matches!(
            Message::decode_body(MessageType::Put as u8, cut),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let mut frame = Message::CommandComplete.encode().unwrap();
        frame.push(0);
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_tag() {
        assert!(matches!(
            Message::decode_body(7, &[]),
            Err(ProtocolError::UnknownMessageType(7))
        ));
    }
}
