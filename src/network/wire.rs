//! Message framing on the wire
//!
//! Every message travels as a fixed 24-byte header followed by its body:
//!
//! ```text
//! magic (4) | command (12, NUL padded) | length (u32 LE) | checksum (4)
//! ```
//!
//! The checksum is the first four bytes of the double SHA-256 of the body.
//! The body itself is the serialized [`Message`].

use crate::crypto::checksum;
use crate::network::message::Message;
use crate::network::transport::codec::{BodySizeFn, Frame};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;

/// Size of the message header
pub const HEADER_SIZE: usize = 24;

/// Width of the command field
pub const COMMAND_SIZE: usize = 12;

/// Largest body we accept (4 MiB)
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Commands this node understands
const KNOWN_COMMANDS: &[&str] = &[
    "version",
    "verack",
    "ping",
    "pong",
    "getaddr",
    "addr",
    "getheaders",
    "headers",
    "getcfheaders",
    "cfheaders",
    "inv",
    "getdata",
    "notfound",
    "block",
    "tx",
    "reject",
];

/// Framing and decoding errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Header of {0} bytes")]
    ShortHeader(usize),
    #[error("Wrong network magic {0}")]
    WrongNetwork(String),
    #[error("Payload of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("Payload length {got} does not match header length {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("Checksum mismatch")]
    Checksum,
    #[error("Malformed command field")]
    BadCommand,
    #[error("Unknown command {0}")]
    UnknownCommand(String),
    #[error("Header command {header} but body is {body}")]
    CommandMismatch { header: String, body: String },
    #[error("Malformed body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parsed message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Header describing `body` sent as `command`
    pub fn new(magic: [u8; 4], command: &str, body: &[u8]) -> Self {
        Self {
            magic,
            command: command.to_string(),
            length: body.len() as u32,
            checksum: checksum(body),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != HEADER_SIZE {
            return Err(WireError::ShortHeader(bytes.len()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);

        let field = &bytes[4..4 + COMMAND_SIZE];
        let end = field.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        if end == 0 || field[end..].iter().any(|b| *b != 0) {
            return Err(WireError::BadCommand);
        }
        let command = std::str::from_utf8(&field[..end])
            .ok()
            .filter(|c| c.bytes().all(|b| b.is_ascii_graphic()))
            .ok_or(WireError::BadCommand)?
            .to_string();

        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[16..20]);
        let mut sum = [0u8; 4];
        sum.copy_from_slice(&bytes[20..24]);

        Ok(Self {
            magic,
            command,
            length: u32::from_le_bytes(length),
            checksum: sum,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(&self.magic);
        let mut command = [0u8; COMMAND_SIZE];
        let len = self.command.len().min(COMMAND_SIZE);
        command[..len].copy_from_slice(&self.command.as_bytes()[..len]);
        buf.put_slice(&command);
        buf.put_u32_le(self.length);
        buf.put_slice(&self.checksum);
        buf.freeze()
    }

    /// Check network tag and announced size
    fn check(&self, magic: [u8; 4]) -> Result<usize, WireError> {
        if self.magic != magic {
            return Err(WireError::WrongNetwork(hex::encode(self.magic)));
        }
        let length = self.length as usize;
        if length > MAX_PAYLOAD {
            return Err(WireError::Oversized(length));
        }
        Ok(length)
    }
}

/// Body-size function handed to the frame codec for the given network
pub fn body_size(magic: [u8; 4]) -> BodySizeFn {
    Arc::new(move |header: &[u8]| {
        MessageHeader::parse(header)
            .and_then(|h| h.check(magic))
            .map_err(|e| e.to_string())
    })
}

/// Serialize a message into (header, body)
pub fn encode(magic: [u8; 4], message: &Message) -> Result<(Bytes, Bytes), WireError> {
    let body = message.to_bytes()?;
    if body.len() > MAX_PAYLOAD {
        return Err(WireError::Oversized(body.len()));
    }
    let header = MessageHeader::new(magic, message.command(), &body);
    Ok((header.to_bytes(), Bytes::from(body)))
}

/// Validate a reassembled frame and decode its message
pub fn decode(magic: [u8; 4], frame: &Frame) -> Result<Message, WireError> {
    let header = MessageHeader::parse(&frame.header)?;
    let length = header.check(magic)?;

    if frame.body.len() != length {
        return Err(WireError::LengthMismatch {
            expected: length,
            got: frame.body.len(),
        });
    }
    if checksum(&frame.body) != header.checksum {
        return Err(WireError::Checksum);
    }
    if !KNOWN_COMMANDS.contains(&header.command.as_str()) {
        return Err(WireError::UnknownCommand(header.command));
    }

    let message = Message::from_bytes(&frame.body)?;
    if message.command() != header.command {
        return Err(WireError::CommandMismatch {
            header: header.command,
            body: message.command().to_string(),
        });
    }
    Ok(message)
}
