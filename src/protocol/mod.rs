pub mod codec;
pub mod command;

use std::fmt;

pub use codec::{Packet, PacketCodec};
pub use command::{RequestCommand, ResponseCommand};

/// Opaque job identifier issued by the job server in `job_created`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct JobHandle(Vec<u8>);

impl JobHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for JobHandle {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Malformed or out-of-protocol input. Always fatal to the connection: once
/// raised, the read buffer is no longer trusted.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidMagic { magic: [u8; 4] },
    UnknownCommand { code: u32 },
    PacketTooLarge { length: usize, limit: usize },
    MalformedBody { command: ResponseCommand, reason: &'static str },
    UnexpectedJobCreated { handle: JobHandle },
    UnknownHandle { command: ResponseCommand, handle: JobHandle },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic { magic } => {
                write!(f, "protocol error: invalid magic {:?}", String::from_utf8_lossy(magic))
            }
            Self::UnknownCommand { code } => {
                write!(f, "protocol error: unexpected packet type {code}")
            }
            Self::PacketTooLarge { length, limit } => write!(
                f,
                "protocol error: packet body length {length} exceeds max {limit}"
            ),
            Self::MalformedBody { command, reason } => {
                write!(f, "protocol error: malformed {command} body: {reason}")
            }
            Self::UnexpectedJobCreated { handle } => write!(
                f,
                "protocol error: got job_created with handle '{handle}' but no submission is awaiting one"
            ),
            Self::UnknownHandle { command, handle } => write!(
                f,
                "protocol error: got {command} for unknown handle '{handle}'"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Splits a response body on NUL into at most `limit` fields. The last field
/// keeps any further NUL bytes; missing trailing fields come back empty.
pub fn split_body(body: &[u8], limit: usize) -> Vec<&[u8]> {
    let mut fields: Vec<&[u8]> = body.splitn(limit, |byte| *byte == 0).collect();
    while fields.len() < limit {
        fields.push(&[]);
    }
    fields
}
