use crate::config;
use crate::protocol::{ProtocolError, RequestCommand, ResponseCommand};

pub const REQUEST_MAGIC: [u8; 4] = *b"\0REQ";
pub const RESPONSE_MAGIC: [u8; 4] = *b"\0RES";
pub const HEADER_SIZE_BYTES: usize = 12;
pub const MAX_PACKET_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub command: ResponseCommand,
    pub body: Vec<u8>,
}

/// Frames Gearman packets. Decoding never blocks and never consumes a partial
/// packet; a `None` result means the caller should wait for more bytes.
#[derive(Clone, Debug)]
pub struct PacketCodec {
    max_body_bytes: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_BODY_BYTES)
    }
}

impl PacketCodec {
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }

    pub fn from_wire_config(wire: &config::WireConfig) -> Self {
        Self::new(wire.max_packet_body_bytes)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn encode_request(
        &self,
        command: RequestCommand,
        body: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        encode_request(command, body)
    }

    pub fn try_decode(&self, buffer: &mut Vec<u8>) -> Result<Option<Packet>, ProtocolError> {
        if buffer.len() < HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let magic = [buffer[0], buffer[1], buffer[2], buffer[3]];
        if magic != RESPONSE_MAGIC {
            return Err(ProtocolError::InvalidMagic { magic });
        }

        let code = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        let command =
            ResponseCommand::from_code(code).ok_or(ProtocolError::UnknownCommand { code })?;

        let body_len = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize;
        if body_len > self.max_body_bytes {
            return Err(ProtocolError::PacketTooLarge {
                length: body_len,
                limit: self.max_body_bytes,
            });
        }

        if buffer.len() < HEADER_SIZE_BYTES + body_len {
            return Ok(None);
        }

        let mut frame: Vec<u8> = buffer.drain(..HEADER_SIZE_BYTES + body_len).collect();
        let body = frame.split_off(HEADER_SIZE_BYTES);
        Ok(Some(Packet { command, body }))
    }
}

pub fn encode_request(command: RequestCommand, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode_packet(REQUEST_MAGIC, command.code(), body)
}

/// Encodes a server-side packet. The client never sends these; fake job
/// servers in tests and tooling do.
pub fn encode_response(command: ResponseCommand, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode_packet(RESPONSE_MAGIC, command.code(), body)
}

fn encode_packet(magic: [u8; 4], code: u32, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let header = encode_header(magic, code, body.len())?;
    let mut packet = Vec::with_capacity(HEADER_SIZE_BYTES + body.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(body);
    Ok(packet)
}

// The length field is a u32; longer bodies cannot be framed.
fn encode_header(
    magic: [u8; 4],
    code: u32,
    body_len: usize,
) -> Result<[u8; HEADER_SIZE_BYTES], ProtocolError> {
    let length = u32::try_from(body_len).map_err(|_| ProtocolError::PacketTooLarge {
        length: body_len,
        limit: u32::MAX as usize,
    })?;

    let mut header = [0_u8; HEADER_SIZE_BYTES];
    header[0..4].copy_from_slice(&magic);
    header[4..8].copy_from_slice(&code.to_be_bytes());
    header[8..12].copy_from_slice(&length.to_be_bytes());
    Ok(header)
}
