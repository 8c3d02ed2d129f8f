//! Message framing.
//!
//! ```text
//! invocation: magic | length | type | object id | method id | request id | args...
//! return:     magic | length | type | request id | status | value...
//! ```
//!
//! Every field is a big-endian long except the one-byte return status.

use crate::buffer::Buffer;
use crate::error::{Error, Result};

pub const MCOP_MAGIC: i32 = 0x4d43_4f50; // "MCOP"
pub const HEADER_SIZE: usize = 12;
pub const OBJECT_ID_OFFSET: usize = 12;
pub const METHOD_ID_OFFSET: usize = 16;
pub const REQUEST_ID_OFFSET: usize = 20;
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Method id placeholder written before the id is resolved.
pub const UNRESOLVED_METHOD: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invocation = 4,
    Return = 5,
    OnewayInvocation = 6,
}

impl MessageType {
    fn from_long(value: i32) -> Option<Self> {
        match value {
            4 => Some(MessageType::Invocation),
            5 => Some(MessageType::Return),
            6 => Some(MessageType::OnewayInvocation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnStatus {
    Ok = 0,
    NoSuchObject = 1,
    NoSuchMethod = 2,
}

impl ReturnStatus {
    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReturnStatus::Ok),
            1 => Some(ReturnStatus::NoSuchObject),
            2 => Some(ReturnStatus::NoSuchMethod),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    Invocation {
        object_id: u32,
        method_id: i32,
        request_id: u32,
        oneway: bool,
    },
    Return {
        request_id: u32,
        status: ReturnStatus,
    },
}

fn header(message_type: MessageType) -> Buffer {
    let mut buffer = Buffer::new();
    buffer.write_long(MCOP_MAGIC);
    buffer.write_long(0); // patched by patch_length
    buffer.write_long(message_type as i32);
    buffer
}

pub fn invocation(object_id: u32, method_id: i32, request_id: u32, oneway: bool) -> Buffer {
    let message_type = if oneway {
        MessageType::OnewayInvocation
    } else {
        MessageType::Invocation
    };
    let mut buffer = header(message_type);
    buffer.write_long(object_id as i32);
    buffer.write_long(method_id);
    buffer.write_long(request_id as i32);
    buffer
}

pub fn reply(request_id: u32, status: ReturnStatus) -> Buffer {
    let mut buffer = header(MessageType::Return);
    buffer.write_long(request_id as i32);
    buffer.write_byte(status as u8);
    buffer
}

/// Total message length announced by a header prefix, once 8 bytes are in.
pub fn announced_length(prefix: &[u8]) -> Result<Option<usize>> {
    if prefix.len() < 8 {
        return Ok(None);
    }
    let mut buffer = Buffer::from_bytes(prefix[..8].to_vec());
    if buffer.read_long() != MCOP_MAGIC {
        return Err(Error::BadMessage("bad magic".to_string()));
    }
    let length = buffer.read_long();
    if length < HEADER_SIZE as i32 || length as usize > MAX_MESSAGE_SIZE {
        return Err(Error::BadMessage(format!("bad length {length}")));
    }
    Ok(Some(length as usize))
}

/// Reads the header and leaves the read cursor at the payload.
pub fn parse(buffer: &mut Buffer) -> Result<Incoming> {
    buffer.rewind();
    if buffer.read_long() != MCOP_MAGIC {
        return Err(Error::BadMessage("bad magic".to_string()));
    }
    let length = buffer.read_long();
    if length as usize != buffer.size() {
        return Err(Error::BadMessage(format!(
            "length field {length} but {} bytes",
            buffer.size()
        )));
    }
    let raw_type = buffer.read_long();
    let message_type = MessageType::from_long(raw_type)
        .ok_or_else(|| Error::BadMessage(format!("unknown message type {raw_type}")))?;
    let incoming = match message_type {
        MessageType::Invocation | MessageType::OnewayInvocation => Incoming::Invocation {
            object_id: buffer.read_long() as u32,
            method_id: buffer.read_long(),
            request_id: buffer.read_long() as u32,
            oneway: message_type == MessageType::OnewayInvocation,
        },
        MessageType::Return => {
            let request_id = buffer.read_long() as u32;
            let raw_status = buffer.read_byte();
            let status = ReturnStatus::from_byte(raw_status)
                .ok_or_else(|| Error::BadMessage(format!("unknown status {raw_status}")))?;
            Incoming::Return { request_id, status }
        }
    };
    if buffer.read_error() {
        return Err(Error::BadMessage("truncated header".to_string()));
    }
    Ok(incoming)
}
