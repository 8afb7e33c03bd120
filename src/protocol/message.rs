//! Frame encoding and decoding.
//!
//! Every frame after the handshake shares a 12-byte common header:
//! `packet_length : u32, request_id : u32, error_code|command_code : u32`.
//! Update frames add a fourth `update_type : u32` field. This module provides
//! the shared header plumbing; each message type lives in its own file, one
//! per wire command/update family.

pub mod control;
pub mod handshake;
pub mod stack_trace;
pub mod threads;
pub mod updates;
pub mod variables;

pub use control::*;
pub use handshake::*;
pub use stack_trace::*;
pub use threads::*;
pub use updates::*;
pub use variables::*;

use super::buffer::{BufferReader, BufferWriter};
use super::codes::{CommandCode, ErrorCode, UpdateType};
use super::error::ProtocolError;

/// A successfully decoded value along with the number of bytes it occupied
/// on the wire, so the caller can slice its frame off the front of the
/// unhandled-bytes buffer.
#[derive(Debug)]
pub struct Decoded<T> {
    /// The decoded value.
    pub value: T,
    /// Bytes consumed from the input, equal to the frame's `packet_length`.
    pub consumed: usize,
}

/// Reads the `packet_length`-prefixed frame body and hands a reader over just
/// that frame's bytes to `decode_body`. Returns `ShortRead` without consuming
/// anything if `buf` does not yet hold a full frame.
fn decode_with_length<T>(
    buf: &[u8],
    decode_body: impl FnOnce(&mut BufferReader<'_>) -> Result<T, ProtocolError>,
) -> Result<Decoded<T>, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::ShortRead);
    }

    let packet_length = BufferReader::new(&buf[0..4]).read_u32().unwrap() as usize;
    if buf.len() < packet_length {
        return Err(ProtocolError::ShortRead);
    }

    let mut r = BufferReader::new(&buf[..packet_length]);
    r.read_u32()?; // packet_length itself, already consumed above.
    let value = decode_body(&mut r)?;

    Ok(Decoded {
        value,
        consumed: packet_length,
    })
}

/// Prepends the `packet_length` field (the total length, including itself)
/// to a frame body that's already been written.
fn encode_with_length(mut w: BufferWriter) -> Vec<u8> {
    let total = w.as_slice().len() as u32 + 4;
    w.insert_u32_at_front(total);
    w.into_vec()
}

/// A request frame: something the client sends and expects a [`Response`] to.
pub trait Request: Sized {
    /// The wire command code identifying this request type.
    const COMMAND: CommandCode;

    /// Writes the request-specific body (after the common header).
    fn write_body(&self, w: &mut BufferWriter);

    /// Reads the request-specific body (after the common header).
    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError>;

    /// Encodes a full request frame with the given request id.
    fn to_buffer(&self, request_id: u32) -> Vec<u8> {
        let mut w = BufferWriter::new();
        w.write_u32(request_id);
        w.write_u32(Self::COMMAND as u32);
        self.write_body(&mut w);
        encode_with_length(w)
    }

    /// Decodes a full request frame, returning the request id alongside it.
    fn from_buffer(buf: &[u8]) -> Result<Decoded<(u32, Self)>, ProtocolError> {
        decode_with_length(buf, |r| {
            let request_id = r.read_u32()?;
            let command = r.read_enum::<CommandCode>("command_code")?;
            if command != Self::COMMAND {
                return Err(ProtocolError::Invalid(format!(
                    "expected command {:?}, got {:?}",
                    Self::COMMAND,
                    command
                )));
            }

            let value = Self::read_body(r)?;
            Ok((request_id, value))
        })
    }
}

/// The decoded envelope of a response frame: the header fields plus a body,
/// which is absent when `error_code != Ok`.
#[derive(Debug)]
pub struct ResponseEnvelope<T> {
    /// The request id this response correlates to.
    pub request_id: u32,
    /// The result of the request.
    pub error_code: ErrorCode,
    /// The response body, present only on success.
    pub body: Option<T>,
}

/// A response frame: the server's reply to a [`Request`].
pub trait Response: Sized {
    /// Writes the response-specific body (after the common header).
    fn write_body(&self, w: &mut BufferWriter);

    /// Reads the response-specific body (after the common header).
    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError>;

    /// Encodes a full response frame.
    fn to_buffer(&self, request_id: u32, error_code: ErrorCode) -> Vec<u8> {
        let mut w = BufferWriter::new();
        w.write_u32(request_id);
        w.write_u32(error_code as u32);
        if error_code == ErrorCode::Ok {
            self.write_body(&mut w);
        }
        encode_with_length(w)
    }

    /// Decodes a full response frame.
    fn from_buffer(buf: &[u8]) -> Result<Decoded<ResponseEnvelope<Self>>, ProtocolError> {
        decode_with_length(buf, |r| {
            let request_id = r.read_u32()?;
            let error_code = r.read_enum::<ErrorCode>("error_code")?;
            let body = if error_code == ErrorCode::Ok {
                Some(Self::read_body(r)?)
            } else {
                None
            };

            Ok(ResponseEnvelope {
                request_id,
                error_code,
                body,
            })
        })
    }
}

/// An unsolicited update frame (`request_id == 0`).
pub trait Update: Sized {
    /// The wire update type identifying this update.
    const UPDATE_TYPE: UpdateType;

    /// Writes the update-specific body (after the common header).
    fn write_body(&self, w: &mut BufferWriter);

    /// Reads the update-specific body (after the common header).
    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError>;

    /// Encodes a full update frame.
    fn to_buffer(&self) -> Vec<u8> {
        let mut w = BufferWriter::new();
        w.write_u32(0);
        w.write_u32(ErrorCode::Ok as u32);
        w.write_u32(Self::UPDATE_TYPE as u32);
        self.write_body(&mut w);
        encode_with_length(w)
    }

    /// Decodes a full update frame.
    fn from_buffer(buf: &[u8]) -> Result<Decoded<Self>, ProtocolError> {
        decode_with_length(buf, |r| {
            let request_id = r.read_u32()?;
            if request_id != 0 {
                return Err(ProtocolError::Invalid(
                    "update frame must have request_id == 0".to_string(),
                ));
            }

            r.read_enum::<ErrorCode>("error_code")?;
            let update_type = r.read_enum::<UpdateType>("update_type")?;
            if update_type != Self::UPDATE_TYPE {
                return Err(ProtocolError::Invalid(format!(
                    "expected update {:?}, got {:?}",
                    Self::UPDATE_TYPE,
                    update_type
                )));
            }

            Self::read_body(r)
        })
    }
}
