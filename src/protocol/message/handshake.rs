//! The handshake that opens a control-channel session.
//!
//! Unlike every other frame, the client's half of the handshake carries no
//! header at all — it is exactly the magic bytes. The server's reply uses the
//! ordinary response header (`request_id` fixed at `0`) followed by its own
//! version and a revision timestamp.

use super::{Decoded, Response};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codes::ErrorCode;
use crate::protocol::error::ProtocolError;
use crate::protocol::HANDSHAKE_MAGIC;

/// Encodes the client's handshake request: just the magic, NUL included.
pub fn encode_handshake_request(magic: &[u8]) -> Vec<u8> {
    magic.to_vec()
}

/// Decodes the client's handshake request out of `buf`, which must contain at
/// least `magic.len()` bytes.
pub fn decode_handshake_request(buf: &[u8], magic: &[u8]) -> Result<Decoded<()>, ProtocolError> {
    if buf.len() < magic.len() {
        return Err(ProtocolError::ShortRead);
    }

    if &buf[..magic.len()] != magic {
        return Err(ProtocolError::BadMagic(buf[..magic.len()].to_vec()));
    }

    Ok(Decoded {
        value: (),
        consumed: magic.len(),
    })
}

/// The server's handshake reply: its magic (echoed back), protocol version,
/// and a revision timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponseV3 {
    /// Echoed magic string, without the NUL terminator.
    pub magic: String,
    /// Major protocol version.
    pub major: u32,
    /// Minor protocol version.
    pub minor: u32,
    /// Patch protocol version.
    pub patch: u32,
    /// Device-reported revision timestamp (protocol v3+).
    pub revision_timestamp: i64,
}

impl HandshakeResponseV3 {
    /// Builds the reply matching [`crate::protocol::PROTOCOL_VERSION`].
    pub fn current(revision_timestamp: i64) -> Self {
        let (major, minor, patch) = crate::protocol::PROTOCOL_VERSION;
        Self {
            magic: "bsdebug".to_string(),
            major,
            minor,
            patch,
            revision_timestamp,
        }
    }
}

impl Response for HandshakeResponseV3 {
    fn write_body(&self, w: &mut BufferWriter) {
        w.write_cstring(&self.magic);
        w.write_u32(self.major);
        w.write_u32(self.minor);
        w.write_u32(self.patch);
        w.write_i64(self.revision_timestamp);
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            magic: r.read_cstring()?,
            major: r.read_u32()?,
            minor: r.read_u32()?,
            patch: r.read_u32()?,
            revision_timestamp: r.read_i64()?,
        })
    }
}

/// Convenience wrapper matching [`Response::to_buffer`] but fixing
/// `request_id` at `0` and `error_code` at [`ErrorCode::Ok`], since a
/// handshake reply never fails in this protocol revision.
pub fn encode_handshake_response(reply: &HandshakeResponseV3) -> Vec<u8> {
    reply.to_buffer(0, ErrorCode::Ok)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_roundtrip() {
        let buf = encode_handshake_request(HANDSHAKE_MAGIC);
        let decoded = decode_handshake_request(&buf, HANDSHAKE_MAGIC).unwrap();
        assert_eq!(decoded.consumed, HANDSHAKE_MAGIC.len());
    }

    #[test]
    fn request_bad_magic() {
        let err = decode_handshake_request(b"notbsdebug", HANDSHAKE_MAGIC).unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic(_)));
    }

    #[test]
    fn request_short_read() {
        let err = decode_handshake_request(b"bsd", HANDSHAKE_MAGIC).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn response_roundtrip() {
        let reply = HandshakeResponseV3::current(1_700_000_000);
        let buf = encode_handshake_response(&reply);

        let decoded = HandshakeResponseV3::from_buffer(&buf).unwrap();
        assert_eq!(decoded.consumed, buf.len());
        assert_eq!(decoded.value.request_id, 0);
        assert_eq!(decoded.value.error_code, ErrorCode::Ok);
        assert_eq!(decoded.value.body.unwrap(), reply);
    }
}
