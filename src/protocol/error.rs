//! Error types for the wire protocol layer.

use thiserror::Error;

use super::codes::ErrorCode;

/// Errors produced while decoding or encoding a frame.
///
/// `ShortRead` is the one recoverable variant: it means the buffer handed to a
/// decoder does not yet hold a complete frame, and the caller should retry
/// once more bytes have arrived rather than treat the session as broken.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The buffer does not yet contain a complete frame.
    #[error("short read: need more data")]
    ShortRead,

    /// The handshake magic did not match the expected literal.
    #[error("bad handshake magic: {0:?}")]
    BadMagic(Vec<u8>),

    /// A field was out of range or otherwise malformed.
    #[error("invalid frame: {0}")]
    Invalid(String),

    /// An enum-valued field held a discriminant we don't recognize.
    #[error("unknown discriminant {value} for {field}")]
    UnknownDiscriminant {
        /// Name of the field that failed to decode.
        field: &'static str,
        /// The raw value on the wire.
        value: u32,
    },

    /// The response frame carried an error code from the peer.
    #[error("peer returned error: {0:?}")]
    PeerError(ErrorCode),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True if retrying with more bytes could make this decode succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::ShortRead)
    }
}
