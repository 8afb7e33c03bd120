//! The `bsdebug` wire protocol: a length-prefixed, little-endian
//! request/response/update codec.
//!
//! The handshake aside, every frame shares a 12-byte common header
//! (`packet_length`, `request_id`, `error_code` or `command_code`); update
//! frames add a fourth `update_type` field. See [`message`] for the
//! per-frame-kind encoders/decoders and [`buffer`] for the primitives they're
//! built on.

pub mod buffer;
pub mod codes;
mod error;
pub mod message;

pub use buffer::{BufferReader, BufferWriter};
pub use codes::*;
pub use error::ProtocolError;
pub use message::*;

/// The literal magic bytes opening a handshake, including the trailing NUL.
pub const HANDSHAKE_MAGIC: &[u8] = b"bsdebug\0";

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: (u32, u32, u32) = (3, 1, 0);

/// Default TCP port for the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 8081;
