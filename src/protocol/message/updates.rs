//! Unsolicited update frames (`request_id == 0`).

use super::Update;
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codes::{StopReason, UpdateType};
use crate::protocol::error::ProtocolError;

/// Every thread is now stopped. The first occurrence after connect is
/// swallowed by the client's first-run-continue quirk rather than surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllThreadsStoppedUpdate {
    /// Index of the primary (main) thread.
    pub primary_thread_index: i32,
    /// Why execution stopped.
    pub stop_reason: StopReason,
    /// Human-readable detail, often empty.
    pub stop_reason_detail: String,
}

impl Update for AllThreadsStoppedUpdate {
    const UPDATE_TYPE: UpdateType = UpdateType::AllThreadsStopped;

    fn write_body(&self, w: &mut BufferWriter) {
        w.write_i32(self.primary_thread_index);
        w.write_u8(self.stop_reason as u8);
        w.write_cstring(&self.stop_reason_detail);
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            primary_thread_index: r.read_i32()?,
            stop_reason: r.read_enum_u8("stop_reason")?,
            stop_reason_detail: r.read_cstring()?,
        })
    }
}

/// A new thread has attached (and is immediately stopped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAttachedUpdate {
    /// Index of the newly attached thread.
    pub thread_index: i32,
    /// Why it's stopped.
    pub stop_reason: StopReason,
    /// Human-readable detail.
    pub stop_reason_detail: String,
}

impl Update for ThreadAttachedUpdate {
    const UPDATE_TYPE: UpdateType = UpdateType::ThreadAttached;

    fn write_body(&self, w: &mut BufferWriter) {
        w.write_i32(self.thread_index);
        w.write_u8(self.stop_reason as u8);
        w.write_cstring(&self.stop_reason_detail);
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            thread_index: r.read_i32()?,
            stop_reason: r.read_enum_u8("stop_reason")?,
            stop_reason_detail: r.read_cstring()?,
        })
    }
}

/// The device opened its I/O port and is ready to accept a connection on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPortOpenedUpdate {
    /// TCP port to connect to for program output.
    pub port: u32,
}

impl Update for IoPortOpenedUpdate {
    const UPDATE_TYPE: UpdateType = UpdateType::IoPortOpened;

    fn write_body(&self, w: &mut BufferWriter) {
        w.write_u32(self.port);
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            port: r.read_u32()?,
        })
    }
}

/// A reserved update kind carrying no payload. Logged and otherwise ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndefinedUpdate;

impl Update for UndefinedUpdate {
    const UPDATE_TYPE: UpdateType = UpdateType::Undefined;

    fn write_body(&self, _w: &mut BufferWriter) {}

    fn read_body(_r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn all_threads_stopped_roundtrip() {
        let update = AllThreadsStoppedUpdate {
            primary_thread_index: 0,
            stop_reason: StopReason::Normal,
            stop_reason_detail: String::new(),
        };

        let buf = update.to_buffer();
        let decoded = AllThreadsStoppedUpdate::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value, update);
        assert_eq!(decoded.consumed, buf.len());
    }

    #[test]
    fn split_delivery_is_short_read_then_success() {
        let update = AllThreadsStoppedUpdate {
            primary_thread_index: 0,
            stop_reason: StopReason::RuntimeError,
            stop_reason_detail: "Type Mismatch.".to_string(),
        };
        let buf = update.to_buffer();
        let split = buf.len() / 2;

        let err = AllThreadsStoppedUpdate::from_buffer(&buf[..split]).unwrap_err();
        assert!(err.is_recoverable());

        let decoded = AllThreadsStoppedUpdate::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value, update);
    }

    #[test]
    fn io_port_opened_roundtrip() {
        let update = IoPortOpenedUpdate { port: 8085 };
        let buf = update.to_buffer();
        let decoded = IoPortOpenedUpdate::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value, update);
    }
}
