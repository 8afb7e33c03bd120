//! Listing running threads.

use super::{Request, Response};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codes::{CommandCode, StopReason};
use crate::protocol::error::ProtocolError;

/// List the threads currently known to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadsRequest;

impl Request for ThreadsRequest {
    const COMMAND: CommandCode = CommandCode::Threads;

    fn write_body(&self, _w: &mut BufferWriter) {}

    fn read_body(_r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// One thread's summary: whether it's the primary thread, why it's stopped,
/// and its current top-of-stack location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    /// Whether this is the channel's primary (main) thread.
    pub is_primary: bool,
    /// Why this thread is stopped.
    pub stop_reason: StopReason,
    /// A human-readable detail for `stop_reason` (e.g. an error message).
    pub stop_reason_detail: String,
    /// Current line number, 1-based.
    pub line: u32,
    /// Enclosing function name.
    pub function_name: String,
    /// Source file path (`pkg:/...`).
    pub file_path: String,
}

/// Reply to [`ThreadsRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadsResponse {
    /// One entry per known thread.
    pub threads: Vec<ThreadEntry>,
}

impl Response for ThreadsResponse {
    fn write_body(&self, w: &mut BufferWriter) {
        w.write_u32(self.threads.len() as u32);
        for t in &self.threads {
            w.write_bool(t.is_primary);
            w.write_u8(t.stop_reason as u8);
            w.write_cstring(&t.stop_reason_detail);
            w.write_u32(t.line);
            w.write_cstring(&t.function_name);
            w.write_cstring(&t.file_path);
        }
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        let count = r.read_u32()?;
        let mut threads = Vec::with_capacity(count as usize);
        for _ in 0..count {
            threads.push(ThreadEntry {
                is_primary: r.read_bool()?,
                stop_reason: r.read_enum_u8("stop_reason")?,
                stop_reason_detail: r.read_cstring()?,
                line: r.read_u32()?,
                function_name: r.read_cstring()?,
                file_path: r.read_cstring()?,
            });
        }

        Ok(Self { threads })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::codes::ErrorCode;

    #[test]
    fn threads_response_roundtrip() {
        let reply = ThreadsResponse {
            threads: vec![
                ThreadEntry {
                    is_primary: true,
                    stop_reason: StopReason::Normal,
                    stop_reason_detail: String::new(),
                    line: 10,
                    function_name: "main".to_string(),
                    file_path: "pkg:/source/main.brs".to_string(),
                },
                ThreadEntry {
                    is_primary: false,
                    stop_reason: StopReason::Break,
                    stop_reason_detail: "breakpoint 1".to_string(),
                    line: 4,
                    function_name: "onTimer".to_string(),
                    file_path: "pkg:/source/timer.brs".to_string(),
                },
            ],
        };

        let buf = reply.to_buffer(3, ErrorCode::Ok);
        let decoded = ThreadsResponse::from_buffer(&buf).unwrap();
        assert_eq!(decoded.consumed, buf.len());
        assert_eq!(decoded.value.body.unwrap(), reply);
    }

    #[test]
    fn empty_threads_response() {
        let reply = ThreadsResponse::default();
        let buf = reply.to_buffer(1, ErrorCode::Ok);
        let decoded = ThreadsResponse::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.body.unwrap().threads.len(), 0);
    }
}
