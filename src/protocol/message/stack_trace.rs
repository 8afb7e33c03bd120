//! Fetching a single thread's stack trace.

use super::{Request, Response};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codes::CommandCode;
use crate::protocol::error::ProtocolError;

/// Fetch `thread_index`'s stack trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTraceRequest {
    /// Index of the thread whose stack is requested.
    pub thread_index: u32,
}

impl Request for StackTraceRequest {
    const COMMAND: CommandCode = CommandCode::StackTrace;

    fn write_body(&self, w: &mut BufferWriter) {
        w.write_u32(self.thread_index);
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            thread_index: r.read_u32()?,
        })
    }
}

/// One stack frame, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Line number within `file_path`, 1-based.
    pub line: u32,
    /// Enclosing function name.
    pub function_name: String,
    /// Source file path.
    pub file_path: String,
}

/// Reply to [`StackTraceRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTraceResponse {
    /// Frames, innermost (current) first.
    pub frames: Vec<StackFrame>,
}

impl Response for StackTraceResponse {
    fn write_body(&self, w: &mut BufferWriter) {
        w.write_u32(self.frames.len() as u32);
        for f in &self.frames {
            w.write_u32(f.line);
            w.write_cstring(&f.function_name);
            w.write_cstring(&f.file_path);
        }
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        let count = r.read_u32()?;
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            frames.push(StackFrame {
                line: r.read_u32()?,
                function_name: r.read_cstring()?,
                file_path: r.read_cstring()?,
            });
        }

        Ok(Self { frames })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::codes::ErrorCode;

    #[test]
    fn stack_trace_roundtrip() {
        let reply = StackTraceResponse {
            frames: vec![
                StackFrame {
                    line: 10,
                    function_name: "main".to_string(),
                    file_path: "pkg:/source/main.brs".to_string(),
                },
                StackFrame {
                    line: 20,
                    function_name: "foo".to_string(),
                    file_path: "pkg:/source/foo.brs".to_string(),
                },
            ],
        };

        let buf = reply.to_buffer(9, ErrorCode::Ok);
        let decoded = StackTraceResponse::from_buffer(&buf).unwrap();
        assert_eq!(decoded.consumed, buf.len());
        assert_eq!(decoded.value.body.unwrap(), reply);
    }

    #[test]
    fn stack_trace_request_roundtrip() {
        let req = StackTraceRequest { thread_index: 1 };
        let buf = req.to_buffer(4);
        let decoded = StackTraceRequest::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.0, 4);
        assert_eq!(decoded.value.1, req);
    }
}
