//! Execution-control requests: stop, continue, step and exit.
//!
//! All four share the same empty-bodied [`AckResponse`] — the device has
//! nothing to report beyond the common header's `error_code`.

use super::{Request, Response};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codes::{CommandCode, StepType};
use crate::protocol::error::ProtocolError;

/// Suspend the running thread(s). Also used to implement `pause`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopRequest;

impl Request for StopRequest {
    const COMMAND: CommandCode = CommandCode::Stop;

    fn write_body(&self, _w: &mut BufferWriter) {}

    fn read_body(_r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// Resume execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinueRequest;

impl Request for ContinueRequest {
    const COMMAND: CommandCode = CommandCode::Continue;

    fn write_body(&self, _w: &mut BufferWriter) {}

    fn read_body(_r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// Single-step a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRequest {
    /// Index of the thread to step.
    pub thread_index: u32,
    /// Granularity of the step.
    pub step_type: StepType,
}

impl Request for StepRequest {
    const COMMAND: CommandCode = CommandCode::Step;

    fn write_body(&self, w: &mut BufferWriter) {
        w.write_u32(self.thread_index);
        w.write_u8(self.step_type as u8);
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            thread_index: r.read_u32()?,
            step_type: r.read_enum_u8("step_type")?,
        })
    }
}

/// Terminate the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitChannelRequest;

impl Request for ExitChannelRequest {
    const COMMAND: CommandCode = CommandCode::ExitChannel;

    fn write_body(&self, _w: &mut BufferWriter) {}

    fn read_body(_r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// An empty-bodied response, shared by every execution-control request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckResponse;

impl Response for AckResponse {
    fn write_body(&self, _w: &mut BufferWriter) {}

    fn read_body(_r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::codes::ErrorCode;

    #[test]
    fn stop_request_roundtrip() {
        let buf = StopRequest.to_buffer(7);
        let decoded = StopRequest::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.0, 7);
        assert_eq!(decoded.consumed, buf.len());
    }

    #[test]
    fn step_request_roundtrip() {
        let req = StepRequest {
            thread_index: 2,
            step_type: StepType::Over,
        };
        let buf = req.to_buffer(5);
        let decoded = StepRequest::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.1, req);
    }

    #[test]
    fn ack_response_roundtrip() {
        let buf = AckResponse.to_buffer(5, ErrorCode::Ok);
        let decoded = AckResponse::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.request_id, 5);
        assert_eq!(decoded.value.error_code, ErrorCode::Ok);
        assert!(decoded.value.body.is_some());
    }

    #[test]
    fn ack_response_error_has_no_body() {
        let buf = AckResponse.to_buffer(5, ErrorCode::NotStopped);
        let decoded = AckResponse::from_buffer(&buf).unwrap();
        assert!(decoded.value.body.is_none());
    }
}
