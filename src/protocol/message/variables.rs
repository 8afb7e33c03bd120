//! Fetching variables in scope at a stack frame.

use super::{Request, Response};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codes::{CommandCode, VariableType};
use crate::protocol::error::ProtocolError;

const FLAG_GET_CHILD_KEYS: u8 = 0x1;

/// Fetch a variable (and optionally its children) by path.
///
/// `path` is a sequence of names descending from the frame's locals, e.g.
/// `["m", "top"]` to reach `m.top`. An empty path fetches the frame's own
/// locals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablesRequest {
    /// If true, also return one level of child variables for container
    /// values (objects, arrays, associative arrays).
    pub get_child_keys: bool,
    /// Index of the thread whose stack frame is being inspected.
    pub thread_index: u32,
    /// Index of the stack frame, `0` being the innermost.
    pub stack_frame_index: u32,
    /// Dotted path to the variable, empty for the frame's locals.
    pub path: Vec<String>,
}

impl Request for VariablesRequest {
    const COMMAND: CommandCode = CommandCode::Variables;

    fn write_body(&self, w: &mut BufferWriter) {
        let flags = if self.get_child_keys {
            FLAG_GET_CHILD_KEYS
        } else {
            0
        };

        w.write_u8(flags);
        w.write_u32(self.thread_index);
        w.write_u32(self.stack_frame_index);
        w.write_u32(self.path.len() as u32);
        for entry in &self.path {
            w.write_cstring(entry);
        }
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        let flags = r.read_u8()?;
        let thread_index = r.read_u32()?;
        let stack_frame_index = r.read_u32()?;
        let path_len = r.read_u32()?;
        let mut path = Vec::with_capacity(path_len as usize);
        for _ in 0..path_len {
            path.push(r.read_cstring()?);
        }

        Ok(Self {
            get_child_keys: flags & FLAG_GET_CHILD_KEYS != 0,
            thread_index,
            stack_frame_index,
            path,
        })
    }
}

/// A single decoded variable. Values are always the device's own
/// stringified representation — this protocol never performs expression
/// evaluation or structured value decomposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableEntry {
    /// The variable's name.
    pub name: String,
    /// The dynamic type of the value.
    pub variable_type: VariableType,
    /// The stringified value.
    pub value: String,
    /// Whether this value may have children (implied by `variable_type`, but
    /// carried explicitly on the wire).
    pub is_container: bool,
}

/// Reply to [`VariablesRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariablesResponse {
    /// The requested variable, plus any children if `get_child_keys` was set.
    pub variables: Vec<VariableEntry>,
}

impl Response for VariablesResponse {
    fn write_body(&self, w: &mut BufferWriter) {
        w.write_u32(self.variables.len() as u32);
        for v in &self.variables {
            w.write_cstring(&v.name);
            w.write_u8(v.variable_type as u8);
            w.write_cstring(&v.value);
            w.write_bool(v.is_container);
        }
    }

    fn read_body(r: &mut BufferReader<'_>) -> Result<Self, ProtocolError> {
        let count = r.read_u32()?;
        let mut variables = Vec::with_capacity(count as usize);
        for _ in 0..count {
            variables.push(VariableEntry {
                name: r.read_cstring()?,
                variable_type: r.read_enum_u8("variable_type")?,
                value: r.read_cstring()?,
                is_container: r.read_bool()?,
            });
        }

        Ok(Self { variables })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::codes::ErrorCode;

    #[test]
    fn variables_request_body_matches_spec_example() {
        let req = VariablesRequest {
            get_child_keys: true,
            thread_index: 1,
            stack_frame_index: 0,
            path: vec!["m".to_string(), "top".to_string()],
        };

        let buf = req.to_buffer(6);
        let decoded = VariablesRequest::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.0, 6);
        assert_eq!(decoded.value.1, req);

        // header(12) + flags(1) + thread(4) + frame(4) + path_len(4)
        // + "m\0"(2) + "top\0"(4)
        assert_eq!(buf.len(), 12 + 1 + 4 + 4 + 4 + 2 + 4);
    }

    #[test]
    fn variables_response_roundtrip() {
        let reply = VariablesResponse {
            variables: vec![VariableEntry {
                name: "top".to_string(),
                variable_type: VariableType::Object,
                value: "<Component: roSGNode:Group>".to_string(),
                is_container: true,
            }],
        };

        let buf = reply.to_buffer(6, ErrorCode::Ok);
        let decoded = VariablesResponse::from_buffer(&buf).unwrap();
        assert_eq!(decoded.value.body.unwrap(), reply);
    }
}
