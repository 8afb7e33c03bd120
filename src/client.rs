//! The control-channel client: handshake, request bookkeeping, and the
//! stopped-gated debugging operations built on top of [`reactor`].

pub mod io_port;
mod reactor;

use std::net::ToSocketAddrs;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use thiserror::Error;

pub use io_port::{IoPortConnector, TcpIoPortConnector};
pub use reactor::{ResponsePayload, SessionEvent, SessionHandle};

use crate::protocol::{ProtocolError, StepType};

/// Errors surfaced by the client-side session state machine, layered on top
/// of [`ProtocolError`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// A frame failed to decode or encode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A stopped-gated command was issued while the device is running.
    #[error("command requires the device to be stopped")]
    NotStopped,

    /// `pause` was issued while the device is already stopped.
    #[error("pause requested but the device is already stopped")]
    AlreadyStopped,

    /// A response referred to a request id this session never issued.
    #[error("response referred to unknown request id {0}")]
    UnknownRequestId(u32),

    /// The control-channel connection was lost.
    #[error("connection to device lost")]
    ConnectionLost,

    /// A response decoded successfully but didn't match the request's
    /// expected reply shape — this should be unreachable in a conformant
    /// session and indicates a desynchronized request table.
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        /// The reply shape the caller expected.
        expected: &'static str,
        /// Debug-formatted actual payload received.
        actual: String,
    },
}

impl SessionError {
    pub(crate) fn unexpected_reply(expected: &'static str, actual: &ResponsePayload) -> Self {
        SessionError::UnexpectedReply {
            expected,
            actual: format!("{actual:?}"),
        }
    }
}

/// A live connection to the device's debugger control channel.
///
/// Wraps a [`SessionHandle`] with the default magic and a real TCP
/// [`IoPortConnector`]; `Clone`s share the same underlying connection and
/// background thread.
#[derive(Clone)]
pub struct Session {
    handle: SessionHandle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("handle", &self.handle).finish()
    }
}

impl Session {
    /// Connects to the device's control channel at `addr`, performing the
    /// handshake with the standard `bsdebug` magic and a real
    /// [`TcpIoPortConnector`] pointed at the same host.
    pub fn connect(
        addr: impl ToSocketAddrs + Clone,
    ) -> std::io::Result<(Self, mpsc::Receiver<SessionEvent>, JoinHandle<()>)> {
        let host = addr
            .clone()
            .to_socket_addrs()?
            .next()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());

        Self::connect_with(
            addr,
            crate::protocol::HANDSHAKE_MAGIC,
            Arc::new(TcpIoPortConnector::new(host)),
        )
    }

    /// Connects with an explicit handshake magic and [`IoPortConnector`],
    /// primarily for tests that want to substitute a fake connector.
    pub fn connect_with(
        addr: impl ToSocketAddrs,
        magic: &[u8],
        io_port_connector: Arc<dyn IoPortConnector>,
    ) -> std::io::Result<(Self, mpsc::Receiver<SessionEvent>, JoinHandle<()>)> {
        let (handle, events, join) = reactor::connect(addr, magic, io_port_connector)?;
        Ok((Self { handle }, events, join))
    }

    /// Returns a cheaply-cloneable handle sharing this session's connection.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> (u32, u32, u32) {
        self.handle.protocol_version()
    }

    /// Whether the device is currently stopped.
    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }

    /// Resume execution. Valid only while stopped.
    pub async fn continue_(&self) -> Result<(), SessionError> {
        self.handle.continue_().await
    }

    /// Suspend execution. Valid only while running.
    pub async fn pause(&self) -> Result<(), SessionError> {
        self.handle.pause().await
    }

    /// Single-step a thread. Valid only while stopped.
    pub async fn step(&self, thread_index: u32, step_type: StepType) -> Result<(), SessionError> {
        self.handle.step(thread_index, step_type).await
    }

    /// List running threads. Valid only while stopped.
    pub async fn threads(&self) -> Result<crate::protocol::ThreadsResponse, SessionError> {
        self.handle.threads().await
    }

    /// Fetch a thread's stack trace. Valid only while stopped.
    pub async fn stack_trace(
        &self,
        thread_index: u32,
    ) -> Result<crate::protocol::StackTraceResponse, SessionError> {
        self.handle.stack_trace(thread_index).await
    }

    /// Fetch variables by path. Valid only while stopped.
    pub async fn get_variables(
        &self,
        path: Vec<String>,
        get_child_keys: bool,
        thread_index: u32,
        stack_frame_index: u32,
    ) -> Result<crate::protocol::VariablesResponse, SessionError> {
        self.handle
            .get_variables(path, get_child_keys, thread_index, stack_frame_index)
            .await
    }

    /// Terminate the channel. Unconditional, regardless of run state.
    pub async fn exit_channel(&self) -> Result<(), SessionError> {
        self.handle.exit_channel().await
    }
}

#[cfg(all(test, feature = "_integration-tests"))]
mod tests {
    //! These tests require a real device (or the emulated server binary)
    //! listening on `BSDEBUG_CONTROL_ADDR` and are excluded from the default
    //! test run; the in-process scenarios in `server.rs` and `reactor.rs`
    //! cover the state machine without one.
    use super::*;

    #[tokio::test]
    async fn connects_and_lists_threads() -> anyhow::Result<()> {
        let addr = crate::config::control_addr_from_env();
        let (session, _events, _join) = Session::connect(addr)?;
        // The device starts running; wait for the first real stop.
        while !session.is_stopped() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let threads = session.threads().await?;
        assert!(!threads.threads.is_empty());
        Ok(())
    }
}
