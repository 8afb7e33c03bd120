//! The session's background I/O thread.
//!
//! One dedicated thread runs a `mio::Poll` loop exclusively owning the
//! control-channel socket and the session's mutable state — handshake
//! status, the pending-request table, and the stopped/running flag. Callers
//! get a [`SessionHandle`], a small `Clone`-able façade that hands requests
//! to the reactor thread and awaits their replies via a oneshot channel.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use futures::channel::oneshot;
use futures::task::ArcWake;
use log::{debug, error, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use super::io_port::IoPortConnector;
use super::SessionError;
use crate::protocol::{
    AllThreadsStoppedUpdate, ContinueRequest, ExitChannelRequest, HandshakeResponseV3,
    IoPortOpenedUpdate, Request, Response, StackTraceRequest, StackTraceResponse, StepRequest,
    StopRequest, ThreadAttachedUpdate, ThreadsRequest, ThreadsResponse, Update, UndefinedUpdate,
    VariablesRequest, VariablesResponse,
};
use crate::protocol::{CommandCode, ErrorCode, ProtocolError, StopReason};

const SOCKET: Token = Token(0);
const WAKE: Token = Token(1);

struct Waker(mio::Waker);

impl ArcWake for Waker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Err(e) = arc_self.0.wake() {
            warn!("failed to wake reactor: {e}");
        }
    }
}

/// A decoded response body, tagged by which request it answers. The pending
/// request's stored [`CommandCode`] tells the reactor which variant to
/// produce.
#[derive(Debug)]
pub enum ResponsePayload {
    /// Reply to stop/continue/step/exitChannel.
    Ack,
    /// Reply to a threads request.
    Threads(ThreadsResponse),
    /// Reply to a stack-trace request.
    StackTrace(StackTraceResponse),
    /// Reply to a variables request.
    Variables(VariablesResponse),
}

type ReplyTx = oneshot::Sender<Result<ResponsePayload, SessionError>>;

struct PendingRequest {
    command: CommandCode,
    reply: ReplyTx,
}

/// Events the session surfaces to the caller outside of request/response
/// correlation: stops, thread attaches, and I/O-port connections.
pub enum SessionEvent {
    /// Execution stopped (after the first-run-continue quirk has fired).
    Stopped {
        /// The device's primary thread, now stopped.
        primary_thread_index: i32,
        /// Why it stopped.
        stop_reason: StopReason,
        /// Human-readable detail.
        detail: String,
    },
    /// A new thread attached and is stopped.
    ThreadAttached {
        /// The newly attached thread.
        thread_index: i32,
        /// Why it's stopped.
        stop_reason: StopReason,
        /// Human-readable detail.
        detail: String,
    },
    /// The I/O port connected; raw program output is available for the
    /// caller's own line-reassembly.
    IoPortConnected(Box<dyn Read + Send>),
    /// The control-channel connection was lost. No further requests will
    /// complete; any in-flight ones have already been rejected.
    ConnectionLost,
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Stopped {
                primary_thread_index,
                stop_reason,
                ..
            } => f
                .debug_struct("Stopped")
                .field("primary_thread_index", primary_thread_index)
                .field("stop_reason", stop_reason)
                .finish(),
            SessionEvent::ThreadAttached {
                thread_index,
                stop_reason,
                ..
            } => f
                .debug_struct("ThreadAttached")
                .field("thread_index", thread_index)
                .field("stop_reason", stop_reason)
                .finish(),
            SessionEvent::IoPortConnected(_) => write!(f, "IoPortConnected(..)"),
            SessionEvent::ConnectionLost => write!(f, "ConnectionLost"),
        }
    }
}

struct SessionState {
    handshake_complete: bool,
    protocol_version: (u32, u32, u32),
    stopped: bool,
    first_run_continue_fired: bool,
    primary_thread_index: i32,
    active_requests: BTreeMap<u32, PendingRequest>,
    terminated: bool,
}

struct SharedState {
    next_request_id: AtomicU32,
}

/// A cheap, `Clone`-able handle to a running session. All state lives behind
/// the reactor thread; cloning a handle never clones the connection.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<Mutex<SessionState>>,
    shared: Arc<SharedState>,
    outgoing: mpsc::Sender<Vec<u8>>,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SessionHandle")
            .field("handshake_complete", &state.handshake_complete)
            .field("stopped", &state.stopped)
            .field("protocol_version", &state.protocol_version)
            .finish()
    }
}

impl SessionHandle {
    /// The negotiated protocol version, valid once the handshake completes.
    pub fn protocol_version(&self) -> (u32, u32, u32) {
        self.state.lock().unwrap().protocol_version
    }

    /// Whether the device is currently stopped (paused).
    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    fn next_request_id(&self) -> u32 {
        self.shared.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn send_request<Req: Request>(
        &self,
        req: Req,
    ) -> Result<oneshot::Receiver<Result<ResponsePayload, SessionError>>, SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.terminated {
            return Err(SessionError::ConnectionLost);
        }

        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        state.active_requests.insert(
            id,
            PendingRequest {
                command: Req::COMMAND,
                reply: tx,
            },
        );
        drop(state);

        let buf = req.to_buffer(id);
        self.outgoing
            .send(buf)
            .map_err(|_| SessionError::ConnectionLost)?;
        ArcWake::wake_by_ref(&self.waker);

        Ok(rx)
    }

    async fn roundtrip<Req: Request>(&self, req: Req) -> Result<ResponsePayload, SessionError> {
        let rx = self.send_request(req)?;
        rx.await.map_err(|_| SessionError::ConnectionLost)?
    }

    fn check_stopped_gate(&self) -> Result<(), SessionError> {
        if self.state.lock().unwrap().stopped {
            Ok(())
        } else {
            Err(SessionError::NotStopped)
        }
    }

    /// Resume execution. Valid only while stopped.
    pub async fn continue_(&self) -> Result<(), SessionError> {
        self.check_stopped_gate()?;
        self.roundtrip(ContinueRequest).await?;
        Ok(())
    }

    /// Suspend execution. Valid only while running.
    pub async fn pause(&self) -> Result<(), SessionError> {
        if self.state.lock().unwrap().stopped {
            return Err(SessionError::AlreadyStopped);
        }
        self.roundtrip(StopRequest).await?;
        Ok(())
    }

    /// Single-step the given thread. Valid only while stopped.
    pub async fn step(&self, thread_index: u32, step_type: crate::protocol::StepType) -> Result<(), SessionError> {
        self.check_stopped_gate()?;
        self.roundtrip(StepRequest {
            thread_index,
            step_type,
        })
        .await?;
        Ok(())
    }

    /// List running threads. Valid only while stopped.
    pub async fn threads(&self) -> Result<ThreadsResponse, SessionError> {
        self.check_stopped_gate()?;
        match self.roundtrip(ThreadsRequest).await? {
            ResponsePayload::Threads(r) => Ok(r),
            other => Err(SessionError::unexpected_reply("ThreadsResponse", &other)),
        }
    }

    /// Fetch a thread's stack trace. Valid only while stopped.
    pub async fn stack_trace(&self, thread_index: u32) -> Result<StackTraceResponse, SessionError> {
        self.check_stopped_gate()?;
        match self.roundtrip(StackTraceRequest { thread_index }).await? {
            ResponsePayload::StackTrace(r) => Ok(r),
            other => Err(SessionError::unexpected_reply("StackTraceResponse", &other)),
        }
    }

    /// Fetch variables by path. Valid only while stopped.
    pub async fn get_variables(
        &self,
        path: Vec<String>,
        get_child_keys: bool,
        thread_index: u32,
        stack_frame_index: u32,
    ) -> Result<VariablesResponse, SessionError> {
        self.check_stopped_gate()?;
        let req = VariablesRequest {
            get_child_keys,
            thread_index,
            stack_frame_index,
            path,
        };
        match self.roundtrip(req).await? {
            ResponsePayload::Variables(r) => Ok(r),
            other => Err(SessionError::unexpected_reply("VariablesResponse", &other)),
        }
    }

    /// Terminate the channel. Unconditional, regardless of run state.
    pub async fn exit_channel(&self) -> Result<(), SessionError> {
        self.roundtrip(ExitChannelRequest).await?;
        Ok(())
    }
}

/// Connects to the device's control channel at `addr`, performs the
/// blocking handshake, and spawns the background reactor thread.
///
/// Returns a handle for issuing requests and a receiver for out-of-band
/// [`SessionEvent`]s (stops, thread attaches, I/O-port connects).
pub fn connect(
    addr: impl ToSocketAddrs,
    magic: &[u8],
    io_port_connector: Arc<dyn IoPortConnector>,
) -> io::Result<(SessionHandle, mpsc::Receiver<SessionEvent>, JoinHandle<()>)> {
    let mut sock = StdTcpStream::connect(addr)?;
    sock.set_nodelay(true)?;

    sock.write_all(magic)?;

    let protocol_version = blocking_read_handshake(&mut sock)?;
    sock.set_nonblocking(true)?;

    let mio_socket = TcpStream::from_std(sock);
    let poll = Poll::new()?;
    let waker = Arc::new(Waker(mio::Waker::new(poll.registry(), WAKE)?));

    let (outgoing_tx, outgoing_rx) = mpsc::channel();
    let (events_tx, events_rx) = mpsc::channel();

    let state = Arc::new(Mutex::new(SessionState {
        handshake_complete: true,
        protocol_version,
        stopped: false,
        first_run_continue_fired: false,
        primary_thread_index: -1,
        active_requests: BTreeMap::new(),
        terminated: false,
    }));

    let shared = Arc::new(SharedState {
        next_request_id: AtomicU32::new(1),
    });

    let handle = SessionHandle {
        state: state.clone(),
        shared: shared.clone(),
        outgoing: outgoing_tx.clone(),
        waker: waker.clone(),
    };

    let mut reactor = Reactor {
        socket: mio_socket,
        poll,
        waker,
        state,
        shared,
        outgoing: outgoing_rx,
        outgoing_queue: Vec::new(),
        events: events_tx,
        unhandled_bytes: Vec::new(),
        read_buf: vec![0u8; 64 * 1024],
        io_port_connector,
    };

    let join = thread::Builder::new()
        .name("bsdebug-session".to_string())
        .spawn(move || reactor.run())
        .expect("failed to spawn session reactor thread");

    Ok((handle, events_rx, join))
}

fn blocking_read_handshake(sock: &mut StdTcpStream) -> io::Result<(u32, u32, u32)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match HandshakeResponseV3::from_buffer(&buf) {
            Ok(decoded) => {
                if decoded.value.error_code != ErrorCode::Ok {
                    return Err(io::Error::new(
                        ErrorKind::InvalidData,
                        "handshake rejected by device",
                    ));
                }

                let reply = decoded.value.body.ok_or_else(|| {
                    io::Error::new(ErrorKind::InvalidData, "handshake reply missing body")
                })?;

                return Ok((reply.major, reply.minor, reply.patch));
            }
            Err(ProtocolError::ShortRead) => {
                let n = sock.read(&mut chunk)?;
                if n == 0 {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => return Err(io::Error::new(ErrorKind::InvalidData, e.to_string())),
        }
    }
}

struct Reactor {
    socket: TcpStream,
    poll: Poll,
    waker: Arc<Waker>,
    state: Arc<Mutex<SessionState>>,
    shared: Arc<SharedState>,
    outgoing: mpsc::Receiver<Vec<u8>>,
    outgoing_queue: Vec<u8>,
    events: mpsc::Sender<SessionEvent>,
    unhandled_bytes: Vec<u8>,
    read_buf: Vec<u8>,
    io_port_connector: Arc<dyn IoPortConnector>,
}

impl Reactor {
    fn run(&mut self) {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut self.socket, SOCKET, Interest::READABLE | Interest::WRITABLE)
        {
            error!("failed to register session socket: {e}");
            return;
        }

        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("session poll error: {e}");
                self.terminate();
                return;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE => self.drain_outgoing(),
                    SOCKET => {
                        if event.is_readable() && !self.recv() {
                            return;
                        }
                    }
                    _ => {}
                }
            }

            self.drain_outgoing();
            if self.write_pending().is_err() {
                return;
            }

            if self.state.lock().unwrap().terminated {
                return;
            }
        }
    }

    fn drain_outgoing(&mut self) {
        while let Ok(bytes) = self.outgoing.try_recv() {
            self.outgoing_queue.extend_from_slice(&bytes);
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        while !self.outgoing_queue.is_empty() {
            match self.socket.write(&self.outgoing_queue) {
                Ok(0) => {
                    self.terminate();
                    return Err(io::Error::new(ErrorKind::WriteZero, "socket closed"));
                }
                Ok(n) => {
                    self.outgoing_queue.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.terminate();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Reads available bytes and feeds them to `parse`. Returns `false` if
    /// the connection ended and the reactor should stop.
    fn recv(&mut self) -> bool {
        loop {
            match self.socket.read(&mut self.read_buf) {
                Ok(0) => {
                    self.terminate();
                    return false;
                }
                Ok(n) => {
                    trace!("session read {n} bytes");
                    self.unhandled_bytes.extend_from_slice(&self.read_buf[..n]);
                    self.parse();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) => {
                    error!("session read error: {e}");
                    self.terminate();
                    return false;
                }
            }
        }
    }

    /// Implements the `parse` contract from the session state machine:
    /// repeatedly try each decoder in priority order until none succeeds.
    fn parse(&mut self) {
        loop {
            if self.try_dispatch_response() {
                continue;
            }
            if self.try_dispatch_update() {
                continue;
            }
            break;
        }
    }

    fn try_dispatch_response(&mut self) -> bool {
        // We don't know the response's exact shape until we know which
        // request it's answering, so peek the shared header fields first.
        let (request_id, error_code, command) = {
            let mut state = self.state.lock().unwrap();
            match peek_response_header(&self.unhandled_bytes) {
                Some((id, ec)) => match state.active_requests.get(&id) {
                    Some(pending) => (id, ec, pending.command),
                    None => {
                        drop(state);
                        self.protocol_violation(SessionError::UnknownRequestId(id));
                        return false;
                    }
                },
                None => return false,
            }
        };

        // The body is only present when `error_code == Ok`; on an error
        // reply we still need the frame's consumed length so we can drop it
        // from `unhandled_bytes`, just with no payload to hand back.
        let dispatch_result = match command {
            CommandCode::Stop | CommandCode::Continue | CommandCode::Step | CommandCode::ExitChannel => {
                decode_ack(&self.unhandled_bytes)
                    .map(|opt| opt.map(|(consumed, _)| (consumed, Some(ResponsePayload::Ack))))
            }
            CommandCode::Threads => decode_typed::<ThreadsResponse>(&self.unhandled_bytes).map(
                |opt| opt.map(|(consumed, body)| (consumed, body.map(ResponsePayload::Threads))),
            ),
            CommandCode::StackTrace => {
                decode_typed::<StackTraceResponse>(&self.unhandled_bytes).map(|opt| {
                    opt.map(|(consumed, body)| (consumed, body.map(ResponsePayload::StackTrace)))
                })
            }
            CommandCode::Variables => {
                decode_typed::<VariablesResponse>(&self.unhandled_bytes).map(|opt| {
                    opt.map(|(consumed, body)| (consumed, body.map(ResponsePayload::Variables)))
                })
            }
        };

        match dispatch_result {
            Ok(Some((consumed, payload))) => {
                self.unhandled_bytes.drain(..consumed);
                let mut state = self.state.lock().unwrap();
                if let Some(pending) = state.active_requests.remove(&request_id) {
                    let result = if error_code == ErrorCode::Ok {
                        payload.ok_or_else(|| {
                            SessionError::Protocol(ProtocolError::Invalid(
                                "response declared Ok but carried no body".to_string(),
                            ))
                        })
                    } else {
                        Err(SessionError::Protocol(ProtocolError::PeerError(error_code)))
                    };
                    let _ = pending.reply.send(result);
                }
                true
            }
            Ok(None) => false,
            Err(ProtocolError::ShortRead) => false,
            Err(e) => {
                warn!("dropping malformed response frame: {e}");
                // Consumed length is unknown; we can't safely resync, so we
                // treat this as fatal per the session's desynchronization
                // policy for header-level corruption.
                self.protocol_violation(SessionError::Protocol(e));
                false
            }
        }
    }

    fn try_dispatch_update(&mut self) -> bool {
        if let Ok(decoded) = AllThreadsStoppedUpdate::from_buffer(&self.unhandled_bytes) {
            self.unhandled_bytes.drain(..decoded.consumed);
            self.handle_stopped(decoded.value);
            return true;
        }

        if let Ok(decoded) = ThreadAttachedUpdate::from_buffer(&self.unhandled_bytes) {
            self.unhandled_bytes.drain(..decoded.consumed);
            let update = decoded.value;
            let _ = self.events.send(SessionEvent::ThreadAttached {
                thread_index: update.thread_index,
                stop_reason: update.stop_reason,
                detail: update.stop_reason_detail,
            });
            return true;
        }

        if let Ok(decoded) = UndefinedUpdate::from_buffer(&self.unhandled_bytes) {
            self.unhandled_bytes.drain(..decoded.consumed);
            debug!("ignoring undefined update frame");
            return true;
        }

        if let Ok(decoded) = IoPortOpenedUpdate::from_buffer(&self.unhandled_bytes) {
            self.unhandled_bytes.drain(..decoded.consumed);
            match self.io_port_connector.connect(decoded.value.port) {
                Ok(stream) => {
                    let _ = self.events.send(SessionEvent::IoPortConnected(stream));
                }
                Err(e) => warn!("failed to connect to io port {}: {e}", decoded.value.port),
            }
            return true;
        }

        false
    }

    fn handle_stopped(&mut self, update: AllThreadsStoppedUpdate) {
        let mut state = self.state.lock().unwrap();
        if !state.first_run_continue_fired {
            state.first_run_continue_fired = true;
            state.stopped = false;

            // The continue we issue here has no caller waiting on it; we use
            // a oneshot whose receiver we immediately drop, so the reply is
            // simply discarded once it arrives.
            let (tx, _rx) = oneshot::channel();
            let id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
            state.active_requests.insert(
                id,
                PendingRequest {
                    command: CommandCode::Continue,
                    reply: tx,
                },
            );
            drop(state);

            trace!("swallowing first-run stop, issuing continue");
            self.outgoing_queue
                .extend_from_slice(&ContinueRequest.to_buffer(id));
            return;
        }

        state.stopped = true;
        state.primary_thread_index = update.primary_thread_index;
        drop(state);

        let _ = self.events.send(SessionEvent::Stopped {
            primary_thread_index: update.primary_thread_index,
            stop_reason: update.stop_reason,
            detail: update.stop_reason_detail,
        });
    }

    fn protocol_violation(&mut self, err: SessionError) {
        error!("session protocol violation: {err}");
        self.terminate();
    }

    fn terminate(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.terminated {
            return;
        }
        state.terminated = true;
        for (_, pending) in std::mem::take(&mut state.active_requests) {
            let _ = pending.reply.send(Err(SessionError::ConnectionLost));
        }
        drop(state);

        let _ = self.socket.shutdown(std::net::Shutdown::Both);

        let _ = self.events.send(SessionEvent::ConnectionLost);
    }
}

#[cfg(test)]
mod tests {
    //! These drive a real loopback socket with a hand-scripted "device" on
    //! the other end, exercising the reactor thread exactly as it runs in
    //! production rather than calling its internals directly.

    use std::net::TcpListener as StdTcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::executor::block_on;

    use super::*;
    use crate::client::io_port::test_util::FakeIoPortConnector;
    use crate::protocol::{
        encode_handshake_response, AckResponse, AllThreadsStoppedUpdate, ContinueRequest,
        HandshakeResponseV3, Request, Response, StopReason, Update,
    };

    fn read_exact_blocking(sock: &mut std::net::TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        sock.read_exact(&mut buf).expect("read from client");
        buf
    }

    #[test_log::test]
    fn first_run_continue_is_swallowed_then_real_stop_is_surfaced() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let device = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            // Handshake: 8-byte magic in, versioned reply out.
            let _magic = read_exact_blocking(&mut sock, crate::protocol::HANDSHAKE_MAGIC.len());
            let reply = HandshakeResponseV3::current(1_700_000_000);
            sock.write_all(&encode_handshake_response(&reply)).unwrap();

            // The device boots into the debugger: first stop is swallowed by
            // the client's first-run-continue quirk.
            let boot_stop = AllThreadsStoppedUpdate {
                primary_thread_index: 0,
                stop_reason: StopReason::Normal,
                stop_reason_detail: String::new(),
            };
            sock.write_all(&boot_stop.to_buffer()).unwrap();

            // The client should respond with exactly one Continue request;
            // read its 12-byte empty-bodied frame and ack it.
            let header = read_exact_blocking(&mut sock, 4);
            let packet_length = u32::from_le_bytes(header.clone().try_into().unwrap()) as usize;
            let rest = read_exact_blocking(&mut sock, packet_length - 4);
            let mut full = header;
            full.extend_from_slice(&rest);
            let decoded = ContinueRequest::from_buffer(&full).expect("decode continue request");
            let (request_id, _) = decoded.value;
            sock.write_all(&AckResponse.to_buffer(request_id, ErrorCode::Ok))
                .unwrap();

            // A later, real stop must be surfaced to the caller.
            let real_stop = AllThreadsStoppedUpdate {
                primary_thread_index: 2,
                stop_reason: StopReason::Break,
                stop_reason_detail: "breakpoint 1".to_string(),
            };
            sock.write_all(&real_stop.to_buffer()).unwrap();

            // Keep the connection open until the test is done with it.
            std::thread::sleep(Duration::from_millis(200));
        });

        let connector: Arc<dyn crate::client::IoPortConnector> =
            Arc::new(FakeIoPortConnector::new(Vec::new()));
        let (handle, events, _join) =
            connect(addr, crate::protocol::HANDSHAKE_MAGIC, connector).expect("connect");

        assert_eq!(handle.protocol_version(), (3, 1, 0));

        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("a session event");
        match event {
            SessionEvent::Stopped {
                primary_thread_index,
                stop_reason,
                detail,
            } => {
                assert_eq!(primary_thread_index, 2);
                assert_eq!(stop_reason, StopReason::Break);
                assert_eq!(detail, "breakpoint 1");
            }
            other => panic!("expected Stopped, got {other:?}"),
        }

        assert!(handle.is_stopped());
        device.join().unwrap();
    }

    #[test_log::test]
    fn stopped_gated_command_fails_fast_while_running() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let device = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _magic = read_exact_blocking(&mut sock, crate::protocol::HANDSHAKE_MAGIC.len());
            let reply = HandshakeResponseV3::current(0);
            sock.write_all(&encode_handshake_response(&reply)).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        let connector: Arc<dyn crate::client::IoPortConnector> =
            Arc::new(FakeIoPortConnector::new(Vec::new()));
        let (handle, _events, _join) =
            connect(addr, crate::protocol::HANDSHAKE_MAGIC, connector).expect("connect");

        assert!(!handle.is_stopped());
        let err = block_on(handle.threads()).unwrap_err();
        assert!(matches!(err, SessionError::NotStopped));

        device.join().unwrap();
    }

    #[test_log::test]
    fn unknown_request_id_terminates_the_session() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let device = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _magic = read_exact_blocking(&mut sock, crate::protocol::HANDSHAKE_MAGIC.len());
            let reply = HandshakeResponseV3::current(0);
            sock.write_all(&encode_handshake_response(&reply)).unwrap();

            // exit_channel's request id is 1; answer a request id the client
            // never issued.
            let _req = read_exact_blocking(&mut sock, 12);
            sock.write_all(&AckResponse.to_buffer(99, ErrorCode::Ok))
                .unwrap();

            std::thread::sleep(Duration::from_millis(200));
        });

        let connector: Arc<dyn crate::client::IoPortConnector> =
            Arc::new(FakeIoPortConnector::new(Vec::new()));
        let (handle, events, _join) =
            connect(addr, crate::protocol::HANDSHAKE_MAGIC, connector).expect("connect");

        // The device never answers request id 1, only the bogus id 99, so
        // this resolves once the session terminates and rejects every
        // pending reply with `ConnectionLost`.
        let result = block_on(handle.exit_channel());
        assert!(matches!(result, Err(SessionError::ConnectionLost)));

        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("a session event");
        assert!(matches!(event, SessionEvent::ConnectionLost));

        device.join().unwrap();
    }
}

fn peek_response_header(buf: &[u8]) -> Option<(u32, ErrorCode)> {
    use crate::protocol::BufferReader;
    use num_traits::FromPrimitive;

    if buf.len() < 4 {
        return None;
    }
    let packet_length = BufferReader::new(&buf[0..4]).read_u32().ok()? as usize;
    if buf.len() < packet_length || packet_length < 12 {
        return None;
    }

    let mut r = BufferReader::new(&buf[4..12]);
    let request_id = r.read_u32().ok()?;
    if request_id == 0 {
        // request_id 0 is reserved for update frames; never a response.
        return None;
    }
    let error_code = r.read_u32().ok()?;
    Some((request_id, ErrorCode::from_u32(error_code)?))
}

/// Decodes a frame whose body is shared/ignored regardless of `error_code`.
/// Returns the consumed length once a full frame is present, even on an
/// error reply.
fn decode_ack(buf: &[u8]) -> Result<Option<(usize, ())>, ProtocolError> {
    match crate::protocol::AckResponse::from_buffer(buf) {
        Ok(decoded) => Ok(Some((decoded.consumed, ()))),
        Err(ProtocolError::ShortRead) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decodes a typed response frame. Returns the consumed length alongside the
/// body, which is `None` on an error reply (the frame is still fully
/// consumed either way).
fn decode_typed<T: Response>(buf: &[u8]) -> Result<Option<(usize, Option<T>)>, ProtocolError> {
    match T::from_buffer(buf) {
        Ok(decoded) => Ok(Some((decoded.consumed, decoded.value.body))),
        Err(ProtocolError::ShortRead) => Ok(None),
        Err(e) => Err(e),
    }
}
