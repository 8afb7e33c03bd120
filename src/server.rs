//! An in-process emulated control-channel server.
//!
//! Real hardware is a single TCP listener that accepts at most one
//! connection, performs the handshake, and then answers each request with
//! whatever state the device happens to be in. For tests, we want the wire
//! behavior without the hardware: this module runs that same listener/
//! handshake/request-response loop against a real (loopback) socket, but
//! delegates "what does the device say" to a [`Plugin`] chain a test
//! registers up front — the same seam shape as [`crate::client::IoPortConnector`],
//! generalized from one substitutable method to a handful of named
//! lifecycle hooks modeled as a typed event bus: each hook is a plain
//! struct threaded through the registered plugins in order, each plugin
//! returning the (possibly modified) struct for the next.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::action_queue::{ActionFailed, ActionOutcome, ActionQueue};
use crate::protocol::{
    AckResponse, CommandCode, ContinueRequest, Decoded, ErrorCode, ExitChannelRequest,
    HandshakeResponseV3, ProtocolError, Request, Response, StackTraceRequest, StackTraceResponse,
    StepRequest, StopRequest, ThreadsRequest, ThreadsResponse, VariablesRequest, VariablesResponse,
};

/// A request the server has pulled a full frame for, with its body decoded
/// into whichever shape matches its command.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// The request id to echo back in the response.
    pub request_id: u32,
    /// Which command this is.
    pub command: CommandCode,
    /// The command-specific decoded body.
    pub detail: RequestDetail,
}

/// The decoded body of a [`ParsedRequest`], one variant per command.
#[derive(Debug, Clone)]
pub enum RequestDetail {
    /// `Stop` (also used to implement `pause`).
    Stop,
    /// `Continue`.
    Continue,
    /// `Step`.
    Step(StepRequest),
    /// `ExitChannel`.
    ExitChannel,
    /// `Threads`.
    Threads,
    /// `StackTrace`.
    StackTrace(StackTraceRequest),
    /// `Variables`.
    Variables(VariablesRequest),
}

/// A response a plugin hands back for a [`ParsedRequest`], paired with the
/// `error_code` to report (a body is only serialized when it's
/// [`ErrorCode::Ok`], matching [`Response::to_buffer`]).
#[derive(Debug, Clone)]
pub enum ServerResponse {
    /// Reply to stop/continue/step/exitChannel.
    Ack(ErrorCode),
    /// Reply to a threads request.
    Threads(ErrorCode, ThreadsResponse),
    /// Reply to a stack-trace request.
    StackTrace(ErrorCode, StackTraceResponse),
    /// Reply to a variables request.
    Variables(ErrorCode, VariablesResponse),
}

impl ServerResponse {
    fn to_buffer(&self, request_id: u32) -> Vec<u8> {
        match self {
            ServerResponse::Ack(ec) => AckResponse.to_buffer(request_id, *ec),
            ServerResponse::Threads(ec, r) => r.to_buffer(request_id, *ec),
            ServerResponse::StackTrace(ec, r) => r.to_buffer(request_id, *ec),
            ServerResponse::Variables(ec, r) => r.to_buffer(request_id, *ec),
        }
    }
}

fn default_response(command: CommandCode) -> ServerResponse {
    match command {
        CommandCode::Stop | CommandCode::Continue | CommandCode::Step | CommandCode::ExitChannel => {
            ServerResponse::Ack(ErrorCode::Ok)
        }
        CommandCode::Threads => ServerResponse::Threads(ErrorCode::Ok, ThreadsResponse::default()),
        CommandCode::StackTrace => {
            ServerResponse::StackTrace(ErrorCode::Ok, StackTraceResponse::default())
        }
        CommandCode::Variables => {
            ServerResponse::Variables(ErrorCode::Ok, VariablesResponse::default())
        }
    }
}

/// Whether to accept a new connection. The device only ever serves one
/// client at a time; a plugin can refuse a connection outright (e.g. to
/// simulate the device being busy).
#[derive(Debug, Clone, Copy)]
pub struct ClientConnectedEvent {
    /// The address the connection came from.
    pub peer_addr: SocketAddr,
    /// Whether to accept it. Defaults to `true`; a plugin may flip it.
    pub accept: bool,
}

/// Lets a plugin override how a request is parsed out of the buffer. The
/// server has already attempted its own decode (via each command's
/// [`Request`] impl) and seeded `parsed` with the result; a plugin only
/// needs to act if it wants to inject a different frame (fault injection,
/// an unsupported command, etc).
#[derive(Debug)]
pub struct ProvideRequestEvent<'a> {
    /// The bytes currently unhandled, starting at a frame boundary.
    pub buffer: &'a [u8],
    /// The request decoded so far (by the server, or by an earlier plugin),
    /// paired with the number of bytes it consumed. `None` means "not
    /// enough data yet".
    pub parsed: Option<(ParsedRequest, usize)>,
}

/// Lets a plugin supply the response body for a parsed request.
#[derive(Debug)]
pub struct ProvideResponseEvent {
    /// The request being answered.
    pub request: ParsedRequest,
    /// The response to send. Seeded with a zero-value default matching the
    /// request's command; a plugin overwrites it with scripted content.
    pub response: ServerResponse,
}

/// Lets a plugin inspect or rewrite the serialized response bytes just
/// before they're written to the socket.
#[derive(Debug)]
pub struct BeforeSendResponseEvent {
    /// The encoded frame about to be sent.
    pub bytes: Vec<u8>,
}

/// Notifies a plugin that a response was written to the socket.
#[derive(Debug)]
pub struct AfterSendResponseEvent {
    /// The encoded frame that was sent.
    pub bytes: Vec<u8>,
}

/// A named lifecycle hook into the emulated server. Every method defaults
/// to passing its event through unchanged, so a plugin only needs to
/// implement the hooks it cares about.
pub trait Plugin {
    /// A client is attempting to connect.
    fn on_client_connected(&mut self, event: ClientConnectedEvent) -> ClientConnectedEvent {
        event
    }

    /// A request frame is being pulled off the unhandled-bytes buffer.
    fn provide_request<'a>(&mut self, event: ProvideRequestEvent<'a>) -> ProvideRequestEvent<'a> {
        event
    }

    /// A parsed request needs a response body.
    fn provide_response(&mut self, event: ProvideResponseEvent) -> ProvideResponseEvent {
        event
    }

    /// The response is about to be serialized and sent.
    fn before_send_response(&mut self, event: BeforeSendResponseEvent) -> BeforeSendResponseEvent {
        event
    }

    /// The response was just sent.
    fn after_send_response(&mut self, event: AfterSendResponseEvent) -> AfterSendResponseEvent {
        event
    }
}

/// An ordered collection of [`Plugin`]s. Each hook call threads its event
/// through every registered plugin, in registration order, each receiving
/// the event the previous one returned.
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginChain {
    /// An empty chain (every hook behaves as a pure pass-through).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin to the end of the chain.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    fn client_connected(&mut self, peer_addr: SocketAddr) -> bool {
        let mut event = ClientConnectedEvent {
            peer_addr,
            accept: true,
        };
        for plugin in &mut self.plugins {
            event = plugin.on_client_connected(event);
        }
        event.accept
    }

    fn provide_request(
        &mut self,
        buffer: &[u8],
        default: Option<(ParsedRequest, usize)>,
    ) -> Option<(ParsedRequest, usize)> {
        let mut event = ProvideRequestEvent {
            buffer,
            parsed: default,
        };
        for plugin in &mut self.plugins {
            event = plugin.provide_request(event);
        }
        event.parsed
    }

    fn provide_response(&mut self, request: ParsedRequest) -> ServerResponse {
        let mut event = ProvideResponseEvent {
            response: default_response(request.command),
            request,
        };
        for plugin in &mut self.plugins {
            event = plugin.provide_response(event);
        }
        event.response
    }

    fn before_send_response(&mut self, bytes: Vec<u8>) -> Vec<u8> {
        let mut event = BeforeSendResponseEvent { bytes };
        for plugin in &mut self.plugins {
            event = plugin.before_send_response(event);
        }
        event.bytes
    }

    fn after_send_response(&mut self, bytes: Vec<u8>) {
        let mut event = AfterSendResponseEvent { bytes };
        for plugin in &mut self.plugins {
            event = plugin.after_send_response(event);
        }
    }
}

/// Tries each known request type's decoder in turn, returning the first
/// that matches the frame's command code, or `None` if the buffer doesn't
/// yet hold a complete frame.
fn default_parse_request(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, ProtocolError> {
    macro_rules! try_request {
        ($ty:ty, $detail:expr) => {
            match <$ty>::from_buffer(buf) {
                Ok(Decoded {
                    value: (request_id, req),
                    consumed,
                }) => {
                    return Ok(Some((
                        ParsedRequest {
                            request_id,
                            command: <$ty as Request>::COMMAND,
                            detail: ($detail)(req),
                        },
                        consumed,
                    )))
                }
                Err(ProtocolError::ShortRead) => return Ok(None),
                Err(ProtocolError::Invalid(_)) => {}
                Err(e) => return Err(e),
            }
        };
    }

    try_request!(StopRequest, |_| RequestDetail::Stop);
    try_request!(ContinueRequest, |_| RequestDetail::Continue);
    try_request!(StepRequest, RequestDetail::Step);
    try_request!(ExitChannelRequest, |_| RequestDetail::ExitChannel);
    try_request!(ThreadsRequest, |_| RequestDetail::Threads);
    try_request!(StackTraceRequest, RequestDetail::StackTrace);
    try_request!(VariablesRequest, RequestDetail::Variables);

    Ok(None)
}

/// Spawns the emulated server on a background thread, bound to `addr`
/// (`0.0.0.0:0` lets the OS choose a free port, the usual choice in tests).
/// Returns the address it actually bound to and a handle to the thread.
pub fn spawn(
    addr: impl ToSocketAddrs,
    magic: Vec<u8>,
    plugins: PluginChain,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let std_listener = StdTcpListener::bind(addr)?;
    let local_addr = std_listener.local_addr()?;
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener);

    let join = thread::Builder::new()
        .name("bsdebug-emulated-server".to_string())
        .spawn(move || run(listener, magic, plugins))
        .expect("failed to spawn emulated server thread");

    Ok((local_addr, join))
}

const LISTENER: Token = Token(0);
const CONN: Token = Token(1);

fn run(mut listener: TcpListener, magic: Vec<u8>, mut plugins: PluginChain) {
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            error!("emulated server: failed to create poll: {e}");
            return;
        }
    };

    if let Err(e) = poll
        .registry()
        .register(&mut listener, LISTENER, Interest::READABLE)
    {
        error!("emulated server: failed to register listener: {e}");
        return;
    }

    let mut events = Events::with_capacity(16);
    let mut conn: Option<Connection> = None;

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("emulated server poll error: {e}");
            return;
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => accept(&mut listener, &mut poll, &mut conn, &mut plugins, &magic),
                CONN => {
                    let Some(c) = conn.as_mut() else { continue };
                    if !c.readable(&mut plugins) {
                        let _ = poll.registry().deregister(&mut c.socket);
                        conn = None;
                    }
                }
                _ => {}
            }
        }
    }
}

/// The device accepts at most one connection; once one is live, further
/// connection attempts are drained and dropped rather than queued.
fn accept(
    listener: &mut TcpListener,
    poll: &mut Poll,
    conn: &mut Option<Connection>,
    plugins: &mut PluginChain,
    magic: &[u8],
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                if conn.is_some() {
                    debug!("emulated server: rejecting {peer_addr}, already have a client");
                    continue;
                }

                if !plugins.client_connected(peer_addr) {
                    debug!("emulated server: plugin rejected connection from {peer_addr}");
                    continue;
                }

                if let Err(e) = poll.registry().register(
                    &mut stream,
                    CONN,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    error!("emulated server: failed to register connection: {e}");
                    continue;
                }

                debug!("emulated server: accepted connection from {peer_addr}");
                *conn = Some(Connection::new(stream, magic.to_vec()));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("emulated server: accept error: {e}");
                break;
            }
        }
    }
}

struct Connection {
    socket: TcpStream,
    magic: Vec<u8>,
    handshake_complete: bool,
    unhandled_bytes: Vec<u8>,
    outgoing: Vec<u8>,
    read_buf: [u8; 16 * 1024],
}

impl Connection {
    fn new(socket: TcpStream, magic: Vec<u8>) -> Self {
        Self {
            socket,
            magic,
            handshake_complete: false,
            unhandled_bytes: Vec::new(),
            outgoing: Vec::new(),
            read_buf: [0u8; 16 * 1024],
        }
    }

    /// Drains readable bytes into `unhandled_bytes`, runs them through the
    /// action-queue-guarded process loop, and flushes any response bytes
    /// produced. Returns `false` if the connection ended.
    fn readable(&mut self, plugins: &mut PluginChain) -> bool {
        loop {
            match self.socket.read(&mut self.read_buf) {
                Ok(0) => return false,
                Ok(n) => {
                    trace!("emulated server read {n} bytes");
                    self.unhandled_bytes.extend_from_slice(&self.read_buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("emulated server read error: {e}");
                    return false;
                }
            }
        }

        if !self.process(plugins) {
            return false;
        }

        self.write_pending().is_ok()
    }

    /// Bytes received are fed through an action-queue-guarded process
    /// loop: each attempt either fully drains what's currently decodable
    /// (`Complete`) or reports it needs more bytes (`Retry`, left for the
    /// next `readable` call once more data has arrived).
    fn process(&mut self, plugins: &mut PluginChain) -> bool {
        let magic = &self.magic;
        let handshake_complete = &mut self.handshake_complete;
        let unhandled_bytes = &mut self.unhandled_bytes;
        let outgoing = &mut self.outgoing;

        let mut queue = ActionQueue::new();
        let mut failed = false;
        let rx = queue.run(move || {
            process_once(magic, handshake_complete, unhandled_bytes, outgoing, plugins)
        });

        while queue.tick() {}

        match rx.try_recv() {
            Ok(Some(Err(e))) => {
                warn!("emulated server: connection failed: {e}");
                failed = true;
            }
            Ok(Some(Ok(()))) | Ok(None) => {}
            Err(_) => unreachable!("action resolved synchronously above"),
        }

        !failed
    }

    fn write_pending(&mut self) -> io::Result<()> {
        while !self.outgoing.is_empty() {
            match self.socket.write(&self.outgoing) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket closed")),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// One pass of the process loop: handshake first, then as many
/// request/response cycles as the buffer currently allows. Reports
/// `Complete` once nothing further can be decoded right now (normal — the
/// action queue simply won't retry until more bytes arrive and `process`
/// is called again), `Retry` only if internal bookkeeping wants another
/// immediate pass (never needed in practice since we loop internally), and
/// an error on a fatal protocol violation.
fn process_once(
    magic: &[u8],
    handshake_complete: &mut bool,
    unhandled_bytes: &mut Vec<u8>,
    outgoing: &mut Vec<u8>,
    plugins: &mut PluginChain,
) -> Result<ActionOutcome, ActionFailed> {
    use crate::protocol::{decode_handshake_request, encode_handshake_response};

    loop {
        if !*handshake_complete {
            match decode_handshake_request(unhandled_bytes, magic) {
                Ok(decoded) => {
                    unhandled_bytes.drain(..decoded.consumed);
                    *handshake_complete = true;
                    let reply = HandshakeResponseV3::current(0);
                    outgoing.extend_from_slice(&encode_handshake_response(&reply));
                    debug!("emulated server: handshake complete");
                    continue;
                }
                Err(ProtocolError::ShortRead) => return Ok(ActionOutcome::Complete),
                Err(ProtocolError::BadMagic(got)) => {
                    return Err(ActionFailed(format!("bad handshake magic: {got:?}")));
                }
                Err(e) => return Err(ActionFailed(e.to_string())),
            }
        }

        let default = match default_parse_request(unhandled_bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("emulated server: malformed request, disconnecting: {e}");
                return Err(ActionFailed(e.to_string()));
            }
        };

        let Some((request, consumed)) = plugins.provide_request(unhandled_bytes, default) else {
            return Ok(ActionOutcome::Complete);
        };

        unhandled_bytes.drain(..consumed);
        let request_id = request.request_id;
        debug!("emulated server: request {request_id} {:?}", request.command);

        let response = plugins.provide_response(request);
        let bytes = response.to_buffer(request_id);
        let bytes = plugins.before_send_response(bytes);
        outgoing.extend_from_slice(&bytes);
        plugins.after_send_response(bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::protocol::{HANDSHAKE_MAGIC, ThreadEntry, StopReason};

    struct ScriptedPlugin {
        threads: ThreadsResponse,
    }

    impl Plugin for ScriptedPlugin {
        fn provide_response(&mut self, mut event: ProvideResponseEvent) -> ProvideResponseEvent {
            if let RequestDetail::Threads = event.request.detail {
                event.response = ServerResponse::Threads(ErrorCode::Ok, self.threads.clone());
            }
            event
        }
    }

    fn connect_and_handshake(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(HANDSHAKE_MAGIC).unwrap();

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).expect("handshake reply");
        buf.truncate(n);
        let decoded = HandshakeResponseV3::from_buffer(&buf).expect("decode handshake reply");
        assert_eq!(decoded.value.error_code, ErrorCode::Ok);
        stream
    }

    #[test]
    fn handshake_roundtrip_against_emulated_server() {
        let plugins = PluginChain::new();
        let (addr, _join) = spawn("127.0.0.1:0", HANDSHAKE_MAGIC.to_vec(), plugins).unwrap();
        let _stream = connect_and_handshake(addr);
    }

    #[test]
    fn scripted_plugin_answers_threads_request() {
        let mut plugins = PluginChain::new();
        plugins.register(Box::new(ScriptedPlugin {
            threads: ThreadsResponse {
                threads: vec![ThreadEntry {
                    is_primary: true,
                    stop_reason: StopReason::Normal,
                    stop_reason_detail: String::new(),
                    line: 1,
                    function_name: "main".to_string(),
                    file_path: "pkg:/source/main.brs".to_string(),
                }],
            },
        }));

        let (addr, _join) = spawn("127.0.0.1:0", HANDSHAKE_MAGIC.to_vec(), plugins).unwrap();
        let mut stream = connect_and_handshake(addr);

        let request_id = 1;
        stream
            .write_all(&ThreadsRequest.to_buffer(request_id))
            .unwrap();

        let mut buf = vec![0u8; 512];
        let n = stream.read(&mut buf).expect("threads reply");
        buf.truncate(n);

        let decoded = ThreadsResponse::from_buffer(&buf).expect("decode threads reply");
        assert_eq!(decoded.value.request_id, request_id);
        let body = decoded.value.body.expect("ok response has a body");
        assert_eq!(body.threads.len(), 1);
        assert_eq!(body.threads[0].function_name, "main");
    }

    #[test]
    fn unscripted_request_gets_zero_value_default_response() {
        let plugins = PluginChain::new();
        let (addr, _join) = spawn("127.0.0.1:0", HANDSHAKE_MAGIC.to_vec(), plugins).unwrap();
        let mut stream = connect_and_handshake(addr);

        stream.write_all(&StopRequest.to_buffer(1)).unwrap();

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).expect("ack reply");
        buf.truncate(n);

        let decoded = AckResponse::from_buffer(&buf).expect("decode ack reply");
        assert_matches!(decoded.value.error_code, ErrorCode::Ok);
    }
}
