use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{bail, Context};
use bytes::BytesMut;
use bsdebug::protocol::{
    self as proto, AllThreadsStoppedUpdate, BufferReader, CommandCode, ContinueRequest,
    ExitChannelRequest, HandshakeResponseV3, IoPortOpenedUpdate, ProtocolError, Request, Response,
    StackTraceRequest, StackTraceResponse, StepRequest, StopRequest, ThreadAttachedUpdate,
    ThreadsRequest, ThreadsResponse, Update, VariablesRequest, VariablesResponse,
};
use chrono::Utc;
use clap::Parser;
use console::{measure_text_width, style};
use mio::net::{TcpListener, TcpStream};

/// A tool for tracing `bsdebug` control-channel traffic. Connects to an
/// upstream device, and binds a socket for a client (an IDE, or another copy
/// of this crate's `Session`) to connect to. Every frame sent in either
/// direction is decoded and dumped to stdout.
///
/// To use it, first launch the program, binding some port:
///
///     $ bsdebug-trace --upstream 192.168.1.50:8081 --bind 127.0.0.1:8081
///
/// Then point a debugger client at `127.0.0.1:8081` instead of the device.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The device's control-channel address. Defaults to fetching it from
    /// the environment.
    #[arg(long, value_name = "HOST:PORT")]
    upstream: Option<String>,

    /// The address to bind as the relay's listening side.
    #[arg(long, value_name = "HOST:PORT")]
    bind: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

struct Connection {
    peer_name: String,
    handshake_done: bool,

    client: TcpStream,
    client_token: mio::Token,
    upstream: TcpStream,
    upstream_token: mio::Token,

    client_to_server: BytesMut,
    server_to_client: BytesMut,
    pending_reply: HashMap<u32, CommandCode>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let upstream_addr = args
        .upstream
        .unwrap_or_else(bsdebug::config::control_addr_from_env);

    let std_listener =
        std::net::TcpListener::bind(&args.bind).context("failed to bind relay socket")?;
    std_listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(std_listener);

    const LISTENER: mio::Token = mio::Token(0);

    let mut next_client_token = 1024;
    let mut next_upstream_token = 2048;

    let mut connections = Vec::new();

    let mut poll = mio::Poll::new()?;
    let mut events = mio::Events::with_capacity(1024);

    poll.registry()
        .register(&mut listener, LISTENER, mio::Interest::READABLE)?;

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER => {
                    let (mut stream, addr) = listener.accept()?;
                    stream.set_nodelay(true).ok();
                    let token = mio::Token(next_client_token);
                    next_client_token += 1;

                    poll.registry()
                        .register(&mut stream, token, mio::Interest::READABLE)?;

                    let mut upstream =
                        TcpStream::connect(upstream_addr.parse::<std::net::SocketAddr>()?)?;
                    let upstream_token = mio::Token(next_upstream_token);
                    next_upstream_token += 1;

                    poll.registry().register(
                        &mut upstream,
                        upstream_token,
                        mio::Interest::READABLE,
                    )?;

                    let conn = Connection {
                        peer_name: format!("{addr}"),
                        handshake_done: false,
                        client: stream,
                        client_token: token,
                        upstream,
                        upstream_token,
                        pending_reply: HashMap::new(),
                        client_to_server: BytesMut::new(),
                        server_to_client: BytesMut::new(),
                    };

                    connections.push(conn);
                }
                token if event.is_read_closed() => {
                    if let Some(pos) = connections
                        .iter()
                        .position(|c| c.client_token == token || c.upstream_token == token)
                    {
                        let mut conn = connections.remove(pos);
                        let msg = if conn.client_token == token {
                            "disconnected".to_string()
                        } else {
                            format!("disconnected {}", style("by device").bold())
                        };

                        println!(
                            "{}: {} {}",
                            style(Utc::now().to_string()).dim(),
                            style(conn.peer_name).cyan(),
                            style(msg).red(),
                        );

                        poll.registry().deregister(&mut conn.client)?;
                        poll.registry().deregister(&mut conn.upstream)?;
                    }
                }
                token => {
                    if let Some(conn) = connections
                        .iter_mut()
                        .find(|c| c.client_token == token || c.upstream_token == token)
                    {
                        let direction = if conn.client_token == token {
                            Direction::ClientToServer
                        } else {
                            Direction::ServerToClient
                        };

                        match relay(conn, direction) {
                            Ok(()) => (),
                            Err(e) => match e.downcast_ref::<std::io::Error>() {
                                Some(_) => continue,
                                _ => bail!(e),
                            },
                        }
                    }
                }
            }
        }
    }
}

fn relay(conn: &mut Connection, direction: Direction) -> anyhow::Result<()> {
    // Split `conn` into disjoint field borrows up front: the rest of this
    // function needs to read/write several fields independently (the
    // socket pair, the direction's buffer, the pending-reply map, the
    // handshake flag) and none of the helpers below need the whole struct.
    let Connection {
        peer_name,
        handshake_done,
        client,
        upstream,
        client_to_server,
        server_to_client,
        pending_reply,
        ..
    } = conn;

    let (src, dest) = if direction == Direction::ClientToServer {
        (client, upstream)
    } else {
        (upstream, client)
    };

    let buf = if direction == Direction::ClientToServer {
        client_to_server
    } else {
        server_to_client
    };

    'read: loop {
        let off = buf.len();
        buf.resize(off + 4096, 0);

        let n = match src.read(&mut buf[off..]) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                buf.truncate(off);
                break 'read;
            }
            v => v.context("recv error")?,
        };

        buf.truncate(off + n);

        loop {
            let consumed = if !*handshake_done {
                // The opening handshake has no length-prefixed header on
                // either side: a literal magic string from the client, a
                // response-shaped frame (request_id fixed at 0) from the
                // device.
                match direction {
                    Direction::ClientToServer => {
                        match proto::decode_handshake_request(buf, &bsdebug::config::handshake_magic_from_env())
                        {
                            Ok(decoded) => {
                                dump(peer_name, -1, &"<handshake>", direction);
                                Some(decoded.consumed)
                            }
                            Err(ProtocolError::ShortRead) => None,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Direction::ServerToClient => match HandshakeResponseV3::from_buffer(buf) {
                        Ok(decoded) => {
                            if let Some(reply) = &decoded.value.body {
                                dump(peer_name, -1, reply, direction);
                            }
                            *handshake_done = true;
                            Some(decoded.consumed)
                        }
                        Err(ProtocolError::ShortRead) => None,
                        Err(e) => return Err(e.into()),
                    },
                }
            } else {
                match direction {
                    Direction::ClientToServer => dump_request(pending_reply, peer_name, buf)?,
                    Direction::ServerToClient => dump_response_or_update(pending_reply, peer_name, buf)?,
                }
            };

            // Client-to-server handshake completion is implicit: the
            // device doesn't ack it separately, the client just starts
            // sending ordinary requests once it's seen the reply.
            if direction == Direction::ClientToServer && !*handshake_done && consumed.is_some() {
                *handshake_done = true;
            }

            let Some(consumed) = consumed else {
                continue 'read;
            };

            let msg_bytes = buf.split_to(consumed);
            dest.write_all(&msg_bytes)?;
        }
    }

    Ok(())
}

/// Decodes one request frame, recording its command for the matching reply,
/// and returns the number of bytes it consumed (`None` if `buf` isn't a full
/// frame yet).
fn dump_request(
    pending_reply: &mut HashMap<u32, CommandCode>,
    peer_name: &str,
    buf: &[u8],
) -> anyhow::Result<Option<usize>> {
    macro_rules! try_request {
        ($ty:ty) => {
            match <$ty>::from_buffer(buf) {
                Ok(decoded) => {
                    let (request_id, req) = decoded.value;
                    pending_reply.insert(request_id, <$ty>::COMMAND);
                    dump(peer_name, request_id as i64, &req, Direction::ClientToServer);
                    return Ok(Some(decoded.consumed));
                }
                Err(ProtocolError::ShortRead) => return Ok(None),
                Err(ProtocolError::Invalid(_)) => {}
                Err(e) => return Err(e.into()),
            }
        };
    }

    try_request!(StopRequest);
    try_request!(ContinueRequest);
    try_request!(StepRequest);
    try_request!(ExitChannelRequest);
    try_request!(ThreadsRequest);
    try_request!(StackTraceRequest);
    try_request!(VariablesRequest);

    // An unrecognized command code: peek the header well enough to move
    // past the frame without understanding its body.
    match peek_header(buf) {
        Some((packet_length, request_id, code)) => {
            dump(peer_name, request_id as i64, &UnknownFrame(code), Direction::ClientToServer);
            Ok(Some(packet_length))
        }
        None => Ok(None),
    }
}

/// Decodes one response or update frame from the device, looking up the
/// originating request's command for typed responses.
fn dump_response_or_update(
    pending_reply: &mut HashMap<u32, CommandCode>,
    peer_name: &str,
    buf: &[u8],
) -> anyhow::Result<Option<usize>> {
    let Some((packet_length, request_id, code)) = peek_header(buf) else {
        return Ok(None);
    };

    if request_id == 0 {
        return dump_update(peer_name, buf, packet_length, code);
    }

    let Some(command) = pending_reply.remove(&request_id) else {
        dump(peer_name, request_id as i64, &UnknownFrame(code), Direction::ServerToClient);
        return Ok(Some(packet_length));
    };

    macro_rules! dump_typed {
        ($ty:ty) => {{
            let decoded = <$ty>::from_buffer(buf)?;
            if let Some(body) = &decoded.value.body {
                dump(peer_name, request_id as i64, body, Direction::ServerToClient);
            } else {
                dump(
                    peer_name,
                    request_id as i64,
                    &decoded.value.error_code,
                    Direction::ServerToClient,
                );
            }
            return Ok(Some(decoded.consumed));
        }};
    }

    match command {
        CommandCode::Stop | CommandCode::Continue | CommandCode::Step | CommandCode::ExitChannel => {
            dump_typed!(proto::AckResponse)
        }
        CommandCode::Threads => dump_typed!(ThreadsResponse),
        CommandCode::StackTrace => dump_typed!(StackTraceResponse),
        CommandCode::Variables => dump_typed!(VariablesResponse),
    }
}

fn dump_update(
    peer_name: &str,
    buf: &[u8],
    packet_length: usize,
    _error_code: u32,
) -> anyhow::Result<Option<usize>> {
    macro_rules! try_update {
        ($ty:ty) => {
            match <$ty>::from_buffer(buf) {
                Ok(decoded) => {
                    dump(peer_name, -1, &decoded.value, Direction::ServerToClient);
                    return Ok(Some(decoded.consumed));
                }
                Err(ProtocolError::ShortRead) => return Ok(None),
                Err(ProtocolError::Invalid(_)) => {}
                Err(e) => return Err(e.into()),
            }
        };
    }

    try_update!(IoPortOpenedUpdate);
    try_update!(AllThreadsStoppedUpdate);
    try_update!(ThreadAttachedUpdate);

    // `UndefinedUpdate` or an update kind this crate doesn't model yet.
    dump(peer_name, -1, &"<update>", Direction::ServerToClient);
    Ok(Some(packet_length))
}

/// Reads the shared 12-byte header without committing to any one frame kind.
fn peek_header(buf: &[u8]) -> Option<(usize, u32, u32)> {
    if buf.len() < 4 {
        return None;
    }
    let packet_length = BufferReader::new(&buf[0..4]).read_u32().ok()? as usize;
    if buf.len() < packet_length || packet_length < 12 {
        return None;
    }

    let mut r = BufferReader::new(&buf[4..12]);
    let request_id = r.read_u32().ok()?;
    let code = r.read_u32().ok()?;
    Some((packet_length, request_id, code))
}

struct UnknownFrame(u32);

impl std::fmt::Debug for UnknownFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<unrecognized code {}>", self.0)
    }
}

fn dump(peer_name: &str, request_id: i64, value: &impl std::fmt::Debug, direction: Direction) {
    let header = header(peer_name, request_id, direction);
    println!(
        "{}\n{}\n{}",
        header,
        "-".repeat(measure_text_width(&header)),
        style(format!("{value:#?}")).dim()
    );
}

fn header(peer_name: &str, request_id: i64, direction: Direction) -> String {
    match direction {
        Direction::ClientToServer => format!(
            "{} [{}]: {} {}",
            style(Utc::now().to_string()).dim(),
            style(request_id).bold(),
            style(peer_name).cyan(),
            style("-> device").bold(),
        ),
        Direction::ServerToClient => format!(
            "{} [{}]: {} {}",
            style(Utc::now().to_string()).dim(),
            style(request_id).bold(),
            style("device ->").bold(),
            style(peer_name).cyan(),
        ),
    }
}
