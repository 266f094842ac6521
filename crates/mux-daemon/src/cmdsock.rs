//! Command socket wire format.
//!
//! A client writes one JSON request followed by `\f`. The reply comes back
//! through a [`StdioTransport`]: either the client's stdio descriptors were
//! passed along with the request and only an exit byte returns on the
//! socket, or stdout/stderr/exit are multiplexed on the socket with
//! single-byte markers.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::error::{MuxError, Result};

pub const REQUEST_END: u8 = b'\x0c';
pub const MAX_REQUEST: usize = 1 << 20;

/// Multiplexed reply markers.
pub const ESCAPE: u8 = 0x00;
pub const EXIT_CODE: u8 = 0x01;
pub const SWITCH_TO_STDOUT: u8 = 0x02;
pub const SWITCH_TO_STDERR: u8 = 0x03;

const PASSED_FDS: usize = 3;

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub cwd: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

impl CommandRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(self)?;
        out.push(REQUEST_END);
        Ok(out)
    }

    /// Parse a request whose terminating form feed is present.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.split_last() {
            Some((&REQUEST_END, body)) => Ok(serde_json::from_slice(body)?),
            _ => Err(MuxError::protocol("command request is not terminated by a form feed")),
        }
    }
}

// ── Stdio transports ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StdioMode {
    #[default]
    FdPassing,
    Multiplexed,
}

impl StdioMode {
    pub fn transport(self) -> Box<dyn StdioTransport> {
        match self {
            StdioMode::FdPassing => Box::new(FdPassing),
            StdioMode::Multiplexed => Box::new(Multiplexed::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMsg {
    Out(Vec<u8>),
    Err(Vec<u8>),
    Exit(u8),
}

/// Where the server writes an encoded reply chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Socket,
    Stdout,
    Stderr,
}

/// What the client makes of bytes read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u8),
}

pub trait StdioTransport: Send {
    fn mode(&self) -> StdioMode;

    /// Server side: lay out one reply message as channel writes.
    fn encode_reply(&mut self, msg: &ReplyMsg, out: &mut Vec<(Channel, Vec<u8>)>);

    /// Client side: interpret bytes read from the socket.
    fn decode_reply(&mut self, bytes: &[u8], out: &mut Vec<ClientOutput>);
}

/// The client's own descriptors were passed over; only the exit status
/// travels on the socket.
#[derive(Debug, Default)]
pub struct FdPassing;

impl StdioTransport for FdPassing {
    fn mode(&self) -> StdioMode {
        StdioMode::FdPassing
    }

    fn encode_reply(&mut self, msg: &ReplyMsg, out: &mut Vec<(Channel, Vec<u8>)>) {
        match msg {
            ReplyMsg::Out(b) => out.push((Channel::Stdout, b.clone())),
            ReplyMsg::Err(b) => out.push((Channel::Stderr, b.clone())),
            ReplyMsg::Exit(code) => out.push((Channel::Socket, vec![*code])),
        }
    }

    fn decode_reply(&mut self, bytes: &[u8], out: &mut Vec<ClientOutput>) {
        if let Some(&code) = bytes.last() {
            out.push(ClientOutput::Exit(code));
        }
    }
}

#[derive(Debug)]
pub struct Multiplexed {
    /// Stream the peer currently routes literal bytes to.
    current: Channel,
    escape: bool,
    expect_exit: bool,
}

impl Default for Multiplexed {
    fn default() -> Self {
        Self {
            current: Channel::Stdout,
            escape: false,
            expect_exit: false,
        }
    }
}

impl Multiplexed {
    fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
        for &b in data {
            if b <= SWITCH_TO_STDERR {
                out.push(ESCAPE);
            }
            out.push(b);
        }
    }

    fn flush_literal(&self, lit: &mut Vec<u8>, out: &mut Vec<ClientOutput>) {
        if lit.is_empty() {
            return;
        }
        let bytes = mem::take(lit);
        out.push(match self.current {
            Channel::Stderr => ClientOutput::Stderr(bytes),
            _ => ClientOutput::Stdout(bytes),
        });
    }
}

impl StdioTransport for Multiplexed {
    fn mode(&self) -> StdioMode {
        StdioMode::Multiplexed
    }

    fn encode_reply(&mut self, msg: &ReplyMsg, out: &mut Vec<(Channel, Vec<u8>)>) {
        let mut bytes = Vec::new();
        match msg {
            ReplyMsg::Out(data) | ReplyMsg::Err(data) => {
                let target = if matches!(msg, ReplyMsg::Out(_)) {
                    Channel::Stdout
                } else {
                    Channel::Stderr
                };
                if target != self.current {
                    bytes.push(if target == Channel::Stdout {
                        SWITCH_TO_STDOUT
                    } else {
                        SWITCH_TO_STDERR
                    });
                    self.current = target;
                }
                Self::push_escaped(&mut bytes, data);
            }
            ReplyMsg::Exit(code) => {
                bytes.push(EXIT_CODE);
                bytes.push(*code);
            }
        }
        out.push((Channel::Socket, bytes));
    }

    fn decode_reply(&mut self, bytes: &[u8], out: &mut Vec<ClientOutput>) {
        let mut lit = Vec::new();
        for &b in bytes {
            if self.expect_exit {
                self.flush_literal(&mut lit, out);
                self.expect_exit = false;
                out.push(ClientOutput::Exit(b));
            } else if self.escape {
                self.escape = false;
                lit.push(b);
            } else {
                match b {
                    ESCAPE => self.escape = true,
                    EXIT_CODE => self.expect_exit = true,
                    SWITCH_TO_STDOUT | SWITCH_TO_STDERR => {
                        self.flush_literal(&mut lit, out);
                        self.current = if b == SWITCH_TO_STDOUT {
                            Channel::Stdout
                        } else {
                            Channel::Stderr
                        };
                    }
                    _ => lit.push(b),
                }
            }
        }
        self.flush_literal(&mut lit, out);
    }
}

// ── Reply handle ────────────────────────────────────────────────────

/// Daemon-side handle for answering one client invocation.
#[derive(Debug, Clone)]
pub struct CommandReply {
    tx: mpsc::UnboundedSender<ReplyMsg>,
}

impl CommandReply {
    pub fn new(tx: mpsc::UnboundedSender<ReplyMsg>) -> Self {
        Self { tx }
    }

    pub fn out(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(ReplyMsg::Out(bytes.into()));
    }

    pub fn err(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(ReplyMsg::Err(bytes.into()));
    }

    pub fn finish(&self, code: u8) {
        let _ = self.tx.send(ReplyMsg::Exit(code));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain reply messages to the client until the exit status is written.
pub async fn write_replies<S, O>(
    mut rx: mpsc::UnboundedReceiver<ReplyMsg>,
    mut transport: Box<dyn StdioTransport>,
    mut socket: S,
    mut stdout: Option<O>,
    mut stderr: Option<O>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
    O: AsyncWrite + Unpin + Send,
{
    let mut writes = Vec::new();
    loop {
        let msg = match rx.recv().await {
            Some(msg) => msg,
            None => {
                tracing::warn!("command reply dropped without an exit status");
                ReplyMsg::Exit(1)
            }
        };
        let done = matches!(msg, ReplyMsg::Exit(_));
        writes.clear();
        transport.encode_reply(&msg, &mut writes);
        for (channel, bytes) in writes.drain(..) {
            let target: &mut (dyn AsyncWrite + Unpin + Send) = match channel {
                Channel::Stdout => match stdout.as_mut() {
                    Some(w) => w,
                    None => &mut socket,
                },
                Channel::Stderr => match stderr.as_mut() {
                    Some(w) => w,
                    None => &mut socket,
                },
                Channel::Socket => &mut socket,
            };
            target.write_all(&bytes).await?;
        }
        if done {
            socket.shutdown().await?;
            return Ok(());
        }
    }
}

// ── Descriptor passing ──────────────────────────────────────────────

/// `recvmsg` that also collects any `SCM_RIGHTS` descriptors.
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut control = nix::cmsg_space!([RawFd; PASSED_FDS]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut control), MsgFlags::empty())?;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us.
            fds.extend(received.into_iter().map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }));
        }
    }
    Ok(msg.bytes)
}

/// `sendmsg` carrying `fds` as `SCM_RIGHTS` alongside `bytes`.
pub fn send_with_fds(fd: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    Ok(sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)?)
}

// ── Server side ─────────────────────────────────────────────────────

pub struct IncomingRequest {
    pub request: CommandRequest,
    /// stdin, stdout, stderr when the client passed them.
    pub stdio: Option<[OwnedFd; PASSED_FDS]>,
    /// Bytes that followed the form feed (multiplexed stdin).
    pub leftover: Vec<u8>,
}

/// Read one request from a freshly accepted command socket.
pub async fn read_request(stream: &UnixStream) -> Result<IncomingRequest> {
    let mut data = Vec::new();
    let mut fds = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    let end = loop {
        stream.readable().await?;
        let n = match stream.try_io(Interest::READABLE, || {
            recv_with_fds(stream.as_raw_fd(), &mut buf, &mut fds)
        }) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(MuxError::protocol("client closed before finishing its request"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.iter().position(|&b| b == REQUEST_END) {
            break pos;
        }
        if data.len() > MAX_REQUEST {
            return Err(MuxError::protocol("command request too large"));
        }
    };
    let leftover = data.split_off(end + 1);
    let request = CommandRequest::decode(&data)?;
    let stdio = match fds.len() {
        0 => None,
        PASSED_FDS => {
            let mut it = fds.into_iter();
            match (it.next(), it.next(), it.next()) {
                (Some(i), Some(o), Some(e)) => Some([i, o, e]),
                _ => None,
            }
        }
        n => return Err(MuxError::protocol(format!("expected 3 passed descriptors, got {n}"))),
    };
    Ok(IncomingRequest { request, stdio, leftover })
}
