//! Reusable test harness for relay-mux integration tests.
//!
//! Provides helpers for spawning the daemon, sending command-socket
//! requests, and talking to it as a viewer over the display socket.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

// ── Wire constants (must match the daemon) ──────────────────────────

pub const EVENT_MARKER: u8 = 0xFD;
pub const URGENT_START: u8 = 0x13;
pub const URGENT_END: u8 = 0x14;
pub const REQUEST_END: u8 = 0x0c;
pub const ESCAPE: u8 = 0x00;
pub const EXIT_CODE: u8 = 0x01;
pub const SWITCH_TO_STDOUT: u8 = 0x02;
pub const SWITCH_TO_STDERR: u8 = 0x03;

pub const SESSION_ENDED: &[u8] = b"\x1b[99;99u";

// ── DaemonHandle ────────────────────────────────────────────────────

/// Handle to a running daemon. Kills it and removes its data dir on drop.
pub struct DaemonHandle {
    pub child: Child,
    pub data_dir: PathBuf,
    pub command_socket: PathBuf,
    pub display_socket: PathBuf,
    _home: tempfile::TempDir,
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_relay-mux"))
}

/// Start `relay-mux --server --foreground` in a temp data dir and wait for
/// both sockets.
pub fn spawn_daemon() -> io::Result<DaemonHandle> {
    spawn_daemon_with_settings(None)
}

pub fn spawn_daemon_with_settings(settings: Option<serde_json::Value>) -> io::Result<DaemonHandle> {
    let home = tempfile::tempdir()?;
    let data_dir = home.path().join(".relay-mux");
    let mut cmd = Command::new(binary_path());
    cmd.arg("--server").arg("--foreground").arg("--data-dir").arg(&data_dir);
    if let Some(settings) = settings {
        let path = home.path().join("settings.json");
        fs::write(&path, settings.to_string())?;
        cmd.arg("--settings").arg(path);
    }
    cmd.env("HOME", home.path())
        .env("SHELL", "/bin/sh")
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    let child = cmd.spawn()?;

    let command_socket = data_dir.join("command.sock");
    let display_socket = data_dir.join("display.sock");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(command_socket.exists() && display_socket.exists()) {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Sockets did not appear within 5 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    // Brief delay to let the listeners start accepting
    std::thread::sleep(Duration::from_millis(50));

    Ok(DaemonHandle {
        child,
        data_dir,
        command_socket,
        display_socket,
        _home: home,
    })
}

impl DaemonHandle {
    /// Send one multiplexed command request and collect the reply.
    pub fn command(&self, argv: &[&str]) -> io::Result<CommandResult> {
        self.command_with_options(argv, None)
    }

    pub fn command_with_options(
        &self,
        argv: &[&str],
        options: Option<serde_json::Value>,
    ) -> io::Result<CommandResult> {
        let mut stream = UnixStream::connect(&self.command_socket)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut request = serde_json::json!({
            "cwd": "/tmp",
            "argv": argv,
            "env": ["PATH=/usr/bin:/bin", "HOME=/tmp"],
        });
        if let Some(options) = options {
            request["options"] = options;
        }
        let mut bytes = serde_json::to_vec(&request)?;
        bytes.push(REQUEST_END);
        stream.write_all(&bytes)?;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply)?;
        Ok(decode_multiplexed(&reply))
    }

    /// Run the real client binary against this daemon.
    pub fn client(&self, args: &[&str]) -> io::Result<Output> {
        Command::new(binary_path())
            .arg("--data-dir")
            .arg(&self.data_dir)
            .args(args)
            .stdin(Stdio::null())
            .output()
    }

    pub fn viewer(&self, connect: serde_json::Value) -> io::Result<Viewer> {
        let stream = UnixStream::connect(&self.display_socket)?;
        let mut v = Viewer::new(stream);
        v.send_event("CONNECT", &connect.to_string())?;
        Ok(v)
    }
}

// ── Command replies ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit: Option<u8>,
}

pub fn decode_multiplexed(bytes: &[u8]) -> CommandResult {
    let mut result = CommandResult::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let mut to_stderr = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        let literal = match b {
            ESCAPE => {
                i += 1;
                bytes.get(i - 1).copied()
            }
            EXIT_CODE => {
                result.exit = bytes.get(i).copied();
                break;
            }
            SWITCH_TO_STDOUT => {
                to_stderr = false;
                None
            }
            SWITCH_TO_STDERR => {
                to_stderr = true;
                None
            }
            other => Some(other),
        };
        if let Some(b) = literal {
            if to_stderr {
                err.push(b);
            } else {
                out.push(b);
            }
        }
    }
    result.stdout = String::from_utf8_lossy(&out).into_owned();
    result.stderr = String::from_utf8_lossy(&err).into_owned();
    result
}

/// Pull `session-number=N;window=W` out of a viewer URL.
pub fn parse_url(url: &str) -> Option<(u32, u32)> {
    let fragment = url.trim().split_once('#')?.1;
    let mut session = None;
    let mut window = None;
    for part in fragment.split(';') {
        match part.split_once('=') {
            Some(("session-number", v)) => session = v.parse().ok(),
            Some(("window", v)) => window = v.parse().ok(),
            _ => {}
        }
    }
    Some((session?, window?))
}

// ── Viewer ──────────────────────────────────────────────────────────

/// A display-socket client that accumulates everything it reads.
pub struct Viewer {
    stream: UnixStream,
    pub received: Vec<u8>,
}

impl Viewer {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            received: Vec::new(),
        }
    }

    pub fn send_event(&mut self, name: &str, payload: &str) -> io::Result<()> {
        let mut record = vec![EVENT_MARKER];
        record.extend_from_slice(name.as_bytes());
        record.push(b' ');
        record.extend_from_slice(payload.as_bytes());
        record.push(b'\n');
        self.stream.write_all(&record)
    }

    pub fn send_input(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    /// Read until `needle` shows up in the pty output, or the timeout passes.
    pub fn wait_for(&mut self, needle: &[u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if contains(&self.received, needle) {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            if !self.read_some(deadline) {
                return contains(&self.received, needle);
            }
        }
    }

    /// Read whatever arrives within `timeout`.
    pub fn collect(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.read_some(deadline) {
                break;
            }
        }
    }

    /// Pty output only: urgent control sections removed.
    pub fn output(&self) -> Vec<u8> {
        strip_urgent(&self.received)
    }

    fn read_some(&mut self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.stream
            .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
            .ok();
        let mut buf = [0u8; 65536];
        match self.stream.read(&mut buf) {
            Ok(0) => false, // disconnected
            Ok(n) => {
                self.received.extend_from_slice(&buf[..n]);
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => true,
            Err(_) => false,
        }
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn strip_urgent(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut urgent = false;
    for &b in bytes {
        match b {
            URGENT_START if !urgent => urgent = true,
            URGENT_END if urgent => urgent = false,
            _ if urgent => {}
            _ => out.push(b),
        }
    }
    out
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

pub fn socket_gone(path: &Path) -> bool {
    !path.exists()
}
