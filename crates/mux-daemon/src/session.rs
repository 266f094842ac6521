//! A pty-backed child process and the history kept for its viewers.

use std::time::Instant;

use nix::unistd::Pid;
use tokio::sync::mpsc;

use crate::counter::WrapCount;
use crate::event::WinSize;
use crate::pty::{CommandLine, Master, PacketMode};
use crate::replay::{ReplayBuffer, Snapshot};
use crate::slots::Slotted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first viewer handshake before spawning.
    Starting,
    Running,
    /// Close signal sent; waiting for the child to be reaped.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentsRequest {
    Idle,
    /// A viewer should be asked for its contents on the next flush.
    Wanted,
    Sent,
}

/// Extra state for a session whose child is a transport (ssh) client.
#[derive(Debug, Clone)]
pub struct Transport {
    pub host: String,
    pub last_output: Instant,
    pub timed_out: bool,
}

pub struct Session {
    pub id: u32,
    pub epoch: u64,
    pub command: CommandLine,
    pub name: Option<String>,
    pub state: SessionState,
    pub pid: Option<Pid>,
    pub pty: Option<Master>,
    pub packet_mode: PacketMode,
    pub size: WinSize,
    /// Linked connection ids, in link order.
    pub connections: Vec<u32>,
    pub history: Option<ReplayBuffer>,
    pub snapshot: Option<Snapshot>,
    /// Total bytes read from the pty, modulo 2^28.
    pub output_count: WrapCount,
    pub detach_count: u32,
    pub paused: bool,
    pub read_granted: bool,
    pub requesting_contents: ContentsRequest,
    pub transport: Option<Transport>,
    pub eof: bool,
    pub exit_status: Option<i32>,
    pub(crate) grant_tx: mpsc::UnboundedSender<usize>,
    pub(crate) input_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) io_rx: Option<(mpsc::UnboundedReceiver<usize>, mpsc::UnboundedReceiver<Vec<u8>>)>,
}

impl Slotted for Session {
    fn slot_id(&self) -> u32 {
        self.id
    }
}

impl Session {
    pub fn new(id: u32, epoch: u64, command: CommandLine, keep_history: bool) -> Self {
        let (grant_tx, grant_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            id,
            epoch,
            command,
            name: None,
            state: SessionState::Starting,
            pid: None,
            pty: None,
            packet_mode: PacketMode::Off,
            size: WinSize { rows: 24, cols: 80, ..Default::default() },
            connections: Vec::new(),
            history: keep_history.then(ReplayBuffer::new),
            snapshot: None,
            output_count: WrapCount::ZERO,
            detach_count: 0,
            paused: false,
            read_granted: false,
            requesting_contents: ContentsRequest::Idle,
            transport: None,
            eof: false,
            exit_status: None,
            grant_tx,
            input_tx,
            io_rx: Some((grant_rx, input_rx)),
        }
    }

    pub fn is_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn pid_raw(&self) -> i32 {
        self.pid.map(Pid::as_raw).unwrap_or(0)
    }

    pub fn write_input(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            let _ = self.input_tx.send(bytes.to_vec());
        }
    }

    pub fn link(&mut self, conn: u32) {
        if !self.connections.contains(&conn) {
            self.connections.push(conn);
        }
    }

    pub fn unlink(&mut self, conn: u32) {
        self.connections.retain(|&c| c != conn);
    }

    /// Take the receiving ends meant for the pty reader and writer tasks.
    pub fn take_io(
        &mut self,
    ) -> Option<(mpsc::UnboundedReceiver<usize>, mpsc::UnboundedReceiver<Vec<u8>>)> {
        self.io_rx.take()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}
