//! Fixtures for driving `DaemonState` without real ptys or sockets.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::cmdsock::{CommandReply, ReplyMsg, StdioMode};
use crate::config::{Config, Settings};
use crate::connection::Link;
use crate::daemon::{DaemonEvent, DaemonState};
use crate::pty::CommandLine;
use crate::session::SessionState;

pub struct TestDaemon {
    pub state: DaemonState,
    pub events: UnboundedReceiver<DaemonEvent>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    pub fn new() -> Self {
        Self::with_settings(serde_json::json!({}))
    }

    pub fn with_settings(settings: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), Settings::from_value(settings), StdioMode::default());
        let (tx, events) = mpsc::unbounded_channel();
        Self { state: DaemonState::new(Arc::new(config), tx), events, _dir: dir }
    }
}

/// What the pty tasks of a session would have received.
pub struct SessionIo {
    pub grants: UnboundedReceiver<usize>,
    pub input: UnboundedReceiver<Vec<u8>>,
}

/// A session that looks spawned but has no child behind it.
pub fn running_session(state: &mut DaemonState) -> (u32, SessionIo) {
    let command = CommandLine {
        program: "sh".into(),
        args: Vec::new(),
        cwd: "/".into(),
        env: Vec::new(),
    };
    let sid = state.create_session(command, None, true);
    let s = state.sessions.get_mut(sid).unwrap();
    s.state = SessionState::Running;
    let (grants, input) = s.take_io().unwrap();
    (sid, SessionIo { grants, input })
}

/// A linked viewer whose output lands in the returned receiver.
pub fn viewer(state: &mut DaemonState, sid: u32) -> (u32, UnboundedReceiver<Vec<u8>>) {
    let cid = state.create_connection(state.default_options(), None);
    let (tx, rx) = mpsc::unbounded_channel();
    state.connections.get_mut(cid).unwrap().link = Some(Link::new(tx, None));
    state.link(cid, sid);
    (cid, rx)
}

pub fn test_reply() -> (CommandReply, UnboundedReceiver<ReplyMsg>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandReply::new(tx), rx)
}

pub trait Drain<T> {
    fn drain(&mut self) -> Vec<T>;
}

impl<T> Drain<T> for UnboundedReceiver<T> {
    fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = self.try_recv() {
            out.push(item);
        }
        out
    }
}

pub trait Text {
    fn text(&mut self) -> String;
}

impl Text for UnboundedReceiver<Vec<u8>> {
    fn text(&mut self) -> String {
        String::from_utf8_lossy(&self.drain().concat()).into_owned()
    }
}
