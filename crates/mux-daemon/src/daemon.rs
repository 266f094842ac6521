//! The daemon: one dispatcher task owns every session and connection and
//! reacts to events sent by the I/O tasks around it.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cmdsock::{self, CommandReply, StdioMode};
use crate::codec::{self, Inbound, LinkStatus};
use crate::commands::{ClientInput, CommandContext, RequestOptions};
use crate::config::Config;
use crate::connection::{Connection, InitPhase, Link};
use crate::counter::WrapCount;
use crate::error::{MuxError, Result};
use crate::event::{ClientEvent, ConnectRequest};
use crate::fdio::FdStream;
use crate::proxy::ProxyMode;
use crate::pty::{self, CommandLine, PtyRead};
use crate::retention::{self, ConnectionFate, SessionFate, SessionView};
use crate::session::{Session, SessionState};
use crate::slots::{SlotTable, Slotted};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_POLL: Duration = Duration::from_millis(50);
/// Time reply writers get to flush after the loop ends.
const EXIT_GRACE: Duration = Duration::from_millis(100);
const READ_BUF: usize = 64 * 1024;

// ── Events ──────────────────────────────────────────────────────────

pub enum DaemonEvent {
    Pty { session: u32, epoch: u64, read: PtyRead },
    Input { conn: u32, epoch: u64, bytes: Vec<u8> },
    Closed { conn: u32, epoch: u64 },
    Viewer(ViewerHello),
    Command(CommandContext),
    Timer(Timer),
    Shutdown,
}

/// A display-socket client that finished (or skipped) its CONNECT record.
pub struct ViewerHello {
    pub request: ConnectRequest,
    pub stream: UnixStream,
    pub pending: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    ForceKill { session: u32, epoch: u64 },
    Reap { session: u32, epoch: u64 },
    Keepalive { conn: u32, epoch: u64 },
    TransportWatch { session: u32, epoch: u64 },
}

/// Top-level window number held in the shared id namespace.
pub struct MainWindow {
    pub id: u32,
    pub connection: u32,
}

impl Slotted for MainWindow {
    fn slot_id(&self) -> u32 {
        self.id
    }
}

// ── State ───────────────────────────────────────────────────────────

pub struct DaemonState {
    pub config: Arc<Config>,
    pub sessions: SlotTable<Session>,
    pub connections: SlotTable<Connection>,
    pub main_windows: SlotTable<MainWindow>,
    pub(crate) events: mpsc::UnboundedSender<DaemonEvent>,
    pub(crate) dirty: BTreeSet<u32>,
    pub focused: Option<u32>,
    /// Set by `kill-server` or a termination signal.
    pub stopping: bool,
    pub(crate) exit_requested: bool,
    epoch: u64,
}

impl DaemonState {
    pub fn new(config: Arc<Config>, events: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        Self {
            config,
            sessions: SlotTable::new(),
            connections: SlotTable::new(),
            main_windows: SlotTable::new(),
            events,
            dirty: BTreeSet::new(),
            focused: None,
            stopping: false,
            exit_requested: false,
            epoch: 0,
        }
    }

    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn default_options(&self) -> Arc<RequestOptions> {
        Arc::new(RequestOptions::from_settings(self.config.settings.clone()))
    }

    pub(crate) fn schedule(&self, after: Duration, timer: Timer) {
        let tx = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(DaemonEvent::Timer(timer));
        });
    }

    pub(crate) fn mark_dirty(&mut self, conn: u32) {
        self.dirty.insert(conn);
    }

    pub(crate) fn mark_session_dirty(&mut self, sid: u32) {
        if let Some(s) = self.sessions.get(sid) {
            let ids = s.connections.clone();
            self.dirty.extend(ids);
        }
    }

    /// Queue an urgent control sequence for a connection.
    pub(crate) fn notify(&mut self, conn: u32, seq: &str) {
        if let Some(c) = self.connections.get_mut(conn) {
            codec::push_urgent(&mut c.controls, seq.as_bytes());
            self.dirty.insert(conn);
        }
    }

    // ── Creation ────────────────────────────────────────────────────

    pub fn create_session(&mut self, command: CommandLine, hint: Option<u32>, keep_history: bool) -> u32 {
        let epoch = self.next_epoch();
        let packet_mode = self.config.packet_mode();
        let (connections, main_windows) = (&self.connections, &self.main_windows);
        let sid = self.sessions.enter_with(
            hint,
            |id| connections.valid(id) || main_windows.valid(id),
            |id| Session::new(id, epoch, command, keep_history),
        );
        if let Some(s) = self.sessions.get_mut(sid) {
            s.packet_mode = packet_mode;
        }
        info!(session = sid, "session created");
        sid
    }

    pub fn create_connection(&mut self, options: Arc<RequestOptions>, hint: Option<u32>) -> u32 {
        let epoch = self.next_epoch();
        let (sessions, main_windows) = (&self.sessions, &self.main_windows);
        self.connections.enter_with(
            hint,
            |id| sessions.valid(id) || main_windows.valid(id),
            |id| Connection::new(id, epoch, options),
        )
    }

    pub fn reserve_main_window(&mut self, conn: u32) -> u32 {
        let (sessions, connections) = (&self.sessions, &self.connections);
        let id = self.main_windows.enter_with(
            None,
            |id| sessions.valid(id) || connections.valid(id),
            |id| MainWindow { id, connection: conn },
        );
        if let Some(c) = self.connections.get_mut(conn) {
            c.main_window = Some(id);
        }
        id
    }

    /// Attach a transport to a connection: a writer draining its outlet and
    /// an optional reader feeding [`DaemonEvent::Input`].
    pub(crate) fn install_link<W, R>(&mut self, cid: u32, writer: W, reader: Option<(R, Vec<u8>)>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let epoch = self.next_epoch();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(rx, writer));
        let reader = reader.map(|(r, first)| spawn_reader(self.events.clone(), cid, epoch, r, first));
        if let Some(c) = self.connections.get_mut(cid) {
            c.epoch = epoch;
            c.link = Some(Link::new(tx, reader));
            c.last_input = Instant::now();
        }
    }

    /// Attach an outlet that forwards to a command client's stdout.
    pub(crate) fn install_reply_link(&mut self, cid: u32, reply: CommandReply, input: Option<(ClientInput, Vec<u8>)>) {
        let epoch = self.next_epoch();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let out = reply.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                out.out(bytes);
            }
        });
        let reader = input.map(|(r, first)| spawn_reader(self.events.clone(), cid, epoch, r, first));
        if let Some(c) = self.connections.get_mut(cid) {
            c.epoch = epoch;
            c.link = Some(Link::new(tx, reader));
            c.request = Some(reply);
            c.last_input = Instant::now();
        }
    }

    // ── Linking ─────────────────────────────────────────────────────

    pub fn link(&mut self, cid: u32, sid: u32) {
        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };
        session.link(cid);
        if session.detach_count > 0 {
            session.detach_count -= 1;
        }
        let viewers = session.connections.clone();
        let has_primary = viewers
            .iter()
            .filter(|&&c| c != cid)
            .any(|&c| self.connections.get(c).map(|c| c.primary).unwrap_or(false));
        if let Some(c) = self.connections.get_mut(cid) {
            c.session = Some(sid);
            c.primary = !has_primary;
            c.pane = 0;
            c.identity_pending = true;
        }
        if viewers.len() == 2 {
            for &v in &viewers {
                if let Some(c) = self.connections.get_mut(v) {
                    c.detach_save_pending = true;
                }
            }
        }
        self.dirty.extend(viewers);
        debug!(conn = cid, session = sid, "linked");
        self.maybe_grant(sid);
    }

    pub fn unlink(&mut self, cid: u32) {
        let Some(sid) = self.connections.get_mut(cid).and_then(|c| {
            c.primary = false;
            c.session.take()
        }) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };
        session.unlink(cid);
        let remaining = session.connections.clone();
        let had_primary = remaining
            .iter()
            .any(|&c| self.connections.get(c).map(|c| c.primary).unwrap_or(false));
        if !had_primary {
            if let Some(&next) = remaining.first() {
                if let Some(c) = self.connections.get_mut(next) {
                    c.primary = true;
                }
            }
        }
        if remaining.len() == 1 {
            if let Some(c) = self.connections.get_mut(remaining[0]) {
                c.detach_save_pending = true;
            }
        }
        self.dirty.extend(remaining);
        debug!(conn = cid, session = sid, "unlinked");
    }

    fn session_view(&self, sid: Option<u32>, excluding: u32) -> SessionView {
        match sid.and_then(|s| self.sessions.get(s)) {
            Some(s) => SessionView {
                other_viewers: s.connections.iter().filter(|&&c| c != excluding).count(),
                detach_count: s.detach_count,
            },
            None => SessionView { other_viewers: 0, detach_count: 0 },
        }
    }

    // ── Disconnects ─────────────────────────────────────────────────

    /// The transport of `cid` went away.
    pub fn transport_closed(&mut self, cid: u32) {
        let Some(c) = self.connections.get(cid) else {
            return;
        };
        let sid = c.session;
        let fate = retention::on_transport_closed(c.flags, c.proxy, self.session_view(sid, cid));
        debug!(conn = cid, ?fate, "transport closed");
        self.apply_fate(cid, sid, fate.connection, fate.session);
    }

    /// The viewer asked for window `cid` to be closed.
    pub fn close_window(&mut self, cid: u32) {
        let Some(c) = self.connections.get_mut(cid) else {
            return;
        };
        c.flags.close_requested = true;
        let (flags, proxy, sid) = (c.flags, c.proxy, c.session);
        let fate = retention::on_window_closed(flags, proxy, self.session_view(sid, cid));
        self.apply_fate(cid, sid, fate.connection, fate.session);
    }

    fn apply_fate(&mut self, cid: u32, sid: Option<u32>, conn: ConnectionFate, session: SessionFate) {
        match conn {
            ConnectionFate::Dormant => {
                if let Some(c) = self.connections.get_mut(cid) {
                    c.link = None;
                    c.ob.clear();
                    c.controls.clear();
                }
                return;
            }
            ConnectionFate::Destroy => self.destroy_connection(cid),
        }
        let Some(sid) = sid else {
            return;
        };
        match session {
            SessionFate::Keep => {}
            SessionFate::Detach => info!(session = sid, "session detached"),
            SessionFate::Close => {
                let sig = self.config.close_signal();
                self.close_session(sid, sig);
            }
        }
    }

    /// Remove a connection, failing any requests still waiting on it.
    pub fn destroy_connection(&mut self, cid: u32) {
        if !self.connections.valid(cid) {
            return;
        }
        self.unlink(cid);
        let Some(mut c) = self.connections.remove(cid) else {
            return;
        };
        for id in c.pending.ids() {
            if let Some(p) = c.pending.remove(id) {
                match p.close_response {
                    Some(text) => {
                        p.reply.out(text);
                        p.reply.finish(0);
                    }
                    None => {
                        p.reply.err(format!("Window {} closed before responding.\n", cid));
                        p.reply.finish(1);
                    }
                }
            }
        }
        if let Some(req) = c.request.take() {
            req.finish(0);
        }
        if let Some(mw) = c.main_window {
            self.main_windows.remove(mw);
        }
        if self.focused == Some(cid) {
            self.focused = None;
        }
        self.dirty.remove(&cid);
        debug!(conn = cid, "connection destroyed");
        self.maybe_exit();
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Spawn the child of a session that is still waiting for its first
    /// viewer handshake.
    pub fn start_session(&mut self, sid: u32) -> Result<()> {
        let version = env!("CARGO_PKG_VERSION");
        let daemon_pid = std::process::id();
        let Some(s) = self.sessions.get_mut(sid) else {
            return Ok(());
        };
        if s.state != SessionState::Starting {
            return Ok(());
        }
        s.command.set_env("TERM", "xterm-256color");
        s.command.set_env("COLORTERM", "truecolor");
        s.command
            .set_env("RELAY_MUX", &format!("version={version};session#={sid};pid={daemon_pid}"));
        let (fd, pid) = pty::spawn(&s.command, s.size, s.packet_mode)?;
        let master = pty::register(fd)?;
        s.pid = Some(pid);
        s.state = SessionState::Running;
        s.pty = Some(master.clone());
        if let Some((grants, input)) = s.take_io() {
            let tx = self.events.clone();
            let (epoch, mode) = (s.epoch, s.packet_mode);
            tokio::spawn(pty::read_loop(master.clone(), mode, grants, move |read| {
                tx.send(DaemonEvent::Pty { session: sid, epoch, read }).is_ok()
            }));
            tokio::spawn(pty::write_loop(master, input));
        }
        info!(session = sid, pid = pid.as_raw(), command = %s.command.display(), "session started");
        self.maybe_grant(sid);
        Ok(())
    }

    /// Ask the child to exit; it is force-killed if it is still around
    /// after the close timeout.
    pub fn close_session(&mut self, sid: u32, sig: Signal) {
        let timeout = self.config.close_timeout();
        let Some(s) = self.sessions.get_mut(sid) else {
            return;
        };
        match s.state {
            SessionState::Closing => return,
            SessionState::Starting => {
                self.finish_session(sid, 0);
                return;
            }
            SessionState::Running => {}
        }
        s.state = SessionState::Closing;
        let epoch = s.epoch;
        if let Some(pid) = s.pid {
            if let Err(e) = kill(pid, sig) {
                debug!(session = sid, error = %e, "close signal failed");
            }
        }
        info!(session = sid, signal = %sig, "closing session");
        self.schedule(timeout, Timer::ForceKill { session: sid, epoch });
        self.maybe_grant(sid);
    }

    /// Reap without blocking; finish the session once the child is gone.
    fn try_reap(&mut self, sid: u32) {
        let Some(s) = self.sessions.get(sid) else {
            return;
        };
        let Some(pid) = s.pid else {
            self.finish_session(sid, 0);
            return;
        };
        let epoch = s.epoch;
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if s.state == SessionState::Closing {
                    self.schedule(REAP_POLL, Timer::Reap { session: sid, epoch });
                } else {
                    // pty closed but the child lingers.
                    let sig = self.config.close_signal();
                    self.close_session(sid, sig);
                    self.schedule(REAP_POLL, Timer::Reap { session: sid, epoch });
                }
            }
            Ok(status) => self.finish_session(sid, exit_code(status)),
            Err(e) => {
                warn!(session = sid, error = %e, "waitpid failed");
                self.finish_session(sid, 255);
            }
        }
    }

    fn force_kill(&mut self, sid: u32) {
        let Some(pid) = self.sessions.get(sid).and_then(|s| s.pid) else {
            return;
        };
        warn!(session = sid, pid = pid.as_raw(), "child ignored close signal, killing");
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            debug!(session = sid, error = %e, "SIGKILL failed");
        }
        self.try_reap(sid);
    }

    /// Tear down a session whose child is gone.
    pub fn finish_session(&mut self, sid: u32, status: i32) {
        if !self.sessions.valid(sid) {
            return;
        }
        let Some(session) = self.sessions.remove(sid) else {
            return;
        };
        info!(session = sid, status, "session ended");
        let notice = match &session.transport {
            Some(t) if t.timed_out => LinkStatus::TimedOut,
            Some(_) if status == 255 => LinkStatus::Disconnected,
            _ => LinkStatus::Ended,
        };
        let code = status.clamp(0, 255) as u8;
        for cid in session.connections.iter().copied() {
            let Some(c) = self.connections.get_mut(cid) else {
                continue;
            };
            c.session = None;
            c.primary = false;
            match c.proxy {
                ProxyMode::CommandLocal | ProxyMode::Remote => {
                    if let Some(req) = c.request.take() {
                        req.finish(code);
                    }
                    self.destroy_connection(cid);
                }
                ProxyMode::None | ProxyMode::DisplayLocal => {
                    if c.is_dormant() {
                        self.destroy_connection(cid);
                        continue;
                    }
                    c.proxy = ProxyMode::None;
                    c.end_notice_sent = true;
                    if !session.is_transport() {
                        c.flags.keep_after_unexpected_close = false;
                    }
                    self.notify(cid, &codec::link_status(notice));
                }
            }
        }
        self.maybe_exit();
    }

    pub(crate) fn maybe_exit(&mut self) {
        if self.sessions.is_empty() && (self.stopping || self.connections.is_empty()) {
            self.exit_requested = true;
        }
    }

    pub fn shutdown(&mut self) {
        self.stopping = true;
        let sig = self.config.close_signal();
        for sid in self.sessions.ids() {
            self.close_session(sid, sig);
        }
        self.maybe_exit();
    }

    // ── Viewers ─────────────────────────────────────────────────────

    /// Bind a display-socket client to a connection and session.
    pub fn accept_viewer(&mut self, hello: ViewerHello) {
        let ViewerHello { request, stream, pending } = hello;
        let reuse = request
            .window
            .filter(|&w| self.connections.get(w).map(Connection::is_dormant).unwrap_or(false));
        let hint = request.window.or(request.session_number);
        let cid = match reuse {
            Some(w) => w,
            None => {
                let opts = self.default_options();
                self.create_connection(opts, hint)
            }
        };
        let (read, write) = stream.into_split();
        self.install_link(cid, write, Some((read, pending)));
        if let Some(c) = self.connections.get_mut(cid) {
            c.flags.keep_after_unexpected_close = request.keep_alive;
            c.flags.detach_on_disconnect = request.detach_on_disconnect;
        }
        if request.main_window && self.connections.get(cid).and_then(|c| c.main_window).is_none() {
            self.reserve_main_window(cid);
        }

        if reuse.is_none() && !request.no_session {
            let target = request.session_number.filter(|&s| self.sessions.valid(s));
            let sid = match target {
                Some(sid) => sid,
                None => {
                    let words = self.config.default_shell();
                    let cmd = CommandLine {
                        program: words[0].clone(),
                        args: words[1..].to_vec(),
                        cwd: std::env::var("HOME").unwrap_or_else(|_| "/".into()).into(),
                        env: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
                    };
                    self.create_session(cmd, None, true)
                }
            };
            let transport = self.sessions.get(sid).map(Session::is_transport).unwrap_or(false);
            if let Some(c) = self.connections.get_mut(cid) {
                c.proxy = if transport { ProxyMode::DisplayLocal } else { ProxyMode::None };
            }
            self.link(cid, sid);
        }

        match request.reconnect {
            Some(count) => {
                self.resume_at(cid, WrapCount::new(count));
            }
            None => {
                if let Some(c) = self.connections.get_mut(cid) {
                    c.reset_handshake(InitPhase::Fresh);
                }
            }
        }
        info!(conn = cid, session = ?self.connections.get(cid).and_then(|c| c.session), "viewer connected");
        self.mark_dirty(cid);
    }

    /// Resume a connection at `count`, the last byte count its peer
    /// acknowledged. A count behind what the connection already confirmed
    /// is a duplicate and is refused.
    pub fn resume_at(&mut self, cid: u32, count: WrapCount) -> bool {
        let Some(c) = self.connections.get_mut(cid) else {
            return false;
        };
        if c.phase == InitPhase::Ready && count.is_behind(c.confirmed) {
            warn!(conn = cid, count = count.get(), confirmed = c.confirmed.get(), "stale resume refused");
            return false;
        }
        c.sent = count;
        c.confirmed = count;
        c.ob.clear();
        c.reset_handshake(InitPhase::Resumed);
        self.dirty.insert(cid);
        true
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Resolve `$pid`, `#n`/`:n`, a plain number, or a session name.
    pub fn find_session(&self, spec: &str) -> Option<u32> {
        let spec = spec.trim();
        if let Some(pid) = spec.strip_prefix('$') {
            let pid: i32 = pid.parse().ok()?;
            return self.sessions.iter().find(|s| s.pid_raw() == pid).map(|s| s.id);
        }
        if let Some(n) = spec.strip_prefix('#').or_else(|| spec.strip_prefix(':')) {
            let n: u32 = n.parse().ok()?;
            return self.sessions.valid(n).then_some(n);
        }
        if !spec.is_empty() && spec.bytes().all(|b| b.is_ascii_digit()) {
            let n: u32 = spec.parse().ok()?;
            if self.sessions.valid(n) {
                return Some(n);
            }
            return self.connections.get(n).and_then(|c| c.session);
        }
        let mut matches = self
            .sessions
            .iter()
            .filter(|s| s.name.as_deref() == Some(spec));
        match (matches.next(), matches.next()) {
            (Some(s), None) => Some(s.id),
            _ => None,
        }
    }

    /// `.` is the focused window; otherwise a connection number.
    pub fn find_window(&self, spec: &str) -> Option<u32> {
        let id = match spec.trim() {
            "." => self.focused?,
            s => s.parse().ok()?,
        };
        self.connections.valid(id).then_some(id)
    }

    /// 1 when no other session carries the same name.
    pub(crate) fn name_unique(&self, sid: u32) -> u8 {
        let Some(name) = self.sessions.get(sid).and_then(|s| s.name.as_deref()) else {
            return 1;
        };
        let same = self
            .sessions
            .iter()
            .filter(|s| s.name.as_deref() == Some(name))
            .count();
        u8::from(same <= 1)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn live_conn(&self, conn: u32, epoch: u64) -> bool {
        self.connections.get(conn).map(|c| c.epoch == epoch).unwrap_or(false)
    }

    fn live_session(&self, sid: u32, epoch: u64) -> bool {
        self.sessions.get(sid).map(|s| s.epoch == epoch).unwrap_or(false)
    }

    pub fn dispatch(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Pty { session, epoch, read } if self.live_session(session, epoch) => match read {
                PtyRead::Data(data) => self.on_pty_output(session, &data),
                PtyRead::ModeChanged => self.on_pty_mode_changed(session),
                PtyRead::Control(_) => {
                    if let Some(s) = self.sessions.get_mut(session) {
                        s.read_granted = false;
                    }
                    self.maybe_grant(session);
                }
                PtyRead::Eof => {
                    if let Some(s) = self.sessions.get_mut(session) {
                        s.eof = true;
                        s.read_granted = true;
                    }
                    self.try_reap(session);
                }
            },
            DaemonEvent::Input { conn, epoch, bytes } if self.live_conn(conn, epoch) => {
                self.handle_input(conn, &bytes);
            }
            DaemonEvent::Closed { conn, epoch } if self.live_conn(conn, epoch) => {
                self.transport_closed(conn);
            }
            DaemonEvent::Viewer(hello) => self.accept_viewer(hello),
            DaemonEvent::Command(ctx) => self.run_command(ctx),
            DaemonEvent::Timer(timer) => self.on_timer(timer),
            DaemonEvent::Shutdown => {
                info!("shutdown requested");
                self.shutdown();
            }
            _ => debug!("dropped event for a stale session or connection"),
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ForceKill { session, epoch } if self.live_session(session, epoch) => {
                self.force_kill(session)
            }
            Timer::Reap { session, epoch } if self.live_session(session, epoch) => self.try_reap(session),
            Timer::Keepalive { conn, epoch } if self.live_conn(conn, epoch) => self.remote_keepalive(conn),
            Timer::TransportWatch { session, epoch } if self.live_session(session, epoch) => {
                self.watch_transport(session)
            }
            _ => {}
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<DaemonEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
            self.flush_dirty();
            if self.exit_requested {
                info!("no sessions left, exiting");
                break;
            }
        }
    }
}

pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 255,
    }
}

// ── I/O tasks ───────────────────────────────────────────────────────

async fn write_loop<W: AsyncWrite + Unpin>(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: W) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

pub(crate) fn spawn_reader<R>(
    tx: mpsc::UnboundedSender<DaemonEvent>,
    conn: u32,
    epoch: u64,
    mut reader: R,
    first: Vec<u8>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if !first.is_empty() && tx.send(DaemonEvent::Input { conn, epoch, bytes: first }).is_err() {
            return;
        }
        let mut buf = vec![0u8; READ_BUF];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let bytes = buf[..n].to_vec();
                    if tx.send(DaemonEvent::Input { conn, epoch, bytes }).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(DaemonEvent::Closed { conn, epoch });
    })
}

// ── Listeners ───────────────────────────────────────────────────────

/// Bind a Unix socket readable only by us, replacing a stale one.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(MuxError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("a daemon is already listening on {}", path.display()),
            )));
        }
        fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Read the viewer's CONNECT record, giving up after a timeout.
async fn read_connect(stream: &mut UnixStream) -> Option<(ConnectRequest, Vec<u8>)> {
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 4096];
    let result = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match codec::next_segment(&pending) {
                Some((Inbound::Event(ev), used)) if ev.name == "CONNECT" => {
                    let request = match ClientEvent::parse(&ev) {
                        Ok(ClientEvent::Connect(r)) => r,
                        _ => ConnectRequest::default(),
                    };
                    return Some((request, used));
                }
                Some(_) => return Some((ConnectRequest::default(), 0)),
                None => {}
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await;
    match result {
        Ok(Some((request, used))) => Some((request, pending.split_off(used))),
        Ok(None) => None,
        Err(_elapsed) => Some((ConnectRequest::default(), pending)),
    }
}

async fn accept_viewers(listener: UnixListener, tx: mpsc::UnboundedSender<DaemonEvent>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some((request, pending)) = read_connect(&mut stream).await {
                        let _ = tx.send(DaemonEvent::Viewer(ViewerHello { request, stream, pending }));
                    }
                });
            }
            Err(e) => warn!(error = %e, "display accept failed"),
        }
    }
}

async fn accept_commands(listener: UnixListener, tx: mpsc::UnboundedSender<DaemonEvent>, mode: StdioMode) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_command(stream, tx, mode).await {
                        warn!(error = %e, "command request failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "command accept failed"),
        }
    }
}

async fn serve_command(stream: UnixStream, tx: mpsc::UnboundedSender<DaemonEvent>, mode: StdioMode) -> Result<()> {
    let incoming = cmdsock::read_request(&stream).await?;
    debug!(argv = ?incoming.request.argv, "command request");
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let reply = CommandReply::new(reply_tx);
    let (read, write) = stream.into_split();
    let input = match incoming.stdio {
        Some([stdin, stdout, stderr]) => {
            let out = FdStream::new(stdout)?;
            let err = FdStream::new(stderr)?;
            tokio::spawn(cmdsock::write_replies(
                reply_rx,
                StdioMode::FdPassing.transport(),
                write,
                Some(out),
                Some(err),
            ));
            drop(read);
            ClientInput::Fd(FdStream::new(stdin)?)
        }
        None => {
            if mode == StdioMode::FdPassing {
                debug!("client sent no descriptors, answering multiplexed");
            }
            tokio::spawn(cmdsock::write_replies::<_, FdStream>(
                reply_rx,
                StdioMode::Multiplexed.transport(),
                write,
                None,
                None,
            ));
            ClientInput::Socket(read)
        }
    };
    let ctx = CommandContext::new(incoming.request, reply, Some((input, incoming.leftover)));
    tx.send(DaemonEvent::Command(ctx))
        .map_err(|_| MuxError::protocol("daemon is shutting down"))?;
    Ok(())
}

/// Run the daemon until it has nothing left to serve.
pub async fn serve(config: Config) -> Result<()> {
    config.ensure_data_dir()?;
    let display = bind_socket(&config.display_socket)?;
    let command = bind_socket(&config.command_socket)?;
    info!(
        command = %config.command_socket.display(),
        display = %config.display_socket.display(),
        "daemon listening"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(accept_viewers(display, tx.clone()));
    tokio::spawn(accept_commands(command, tx.clone(), config.stdio));

    let signal_tx = tx.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut term), Ok(mut int)) = (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) else {
            warn!("failed to install signal handlers");
            return;
        };
        loop {
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            if signal_tx.send(DaemonEvent::Shutdown).is_err() {
                return;
            }
        }
    });

    let config = Arc::new(config);
    DaemonState::new(config.clone(), tx).run(rx).await;
    tokio::time::sleep(EXIT_GRACE).await;

    let _ = fs::remove_file(&config.command_socket);
    let _ = fs::remove_file(&config.display_socket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    // ── Session close tests ─────────────────────────────────────────

    #[tokio::test]
    async fn force_kill_reaps_by_polling() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let (_cid, mut rx) = viewer(&mut t.state, sid);
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        let s = t.state.sessions.get_mut(sid).unwrap();
        s.pid = Some(pid);
        s.state = SessionState::Closing;

        t.state.force_kill(sid);
        let deadline = Instant::now() + Duration::from_secs(5);
        while t.state.sessions.valid(sid) && Instant::now() < deadline {
            tokio::time::sleep(REAP_POLL).await;
            t.state.try_reap(sid);
        }
        assert!(!t.state.sessions.valid(sid), "killed child was never reaped");
        t.state.flush_dirty();
        assert!(rx.text().contains("\x1b[99;99u"));
    }

    // ── Id allocation tests ─────────────────────────────────────────

    #[tokio::test]
    async fn far_out_connection_hint_is_not_honoured() {
        let mut t = TestDaemon::new();
        let opts = t.state.default_options();
        let cid = t.state.create_connection(opts, Some(4_000_000_000));
        assert_eq!(cid, 1);
        let opts = t.state.default_options();
        assert_eq!(t.state.create_connection(opts, Some(12)), 12);
    }
}
