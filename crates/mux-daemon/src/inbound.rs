//! Bytes arriving from a connection: keystrokes for the child interleaved
//! with event records.

use tracing::{debug, info, warn};

use crate::codec::{self, Inbound, RawEvent};
use crate::connection::InitPhase;
use crate::daemon::DaemonState;
use crate::event::{ClientEvent, WinSize};
use crate::proxy::{self, ProxyMode};
use crate::pty;
use crate::replay::Snapshot;
use crate::session::{ContentsRequest, SessionState};

/// Largest partial record kept while waiting for its terminator.
const MAX_PARTIAL: usize = 1 << 20;

enum Handled {
    Done,
    /// Pass the record through to the session unchanged.
    Forward,
    /// The connection broke the protocol or is gone.
    Stop,
}

impl DaemonState {
    pub fn handle_input(&mut self, cid: u32, bytes: &[u8]) {
        let Some(c) = self.connections.get_mut(cid) else {
            return;
        };
        c.last_input = std::time::Instant::now();
        if c.proxy == ProxyMode::CommandLocal {
            // Keystrokes from the client's terminal go straight down the tunnel.
            if let Some(s) = c.session.and_then(|sid| self.sessions.get(sid)) {
                s.write_input(bytes);
            }
            return;
        }
        let mut buf = std::mem::take(&mut c.inbuf);
        buf.extend_from_slice(bytes);

        let mut pos = 0;
        while let Some((segment, used)) = codec::next_segment(&buf[pos..]) {
            pos += used;
            let outcome = match segment {
                Inbound::Data(data) => {
                    self.write_to_session(cid, data);
                    Handled::Done
                }
                Inbound::Event(ev) => self.handle_event(cid, &ev),
            };
            match outcome {
                Handled::Done => {}
                Handled::Forward => {
                    let raw = &buf[pos - used..pos];
                    self.write_to_session(cid, raw);
                }
                Handled::Stop => return,
            }
        }

        let rest = buf.split_off(pos);
        if rest.len() > MAX_PARTIAL {
            warn!(conn = cid, len = rest.len(), "unterminated event record, dropping connection");
            self.transport_closed(cid);
            return;
        }
        if let Some(c) = self.connections.get_mut(cid) {
            c.inbuf = rest;
        }
    }

    fn write_to_session(&self, cid: u32, data: &[u8]) {
        let session = self
            .connections
            .get(cid)
            .and_then(|c| c.session)
            .and_then(|sid| self.sessions.get(sid));
        if let Some(s) = session {
            s.write_input(data);
        }
    }

    fn handle_event(&mut self, cid: u32, ev: &RawEvent<'_>) -> Handled {
        let Some(c) = self.connections.get(cid) else {
            return Handled::Stop;
        };
        if c.proxy == ProxyMode::DisplayLocal && c.session.is_some() && proxy::forwards_upstream(ev.name) {
            return Handled::Forward;
        }
        let event = match ClientEvent::parse(ev) {
            Ok(e) => e,
            Err(e) => {
                warn!(conn = cid, error = %e, "protocol violation, closing connection");
                self.destroy_connection(cid);
                return Handled::Stop;
            }
        };
        let sid = c.session;
        match event {
            ClientEvent::Resize(size) => self.on_resize(cid, size),
            ClientEvent::Key(key) => self.on_key(cid, &key),
            ClientEvent::Received(count) => self.on_received(cid, count),
            ClientEvent::Detach => {
                if let Some(s) = sid.and_then(|sid| self.sessions.get_mut(sid)) {
                    s.detach_count += 1;
                    let no_history = s.history.as_ref().map(|h| h.is_empty()).unwrap_or(true);
                    if no_history && s.requesting_contents == ContentsRequest::Idle {
                        s.requesting_contents = ContentsRequest::Wanted;
                    }
                    info!(session = s.id, "detach requested");
                }
                if let Some(sid) = sid {
                    self.mark_session_dirty(sid);
                }
            }
            ClientEvent::CloseWindow(window) => {
                let target = window.unwrap_or(cid);
                self.close_window(target);
                if !self.connections.valid(cid) {
                    return Handled::Stop;
                }
            }
            ClientEvent::Reconnect { session, last_ack } => self.reconnect(cid, session, last_ack),
            ClientEvent::WindowContents { count, blob } => {
                if let Some(s) = sid.and_then(|sid| self.sessions.get_mut(sid)) {
                    let stale = s.snapshot.as_ref().map(|old| count.is_behind(old.count)).unwrap_or(false);
                    if stale {
                        debug!(session = s.id, count = count.get(), "stale window contents ignored");
                    } else {
                        s.snapshot = Some(Snapshot::new(count, blob));
                        s.requesting_contents = ContentsRequest::Idle;
                    }
                }
                if let Some(sid) = sid {
                    self.trim_history(sid);
                }
            }
            ClientEvent::Version(version) => {
                if let Some(c) = self.connections.get_mut(cid) {
                    c.version = Some(version);
                    if c.phase == InitPhase::Ready {
                        c.phase = InitPhase::Fresh;
                    }
                }
                self.mark_dirty(cid);
                if let Some(sid) = sid {
                    let starting = self.sessions.get(sid).map(|s| s.state == SessionState::Starting);
                    if starting == Some(true) {
                        if let Err(e) = self.start_session(sid) {
                            warn!(session = sid, error = %e, "spawn failed");
                            let message = format!("\r\n[{e}]\r\n");
                            self.on_pty_output(sid, message.as_bytes());
                            self.finish_session(sid, 127);
                        }
                    }
                }
            }
            ClientEvent::Focused(window) => self.focused = Some(window),
            ClientEvent::WindowName(name) => {
                if let Some(s) = sid.and_then(|sid| self.sessions.get_mut(sid)) {
                    s.name = (!name.is_empty()).then_some(name);
                }
            }
            ClientEvent::SessionNumberEcho(n) => {
                if let Some(remote) = self.connections.get_mut(cid).and_then(|c| c.remote.as_mut()) {
                    remote.remote_session = Some(n);
                }
            }
            ClientEvent::Response(response) => {
                let pending = self
                    .connections
                    .get_mut(cid)
                    .filter(|c| c.pending.valid(response.id))
                    .and_then(|c| c.pending.remove(response.id));
                match pending {
                    Some(p) => {
                        if let Some(out) = response.out {
                            p.reply.out(out);
                        }
                        let code = match response.err {
                            Some(err) => {
                                p.reply.err(err);
                                1
                            }
                            None => 0,
                        };
                        p.reply.finish(code);
                    }
                    None => debug!(conn = cid, id = response.id, "response to unknown request"),
                }
            }
            ClientEvent::Connect(_) => {
                warn!(conn = cid, "CONNECT on an established connection, closing");
                self.destroy_connection(cid);
                return Handled::Stop;
            }
            ClientEvent::Unknown(name) => debug!(conn = cid, event = %name, "unknown event ignored"),
        }
        if self.connections.valid(cid) {
            Handled::Done
        } else {
            Handled::Stop
        }
    }

    /// Only the primary viewer sizes the pty; everyone is told the result.
    fn on_resize(&mut self, cid: u32, size: WinSize) {
        let Some(c) = self.connections.get(cid) else {
            return;
        };
        let Some(sid) = c.session.filter(|_| c.primary) else {
            return;
        };
        let Some(s) = self.sessions.get_mut(sid) else {
            return;
        };
        s.size = size;
        if let Some(master) = &s.pty {
            pty::resize(pty::borrow(master), size);
        }
        let echo = codec::size_echo(size.rows, size.cols);
        let viewers = s.connections.clone();
        for v in viewers {
            self.notify(v, &echo);
        }
    }

    fn on_key(&mut self, cid: u32, key: &[u8]) {
        let Some(sid) = self.connections.get(cid).and_then(|c| c.session) else {
            return;
        };
        let Some(s) = self.sessions.get(sid) else {
            return;
        };
        let mut echo_interrupt = false;
        if let Some(master) = &s.pty {
            let fd = pty::borrow(master);
            if s.packet_mode == pty::PacketMode::Extproc {
                if let Some(sig) = pty::key_signal(fd, key) {
                    if let Err(e) = pty::signal_foreground(fd, sig) {
                        debug!(session = sid, error = %e, "signal delivery failed");
                    }
                    echo_interrupt = sig == nix::sys::signal::Signal::SIGINT;
                }
            }
            if s.paused && pty::is_interrupt(fd, key) {
                let dropped = pty::drain_pending(fd);
                debug!(session = sid, dropped, "discarded queued output on interrupt");
            }
        }
        if echo_interrupt {
            self.on_pty_output(sid, b"^C");
            return;
        }
        s.write_input(key);
    }
}
