//! What a connection is sent on each flush.
//!
//! A freshly attached viewer first gets the handshake (settings, child pid,
//! session name, a stored snapshot), then any history it missed wrapped in
//! replay markers, then the byte count it should continue from. After that
//! only new output, queued control sequences and pending requests go out.
//! Everything except session output is urgent-wrapped.

use tracing::debug;

use crate::codec::{self, push_urgent, LinkStatus};
use crate::connection::{InitPhase, WindowKind};
use crate::daemon::DaemonState;
use crate::mux::has_event_marker;
use crate::proxy::ProxyMode;
use crate::replay::strip_terminal_queries;
use crate::session::ContentsRequest;

impl DaemonState {
    pub fn compose_output(&mut self, cid: u32) -> Vec<u8> {
        let Some(c) = self.connections.get(cid) else {
            return Vec::new();
        };
        if c.is_dormant() {
            return Vec::new();
        }
        match c.proxy {
            ProxyMode::CommandLocal => return self.compose_relay(cid),
            ProxyMode::DisplayLocal => return self.compose_passthrough(cid),
            ProxyMode::None | ProxyMode::Remote => {}
        }
        let sid = c.session;
        let name_unique = sid.map(|s| self.name_unique(s)).unwrap_or(1);

        let Some(c) = self.connections.get_mut(cid) else {
            return Vec::new();
        };
        let mut session = sid.and_then(|s| self.sessions.get_mut(s));
        let mut out = Vec::new();

        if !c.settings_sent {
            c.settings_sent = true;
            if !c.options.settings.is_empty() {
                let json = c.options.settings.to_json();
                push_urgent(&mut out, codec::upload_settings(&json).as_bytes());
            }
        }

        if c.phase == InitPhase::Fresh {
            if !c.options.request_settings.is_empty() {
                let json = serde_json::Value::Object(c.options.request_settings.clone()).to_string();
                push_urgent(&mut out, codec::request_settings(&json).as_bytes());
            }
            if let Some(s) = session.as_deref_mut() {
                if s.pid.is_some() {
                    push_urgent(&mut out, codec::child_pid(s.pid_raw()).as_bytes());
                }
                if let Some(name) = &s.name {
                    push_urgent(&mut out, codec::session_name(name).as_bytes());
                }
                if let Some(snap) = s.snapshot.take() {
                    push_urgent(&mut out, codec::stored_snapshot(snap.count, &snap.blob()).as_bytes());
                    c.sent = snap.count;
                }
            }
        }

        if c.phase != InitPhase::Ready {
            if let Some(s) = session.as_deref() {
                let base = s.output_count.retreat(c.ob.len());
                if let Some(tail) = s.history.as_ref().and_then(|h| h.tail_since(c.sent)) {
                    let owed = &tail[..tail.len().saturating_sub(c.ob.len())];
                    if !owed.is_empty() {
                        debug!(conn = cid, len = owed.len(), "replaying history");
                        push_urgent(&mut out, codec::REPLAY_START.as_bytes());
                        out.extend_from_slice(&strip_terminal_queries(owed));
                        push_urgent(&mut out, codec::REPLAY_END.as_bytes());
                    }
                }
                c.sent = base;
                c.confirmed = base;
                push_urgent(&mut out, codec::replay_sync(base).as_bytes());
            }
        }

        if c.identity_pending {
            if let Some(sid) = sid {
                let seq = codec::window_identity(name_unique, sid, c.pane, cid);
                push_urgent(&mut out, seq.as_bytes());
            }
            c.identity_pending = false;
        }

        if c.detach_save_pending {
            c.detach_save_pending = false;
            if let Some(s) = session.as_deref() {
                let code = if s.connections.len() >= 2 {
                    0
                } else if s.detach_count != 0 {
                    2
                } else {
                    1
                };
                push_urgent(&mut out, codec::detach_save(code).as_bytes());
            }
        }

        if !c.ob.is_empty() {
            c.sent = c.sent.advance(c.ob.len());
            out.append(&mut c.ob);
        }
        out.append(&mut c.controls);

        for id in c.pending.ids() {
            if let Some(text) = c.pending.get_mut(id).and_then(|p| p.unsent.take()) {
                push_urgent(&mut out, codec::pending_request(&text).as_bytes());
            }
        }

        if let Some(s) = session.as_deref_mut() {
            if s.requesting_contents == ContentsRequest::Wanted && c.primary {
                push_urgent(&mut out, codec::REQUEST_CONTENTS.as_bytes());
                s.requesting_contents = ContentsRequest::Sent;
            }
        }

        if sid.is_none() && c.kind == WindowKind::Terminal && !c.end_notice_sent {
            push_urgent(&mut out, codec::link_status(LinkStatus::Ended).as_bytes());
            c.flags.keep_after_unexpected_close = false;
            c.end_notice_sent = true;
        }

        c.phase = InitPhase::Ready;
        out
    }

    /// A client invocation relaying a transport session sees raw output
    /// until the far side announces itself.
    fn compose_relay(&mut self, cid: u32) -> Vec<u8> {
        let Some(c) = self.connections.get_mut(cid) else {
            return Vec::new();
        };
        if has_event_marker(&c.ob) {
            return self.handoff(cid);
        }
        c.controls.clear();
        c.phase = InitPhase::Ready;
        c.sent = c.sent.advance(c.ob.len());
        std::mem::take(&mut c.ob)
    }

    /// A viewer of a tunneled session talks to the far daemon end to end;
    /// only local link notices are added.
    fn compose_passthrough(&mut self, cid: u32) -> Vec<u8> {
        let Some(c) = self.connections.get_mut(cid) else {
            return Vec::new();
        };
        c.phase = InitPhase::Ready;
        c.identity_pending = false;
        c.detach_save_pending = false;
        c.sent = c.sent.advance(c.ob.len());
        let mut out = std::mem::take(&mut c.controls);
        out.append(&mut c.ob);
        out
    }
}
