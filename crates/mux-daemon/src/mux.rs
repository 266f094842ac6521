//! Output fan-out and credit-based flow control.
//!
//! The pty is read only while a grant is outstanding. A grant is sized from
//! the slowest viewer: the session pauses once any viewer has
//! [`PAUSE_AT`] bytes outstanding and resumes when every viewer is back
//! under [`RESUME_BELOW`].

use std::time::Instant;

use tracing::{debug, trace};

use crate::codec;
use crate::connection::{Connection, InitPhase};
use crate::daemon::DaemonState;
use crate::proxy::ProxyMode;
use crate::pty;
use crate::session::SessionState;

pub const PAUSE_AT: u32 = 8000;
pub const RESUME_BELOW: u32 = 4000;
/// Cap on session output buffered for one connection between flushes.
pub const OB_LIMIT: usize = 64 * 1024;

/// Whether a viewer's acknowledgements hold back the session.
fn throttles(c: &Connection) -> bool {
    !c.is_dormant() && c.phase == InitPhase::Ready && !matches!(c.proxy, ProxyMode::CommandLocal)
}

impl DaemonState {
    /// Largest outstanding byte count over the viewers of `sid`.
    pub fn max_unconfirmed(&self, sid: u32) -> u32 {
        let Some(s) = self.sessions.get(sid) else {
            return 0;
        };
        s.connections
            .iter()
            .filter_map(|&c| self.connections.get(c))
            .filter(|c| throttles(c))
            .map(|c| c.unconfirmed().saturating_add(c.ob.len() as u32))
            .max()
            .unwrap_or(0)
    }

    /// Bytes the next pty read may return; 0 means pause.
    pub fn read_budget(&self, sid: u32) -> usize {
        let Some(s) = self.sessions.get(sid) else {
            return 0;
        };
        let active: Vec<&Connection> = s
            .connections
            .iter()
            .filter_map(|&c| self.connections.get(c))
            .filter(|c| !c.is_dormant())
            .collect();
        if active.is_empty() {
            return 0;
        }
        let room = active
            .iter()
            .map(|c| OB_LIMIT.saturating_sub(c.ob.len()))
            .min()
            .unwrap_or(0);
        if s.is_transport() {
            return room;
        }
        let headroom = PAUSE_AT.saturating_sub(self.max_unconfirmed(sid)) as usize;
        room.min(headroom)
    }

    /// Hand the pty reader a new grant if one is due.
    pub fn maybe_grant(&mut self, sid: u32) {
        let closing = match self.sessions.get(sid) {
            Some(s) if s.read_granted || s.eof => return,
            Some(s) => match s.state {
                SessionState::Starting => return,
                SessionState::Running => false,
                SessionState::Closing => true,
            },
            None => return,
        };
        let held = self
            .sessions
            .get(sid)
            .map(|s| s.paused && !s.is_transport())
            .unwrap_or(false);
        if !closing && held && self.max_unconfirmed(sid) >= RESUME_BELOW {
            return;
        }
        let budget = if closing {
            pty::READ_CHUNK
        } else {
            self.read_budget(sid)
        };
        let Some(s) = self.sessions.get_mut(sid) else {
            return;
        };
        if budget == 0 {
            if !s.paused {
                debug!(session = sid, "output paused");
            }
            s.paused = true;
            return;
        }
        if s.paused {
            debug!(session = sid, "output resumed");
        }
        s.paused = false;
        s.read_granted = s.grant_tx.send(budget).is_ok();
    }

    /// New bytes from the child: count them, keep them for replay and queue
    /// them for every attached viewer.
    pub fn on_pty_output(&mut self, sid: u32, data: &[u8]) {
        let Some(s) = self.sessions.get_mut(sid) else {
            return;
        };
        s.read_granted = false;
        s.output_count = s.output_count.advance(data.len());
        if let Some(h) = s.history.as_mut() {
            h.append(data);
        }
        if let Some(t) = s.transport.as_mut() {
            t.last_output = Instant::now();
        }
        trace!(session = sid, len = data.len(), "pty output");
        let viewers = s.connections.clone();
        for cid in viewers {
            if let Some(c) = self.connections.get_mut(cid) {
                if !c.is_dormant() {
                    c.ob.extend_from_slice(data);
                    self.dirty.insert(cid);
                }
            }
        }
        self.maybe_grant(sid);
    }

    /// Packet mode reported a termios change; tell the viewers.
    pub fn on_pty_mode_changed(&mut self, sid: u32) {
        let report = self.sessions.get_mut(sid).and_then(|s| {
            s.read_granted = false;
            let master = s.pty.as_ref()?;
            pty::mode_report(pty::borrow(master), s.packet_mode)
        });
        if let Some(report) = report {
            let viewers = self.sessions.get(sid).map(|s| s.connections.clone()).unwrap_or_default();
            for cid in viewers {
                self.notify(cid, &report);
            }
        }
        self.maybe_grant(sid);
    }

    /// `RECEIVED n`: the viewer has processed output up to `n`.
    pub fn on_received(&mut self, cid: u32, count: crate::counter::WrapCount) {
        let Some(c) = self.connections.get_mut(cid) else {
            return;
        };
        c.confirmed = count;
        let Some(sid) = c.session else {
            return;
        };
        let paused = self.sessions.get(sid).map(|s| s.paused).unwrap_or(false);
        if paused && self.max_unconfirmed(sid) < RESUME_BELOW {
            self.maybe_grant(sid);
        }
        self.trim_history(sid);
    }

    /// Drop history nobody can ask for any more: everything older than the
    /// least-confirmed viewer and the stored snapshot.
    pub fn trim_history(&mut self, sid: u32) {
        let Some(s) = self.sessions.get(sid) else {
            return;
        };
        let Some(read_count) = s.history.as_ref().map(|h| h.read_count()) else {
            return;
        };
        let viewers = s
            .connections
            .iter()
            .filter_map(|&c| self.connections.get(c))
            .filter(|c| c.phase != InitPhase::Fresh)
            .map(|c| read_count.distance_from(c.confirmed));
        let snapshot = s.snapshot.as_ref().map(|snap| read_count.distance_from(snap.count));
        let max = viewers.chain(snapshot).max().unwrap_or(0);
        if let Some(h) = self.sessions.get_mut(sid).and_then(|s| s.history.as_mut()) {
            h.trim(max);
        }
    }

    /// Compose and send whatever each marked connection is owed.
    pub fn flush_dirty(&mut self) {
        while let Some(cid) = self.dirty.pop_first() {
            let bytes = self.compose_output(cid);
            let session = self.connections.get(cid).and_then(|c| {
                c.send(bytes);
                c.session
            });
            if let Some(sid) = session {
                self.maybe_grant(sid);
            }
        }
    }
}

/// Whether a byte stream carries an event record marker.
pub(crate) fn has_event_marker(data: &[u8]) -> bool {
    data.contains(&codec::EVENT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::WrapCount;
    use crate::testing::*;

    // ── Fan-out tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn output_reaches_every_viewer_in_order() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        let (a, mut rx_a) = viewer(&mut t.state, sid);
        let (b, mut rx_b) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        rx_a.drain();
        rx_b.drain();
        assert!(io.grants.try_recv().is_ok());

        t.state.on_pty_output(sid, b"one ");
        t.state.on_pty_output(sid, b"two");
        t.state.flush_dirty();
        assert_eq!(rx_a.text(), "one two");
        assert_eq!(rx_b.text(), "one two");
        let count = t.state.sessions.get(sid).unwrap().output_count;
        assert_eq!(count.get(), 7);
        assert_eq!(t.state.connections.get(a).unwrap().sent, count);
        assert_eq!(t.state.connections.get(b).unwrap().sent, count);
    }

    #[tokio::test]
    async fn dormant_viewers_are_skipped() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let (a, _rx) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        t.state.connections.get_mut(a).unwrap().link = None;
        t.state.on_pty_output(sid, b"lost");
        assert!(t.state.connections.get(a).unwrap().ob.is_empty());
    }

    // ── Flow control tests ──────────────────────────────────────────

    #[tokio::test]
    async fn pauses_at_limit_and_resumes_below_half() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        let (a, mut rx) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        rx.drain();
        io.grants.drain();

        let chunk = vec![b'x'; 4000];
        t.state.on_pty_output(sid, &chunk);
        t.state.flush_dirty();
        assert!(!t.state.sessions.get(sid).unwrap().paused);
        t.state.on_pty_output(sid, &chunk);
        t.state.flush_dirty();
        assert!(t.state.sessions.get(sid).unwrap().paused);
        io.grants.drain();

        // 5000 outstanding: still above the resume mark.
        t.state.on_received(a, WrapCount::new(3000));
        assert!(t.state.sessions.get(sid).unwrap().paused);
        assert!(io.grants.try_recv().is_err());

        t.state.on_received(a, WrapCount::new(4500));
        assert!(!t.state.sessions.get(sid).unwrap().paused);
        assert_eq!(io.grants.try_recv().unwrap(), 4500);
    }

    #[tokio::test]
    async fn unrelated_flush_does_not_end_a_pause() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        let (a, mut rx) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        rx.drain();
        io.grants.drain();

        t.state.on_pty_output(sid, &[b'x'; 8000]);
        t.state.flush_dirty();
        assert!(t.state.sessions.get(sid).unwrap().paused);
        io.grants.drain();

        t.state.on_received(a, WrapCount::new(3000));
        t.state.notify(a, "\x1b[82;0u");
        t.state.mark_dirty(a);
        t.state.flush_dirty();
        assert!(t.state.sessions.get(sid).unwrap().paused);
        assert!(io.grants.try_recv().is_err());
        assert_eq!(t.state.max_unconfirmed(sid), 5000);

        t.state.on_received(a, WrapCount::new(4001));
        assert!(!t.state.sessions.get(sid).unwrap().paused);
        assert_eq!(io.grants.try_recv().unwrap(), 4001);
    }

    #[tokio::test]
    async fn slow_viewer_holds_the_pause() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        let (fast, _rf) = viewer(&mut t.state, sid);
        let (slow, _rs) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        io.grants.drain();

        t.state.on_pty_output(sid, &[b'q'; 8000]);
        t.state.flush_dirty();
        assert!(t.state.sessions.get(sid).unwrap().paused);
        io.grants.drain();

        t.state.on_received(fast, WrapCount::new(8000));
        t.state.mark_dirty(fast);
        t.state.flush_dirty();
        assert!(t.state.sessions.get(sid).unwrap().paused);
        assert!(io.grants.try_recv().is_err());

        t.state.on_received(slow, WrapCount::new(6000));
        assert!(!t.state.sessions.get(sid).unwrap().paused);
        assert_eq!(io.grants.try_recv().unwrap(), 6000);
    }

    #[tokio::test]
    async fn slowest_viewer_bounds_the_grant() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        let (a, _ra) = viewer(&mut t.state, sid);
        let (b, _rb) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        io.grants.drain();

        t.state.on_pty_output(sid, &[b'y'; 3000]);
        t.state.flush_dirty();
        t.state.on_received(a, WrapCount::new(3000));
        assert_eq!(t.state.connections.get(b).unwrap().unconfirmed(), 3000);
        assert_eq!(t.state.read_budget(sid), 5000);
    }

    #[tokio::test]
    async fn no_viewers_means_paused() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        t.state.maybe_grant(sid);
        assert!(t.state.sessions.get(sid).unwrap().paused);
        assert!(io.grants.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_sessions_ignore_acknowledgements() {
        let mut t = TestDaemon::new();
        let (sid, mut io) = running_session(&mut t.state);
        t.state.sessions.get_mut(sid).unwrap().transport = Some(crate::session::Transport {
            host: "h".into(),
            last_output: Instant::now(),
            timed_out: false,
        });
        let (_a, _rx) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        io.grants.drain();
        t.state.on_pty_output(sid, &[b'z'; 9000]);
        t.state.flush_dirty();
        assert!(!t.state.sessions.get(sid).unwrap().paused);
        assert!(io.grants.try_recv().is_ok());
    }

    // ── Trimming tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn history_kept_for_least_confirmed_viewer() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let (a, _ra) = viewer(&mut t.state, sid);
        let (b, _rb) = viewer(&mut t.state, sid);
        t.state.flush_dirty();
        t.state.on_pty_output(sid, &[b'a'; 3000]);
        t.state.flush_dirty();
        t.state.on_received(a, WrapCount::new(3000));
        t.state.on_received(b, WrapCount::new(600));
        // 2400 still owed to b is over two thirds of the buffer: no trim.
        assert_eq!(t.state.sessions.get(sid).unwrap().history.as_ref().unwrap().len(), 3000);
        t.state.on_received(b, WrapCount::new(1500));
        let h = t.state.sessions.get(sid).unwrap().history.as_ref().unwrap();
        assert_eq!(h.len(), 1500);
        assert!(h.tail_since(WrapCount::new(1500)).is_some());
        assert!(h.tail_since(WrapCount::new(600)).is_none());
    }
}
