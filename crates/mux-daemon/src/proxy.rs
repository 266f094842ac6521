//! Sessions reached through an ssh tunnel.
//!
//! Locally the tunnel is an ssh child in a transport session. Until the far
//! daemon announces itself its output is relayed raw to the client that
//! asked for it (password prompts and the like). After that a real viewer
//! window takes over and talks to the far daemon end to end. On the far
//! side the client's stdio is the viewer link of a remote proxy connection.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cmdsock::CommandReply;
use crate::codec::{self, LinkStatus};
use crate::commands::{ClientInput, DisplayChoice, RequestOptions};
use crate::connection::{InitPhase, RemoteLink};
use crate::counter::WrapCount;
use crate::daemon::{DaemonState, Timer};
use crate::error::Result;
use crate::pty::{self, CommandLine, PacketMode};
use crate::session::Transport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyMode {
    #[default]
    None,
    /// Client stdio relaying a transport session before handoff.
    CommandLocal,
    /// Viewer of a transport session; its events go to the far daemon.
    DisplayLocal,
    /// Far side: client stdio acting as a viewer.
    Remote,
}

/// Events a local viewer of a tunneled session passes through untouched.
pub const FORWARDED_EVENTS: &[&str] = &[
    "WS",
    "VERSION",
    "RECEIVED",
    "KEY",
    "DETACH",
    "CLOSE-WINDOW",
    "WINDOW-CONTENTS",
    "FOCUSED",
    "RESPONSE",
];

pub fn forwards_upstream(name: &str) -> bool {
    FORWARDED_EVENTS.contains(&name)
}

/// First record the far side writes into the tunnel.
pub const REMOTE_WINDOW: &str = "REMOTE-WINDOW";
/// Written into the tunnel to keep the far side's input timer happy.
pub const KEEPALIVE: &str = "KEEPALIVE";

/// Who sees the tunnel's output before the far side takes over.
pub enum TunnelRelay {
    /// A client invocation, e.g. `relay-mux user@host`.
    Client {
        reply: CommandReply,
        input: Option<(ClientInput, Vec<u8>)>,
    },
    /// An existing viewer re-establishing a dropped link.
    Viewer(u32),
}

impl DaemonState {
    /// Start `ssh HOST relay-mux --browser-pipe ARGS..` as a transport
    /// session relayed to `relay`.
    pub fn open_tunnel(
        &mut self,
        host: &str,
        args: Vec<String>,
        options: Arc<RequestOptions>,
        relay: TunnelRelay,
    ) -> Result<u32> {
        let mut remote_args = vec![host.to_string(), self.config.remote_command(), "--browser-pipe".into()];
        remote_args.extend(args);
        let command = CommandLine {
            program: self.config.ssh_command(),
            args: remote_args,
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        };
        let sid = self.create_session(command, None, false);
        if let Some(s) = self.sessions.get_mut(sid) {
            s.packet_mode = PacketMode::Off;
            s.transport = Some(Transport {
                host: host.to_string(),
                last_output: Instant::now(),
                timed_out: false,
            });
        }
        if let Err(e) = self.start_session(sid) {
            self.finish_session(sid, 127);
            return Err(e);
        }

        let remote = RemoteLink { host: host.to_string(), remote_session: None };
        let cid = match relay {
            TunnelRelay::Client { reply, input } => {
                let cid = self.create_connection(options, None);
                self.install_reply_link(cid, reply, input);
                cid
            }
            TunnelRelay::Viewer(cid) => cid,
        };
        if let Some(c) = self.connections.get_mut(cid) {
            c.proxy = ProxyMode::CommandLocal;
            c.remote = Some(remote);
        }
        self.link(cid, sid);
        info!(session = sid, conn = cid, host, "tunnel started");

        let timings = self.config.remote_timings();
        let epoch = self.sessions.get(sid).map(|s| s.epoch).unwrap_or(0);
        self.schedule(timings.input_interval, Timer::TransportWatch { session: sid, epoch });
        Ok(sid)
    }

    /// The far side announced itself: stop relaying raw output and let a
    /// viewer speak to it directly.
    pub(crate) fn handoff(&mut self, cid: u32) -> Vec<u8> {
        let Some(c) = self.connections.get_mut(cid) else {
            return Vec::new();
        };
        let Some(sid) = c.session else {
            return Vec::new();
        };
        if let Some(master) = self.sessions.get(sid).and_then(|s| s.pty.as_ref()) {
            if let Err(e) = pty::set_raw(pty::borrow(master)) {
                warn!(session = sid, error = %e, "could not make tunnel pty raw");
            }
        }

        let Some(reply) = c.request.take() else {
            // A reconnecting viewer: convert in place.
            c.proxy = ProxyMode::DisplayLocal;
            c.phase = InitPhase::Ready;
            c.sent = c.sent.advance(c.ob.len());
            let mut out = codec::urgent_wrap(codec::link_status(LinkStatus::Reconnected).as_bytes());
            out.append(&mut c.ob);
            info!(session = sid, conn = cid, "tunnel reconnected");
            return out;
        };

        let pending = std::mem::take(&mut c.ob);
        let remote = c.remote.clone();
        let mut options = (*c.options).clone();
        if matches!(options.display, DisplayChoice::Detached | DisplayChoice::BrowserPipe) {
            options.display = DisplayChoice::PrintUrl;
        }
        let options = Arc::new(options);

        // The relay connection ends here without closing the session.
        self.destroy_connection(cid);
        let launched = self.launch_window(options, &reply, sid, |w| {
            w.proxy = ProxyMode::DisplayLocal;
            w.remote = remote;
            w.ob = pending;
        });
        match launched {
            Ok(window) => {
                info!(session = sid, window, "tunnel handed to viewer window");
                reply.finish(0);
            }
            Err(e) => {
                reply.err(format!("relay-mux: {e}\n"));
                reply.finish(1);
                let sig = self.config.close_signal();
                self.close_session(sid, sig);
            }
        }
        Vec::new()
    }

    /// Far side: serve session `sid` over the client's stdio.
    pub fn display_pipe_session(
        &mut self,
        sid: u32,
        options: Arc<RequestOptions>,
        reply: CommandReply,
        input: Option<(ClientInput, Vec<u8>)>,
        resume: Option<WrapCount>,
    ) -> u32 {
        let cid = self.create_connection(options, None);
        self.install_reply_link(cid, reply, input);
        if let Some(c) = self.connections.get_mut(cid) {
            c.proxy = ProxyMode::Remote;
            c.flags.detach_on_disconnect = true;
            if let Ok(hello) = codec::encode_event(REMOTE_WINDOW, b"") {
                c.send(hello);
            }
        }
        self.link(cid, sid);
        match resume {
            Some(count) => {
                self.resume_at(cid, count);
            }
            None => {
                if let Some(c) = self.connections.get_mut(cid) {
                    c.reset_handshake(InitPhase::Fresh);
                }
            }
        }
        self.mark_dirty(cid);
        let epoch = self.connections.get(cid).map(|c| c.epoch).unwrap_or(0);
        let interval = self.config.remote_timings().output_interval;
        self.schedule(interval, Timer::Keepalive { conn: cid, epoch });
        info!(session = sid, conn = cid, resumed = resume.is_some(), "serving session over stdio");
        cid
    }

    /// `RECONNECT session,count` from a viewer whose tunnel died.
    pub fn reconnect(&mut self, cid: u32, remote_session: u32, last_ack: WrapCount) {
        let Some(c) = self.connections.get(cid) else {
            return;
        };
        if c.session.is_some() {
            debug!(conn = cid, "reconnect while still linked, ignored");
            return;
        }
        let Some(remote) = c.remote.clone() else {
            warn!(conn = cid, "reconnect from a window that never had a tunnel");
            return;
        };
        let options = c.options.clone();
        let args = vec!["reattach".to_string(), format!("{remote_session},{last_ack}")];
        self.notify(cid, &codec::link_status(LinkStatus::Reconnecting));
        if let Err(e) = self.open_tunnel(&remote.host, args, options, TunnelRelay::Viewer(cid)) {
            warn!(conn = cid, host = %remote.host, error = %e, "reconnect failed");
            self.notify(cid, &codec::link_status(LinkStatus::Disconnected));
        }
    }

    /// Far side: keep the tunnel busy, and drop it when the near side has
    /// gone quiet for too long.
    pub(crate) fn remote_keepalive(&mut self, cid: u32) {
        let timings = self.config.remote_timings();
        let Some(c) = self.connections.get(cid) else {
            return;
        };
        if c.proxy != ProxyMode::Remote {
            return;
        }
        if c.last_input.elapsed() > timings.input_timeout {
            warn!(conn = cid, "no input through tunnel, dropping it");
            self.transport_closed(cid);
            return;
        }
        c.send(codec::urgent_wrap(b""));
        let epoch = c.epoch;
        self.schedule(timings.output_interval, Timer::Keepalive { conn: cid, epoch });
    }

    /// Near side: give up on a tunnel whose output stalled, otherwise
    /// send a keepalive once a viewer owns it.
    pub(crate) fn watch_transport(&mut self, sid: u32) {
        let timings = self.config.remote_timings();
        let Some(s) = self.sessions.get_mut(sid) else {
            return;
        };
        let Some(t) = s.transport.as_mut() else {
            return;
        };
        if let Some(limit) = timings.output_timeout {
            if t.last_output.elapsed() > limit {
                warn!(session = sid, host = %t.host, "tunnel output timed out");
                t.timed_out = true;
                let sig = self.config.close_signal();
                self.close_session(sid, sig);
                return;
            }
        }
        let handed_off = s.connections.iter().any(|&c| {
            self.connections
                .get(c)
                .map(|c| c.proxy == ProxyMode::DisplayLocal)
                .unwrap_or(false)
        });
        if handed_off {
            if let Ok(record) = codec::encode_event(KEEPALIVE, b"") {
                s.write_input(&record);
            }
        }
        let epoch = s.epoch;
        self.schedule(timings.input_interval, Timer::TransportWatch { session: sid, epoch });
    }
}
