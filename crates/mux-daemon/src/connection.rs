//! One viewer or relay endpoint and its flow-control state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cmdsock::CommandReply;
use crate::commands::RequestOptions;
use crate::counter::WrapCount;
use crate::proxy::ProxyMode;
use crate::retention::LinkFlags;
use crate::slots::{SlotTable, Slotted};

/// How far the per-attach handshake has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitPhase {
    /// Nothing sent yet: settings, identity and snapshot go out first.
    Fresh,
    /// Reattached at a known count: only the replay tail is owed.
    Resumed,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Terminal,
    Browser,
}

/// The live transport of a connection. Dropping it aborts the reader task
/// and closes the outlet, which ends the writer task.
pub struct Link {
    pub outlet: mpsc::UnboundedSender<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    pub fn new(outlet: mpsc::UnboundedSender<Vec<u8>>, reader: Option<JoinHandle<()>>) -> Self {
        Self { outlet, reader }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// A window-driven request (`capture`, `await`) waiting for `RESPONSE`.
pub struct PendingRequest {
    pub id: u32,
    pub reply: CommandReply,
    /// Request text not yet delivered to the window.
    pub unsent: Option<String>,
    /// Printed with exit status 0 if the window goes away first; without it
    /// the request fails instead.
    pub close_response: Option<String>,
}

impl Slotted for PendingRequest {
    fn slot_id(&self) -> u32 {
        self.id
    }
}

/// Far-side details remembered by a viewer of a tunneled session, so a
/// dropped link can be re-established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLink {
    pub host: String,
    pub remote_session: Option<u32>,
}

pub struct Connection {
    pub id: u32,
    pub epoch: u64,
    pub session: Option<u32>,
    pub sent: WrapCount,
    pub confirmed: WrapCount,
    pub inbuf: Vec<u8>,
    /// Session output waiting for the next flush.
    pub ob: Vec<u8>,
    /// Urgent control sequences queued outside the counted output stream.
    pub controls: Vec<u8>,
    pub flags: LinkFlags,
    pub primary: bool,
    pub proxy: ProxyMode,
    pub phase: InitPhase,
    pub settings_sent: bool,
    pub pane: u32,
    pub identity_pending: bool,
    pub detach_save_pending: bool,
    pub version: Option<String>,
    pub kind: WindowKind,
    pub url: Option<String>,
    pub main_window: Option<u32>,
    pub end_notice_sent: bool,
    pub link: Option<Link>,
    pub options: Arc<RequestOptions>,
    pub pending: SlotTable<PendingRequest>,
    /// The client invocation this connection relays for, finished with the
    /// session's exit status.
    pub request: Option<CommandReply>,
    pub remote: Option<RemoteLink>,
    pub last_input: Instant,
}

impl Slotted for Connection {
    fn slot_id(&self) -> u32 {
        self.id
    }
}

impl Connection {
    pub fn new(id: u32, epoch: u64, options: Arc<RequestOptions>) -> Self {
        Self {
            id,
            epoch,
            session: None,
            sent: WrapCount::ZERO,
            confirmed: WrapCount::ZERO,
            inbuf: Vec::new(),
            ob: Vec::new(),
            controls: Vec::new(),
            flags: LinkFlags::default(),
            primary: false,
            proxy: ProxyMode::None,
            phase: InitPhase::Fresh,
            settings_sent: false,
            pane: 0,
            identity_pending: true,
            detach_save_pending: false,
            version: None,
            kind: WindowKind::Terminal,
            url: None,
            main_window: None,
            end_notice_sent: false,
            link: None,
            options,
            pending: SlotTable::new(),
            request: None,
            remote: None,
            last_input: Instant::now(),
        }
    }

    pub fn is_dormant(&self) -> bool {
        self.link.is_none()
    }

    /// Bytes handed to this connection that it has not acknowledged.
    pub fn unconfirmed(&self) -> u32 {
        self.sent.distance_from(self.confirmed)
    }

    /// Send bytes to the transport; false when there is none or it is gone.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() {
            return true;
        }
        match &self.link {
            Some(link) => link.outlet.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Restart the per-attach handshake, keeping counters.
    pub fn reset_handshake(&mut self, phase: InitPhase) {
        self.phase = phase;
        self.identity_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MASK;

    fn conn() -> Connection {
        Connection::new(1, 0, Arc::new(RequestOptions::default()))
    }

    #[test]
    fn unconfirmed_wraps() {
        let mut c = conn();
        c.confirmed = WrapCount::new(MASK);
        c.sent = WrapCount::new(2);
        assert_eq!(c.unconfirmed(), 3);
    }

    #[test]
    fn send_without_link_fails() {
        let c = conn();
        assert!(c.is_dormant());
        assert!(!c.send(b"x".to_vec()));
        assert!(c.send(Vec::new()));
    }

    #[tokio::test]
    async fn dropping_link_closes_outlet() {
        let mut c = conn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        c.link = Some(Link::new(tx, None));
        assert!(c.send(b"hi".to_vec()));
        c.link = None;
        assert_eq!(rx.recv().await.unwrap(), b"hi");
        assert!(rx.recv().await.is_none());
    }
}
