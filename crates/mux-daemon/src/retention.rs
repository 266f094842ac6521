//! What happens to a connection, and its session, when the viewer's link
//! goes away.
//!
//! Three per-connection flags feed this: the viewer asked to close the
//! window, the viewer asked to be kept around for a reconnect after an
//! unexpected drop, and the viewer asked for its session to stay detached
//! when it drops. They are folded into one [`DisconnectFate`] here.

use crate::proxy::ProxyMode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkFlags {
    pub close_requested: bool,
    pub keep_after_unexpected_close: bool,
    pub detach_on_disconnect: bool,
}

/// Outcome for the connection whose transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFate {
    /// Keep the connection, linked and without a transport, so the same
    /// window can reconnect and resume.
    Dormant,
    /// Unlink and destroy the connection.
    Destroy,
}

/// Outcome for the session the connection was linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFate {
    Keep,
    /// Keep it running with nobody attached.
    Detach,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectFate {
    pub connection: ConnectionFate,
    pub session: SessionFate,
}

/// Everything besides the flags that the decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionView {
    /// Other connections still linked to the session.
    pub other_viewers: usize,
    /// Outstanding `DETACH` allowances.
    pub detach_count: u32,
}

pub fn on_transport_closed(flags: LinkFlags, mode: ProxyMode, view: SessionView) -> DisconnectFate {
    use ConnectionFate::*;
    use SessionFate::*;

    if flags.keep_after_unexpected_close && !flags.close_requested {
        return DisconnectFate { connection: Dormant, session: Keep };
    }
    let session = match mode {
        // A relay viewer owns the transport session; nothing else can reach it.
        ProxyMode::DisplayLocal => Close,
        // The client invocation relaying the transport went away. A handed
        // over relay never gets here: it is destroyed directly.
        ProxyMode::CommandLocal => Close,
        ProxyMode::None | ProxyMode::Remote => {
            if view.other_viewers > 0 || view.detach_count > 0 {
                Keep
            } else if flags.close_requested {
                Close
            } else if flags.detach_on_disconnect {
                Detach
            } else {
                Close
            }
        }
    };
    DisconnectFate { connection: Destroy, session }
}

/// A window closed on purpose (`CLOSE-WINDOW`) uses the same table with the
/// close flag forced on.
pub fn on_window_closed(flags: LinkFlags, mode: ProxyMode, view: SessionView) -> DisconnectFate {
    on_transport_closed(
        LinkFlags { close_requested: true, ..flags },
        mode,
        view,
    )
}
