//! relay-mux: a daemon that keeps terminal sessions alive in ptys and
//! streams them to any number of viewer windows, plus the client that
//! hands it commands.

pub mod client;
pub mod cmdsock;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod counter;
pub mod daemon;
pub mod error;
pub mod event;
pub mod fdio;
pub mod inbound;
pub mod launcher;
pub mod mux;
pub mod outbound;
pub mod proxy;
pub mod pty;
pub mod replay;
pub mod retention;
pub mod session;
pub mod slots;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{MuxError, Result};
