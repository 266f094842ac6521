//! Typed view of viewer event records.

use serde::Deserialize;

use crate::codec::RawEvent;
use crate::counter::WrapCount;
use crate::error::{MuxError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Resize(WinSize),
    Key(Vec<u8>),
    Received(WrapCount),
    Detach,
    CloseWindow(Option<u32>),
    Reconnect { session: u32, last_ack: WrapCount },
    WindowContents { count: WrapCount, blob: String },
    Version(String),
    Focused(u32),
    WindowName(String),
    SessionNumberEcho(u32),
    Response(Response),
    Connect(ConnectRequest),
    Unknown(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
    pub pix_height: u16,
    pub pix_width: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Response {
    pub id: u32,
    #[serde(default)]
    pub out: Option<String>,
    #[serde(default)]
    pub err: Option<String>,
}

/// First record a viewer sends on the display socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectRequest {
    pub session_number: Option<u32>,
    pub window: Option<u32>,
    /// Last byte count this viewer acknowledged before it lost the link.
    pub reconnect: Option<u32>,
    pub no_session: bool,
    pub main_window: bool,
    pub keep_alive: bool,
    pub detach_on_disconnect: bool,
}

impl ClientEvent {
    pub fn parse(ev: &RawEvent<'_>) -> Result<Self> {
        let text = ev.payload_str();
        let bad = || MuxError::protocol(format!("malformed {} payload: {:?}", ev.name, text));
        Ok(match ev.name {
            "WS" => {
                let nums: Vec<u16> = text
                    .split_whitespace()
                    .map(|w| w.parse::<u16>())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| bad())?;
                if nums.len() < 2 {
                    return Err(bad());
                }
                ClientEvent::Resize(WinSize {
                    rows: nums[0],
                    cols: nums[1],
                    pix_height: nums.get(2).copied().unwrap_or(0),
                    pix_width: nums.get(3).copied().unwrap_or(0),
                })
            }
            "KEY" => ClientEvent::Key(parse_key(text).ok_or_else(bad)?),
            "RECEIVED" => ClientEvent::Received(WrapCount::parse(text).ok_or_else(bad)?),
            "DETACH" => ClientEvent::Detach,
            "CLOSE-WINDOW" => {
                let t = text.trim();
                if t.is_empty() {
                    ClientEvent::CloseWindow(None)
                } else {
                    ClientEvent::CloseWindow(Some(t.parse().map_err(|_| bad())?))
                }
            }
            "RECONNECT" => {
                let (s, a) = text.trim().split_once(',').ok_or_else(bad)?;
                ClientEvent::Reconnect {
                    session: s.parse().map_err(|_| bad())?,
                    last_ack: WrapCount::parse(a).ok_or_else(bad)?,
                }
            }
            "WINDOW-CONTENTS" => {
                let (c, blob) = text.split_once(',').ok_or_else(bad)?;
                ClientEvent::WindowContents {
                    count: WrapCount::parse(c).ok_or_else(bad)?,
                    blob: blob.to_string(),
                }
            }
            "VERSION" => ClientEvent::Version(text.to_string()),
            "FOCUSED" => ClientEvent::Focused(text.trim().parse().map_err(|_| bad())?),
            "WINDOW-NAME" => ClientEvent::WindowName(serde_json::from_str(text).map_err(|_| bad())?),
            "SESSION-NUMBER-ECHO" => {
                ClientEvent::SessionNumberEcho(text.trim().parse().map_err(|_| bad())?)
            }
            "RESPONSE" => ClientEvent::Response(serde_json::from_str(text)?),
            "CONNECT" => {
                if text.trim().is_empty() {
                    ClientEvent::Connect(ConnectRequest::default())
                } else {
                    ClientEvent::Connect(serde_json::from_str(text)?)
                }
            }
            other => ClientEvent::Unknown(other.to_string()),
        })
    }
}

/// `KEY` carries either a JSON string or `code\tname\t<json string>`.
fn parse_key(text: &str) -> Option<Vec<u8>> {
    let json = match text.splitn(3, '\t').collect::<Vec<_>>().as_slice() {
        [_code, _name, json] => *json,
        _ => text,
    };
    serde_json::from_str::<String>(json)
        .ok()
        .map(String::into_bytes)
}
