//! Framing for the viewer byte stream.
//!
//! Viewer → daemon: plain bytes are keyboard input; `0xFD NAME SP payload LF`
//! is an event record; `0xFD LF` is a literal 0xFD byte.
//!
//! Daemon → viewer: plain bytes are pty output; control sequences are wrapped
//! in `0x13 0x16 ... 0x14` so the terminal parser can tell them apart.

use crate::counter::WrapCount;
use crate::error::EventError;

pub const EVENT_MARKER: u8 = 0xFD;
pub const URGENT_START: u8 = 0x13;
pub const URGENT_OOB: u8 = 0x16;
pub const URGENT_END: u8 = 0x14;

// ── Inbound decoding ────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Data(&'a [u8]),
    Event(RawEvent<'a>),
}

#[derive(Debug, PartialEq, Eq)]
pub struct RawEvent<'a> {
    pub name: &'a str,
    pub payload: &'a [u8],
    /// The whole record including marker and newline.
    pub raw: &'a [u8],
}

impl RawEvent<'_> {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(self.payload).unwrap_or("")
    }
}

/// Decode the next segment at the front of `buf`.
///
/// Returns the segment and the number of bytes it spans, or `None` when the
/// buffer is empty or starts with a record whose newline has not arrived.
pub fn next_segment(buf: &[u8]) -> Option<(Inbound<'_>, usize)> {
    if buf.is_empty() {
        return None;
    }
    if buf[0] != EVENT_MARKER {
        let end = buf
            .iter()
            .position(|&b| b == EVENT_MARKER)
            .unwrap_or(buf.len());
        return Some((Inbound::Data(&buf[..end]), end));
    }
    let nl = buf.iter().position(|&b| b == b'\n')?;
    if nl == 1 {
        return Some((Inbound::Data(&buf[..1]), 2));
    }
    let body = &buf[1..nl];
    let name_end = body.iter().position(|&b| b == b' ').unwrap_or(body.len());
    let mut payload_start = name_end;
    while payload_start < body.len() && body[payload_start] == b' ' {
        payload_start += 1;
    }
    let name = std::str::from_utf8(&body[..name_end]).unwrap_or("");
    Some((
        Inbound::Event(RawEvent {
            name,
            payload: &body[payload_start..],
            raw: &buf[..=nl],
        }),
        nl + 1,
    ))
}

// ── Inbound encoding ────────────────────────────────────────────────

pub fn encode_event(name: &str, payload: &[u8]) -> Result<Vec<u8>, EventError> {
    if name.is_empty() || name.bytes().any(|b| b == b' ' || b == b'\n' || b == EVENT_MARKER) {
        return Err(EventError::BadName);
    }
    if let Some(&b) = payload.iter().find(|&&b| b == b'\n' || b == EVENT_MARKER) {
        return Err(EventError::ReservedByte(b));
    }
    // The decoder skips spaces after the name.
    if payload.first() == Some(&b' ') {
        return Err(EventError::ReservedByte(b' '));
    }
    let mut out = Vec::with_capacity(name.len() + payload.len() + 3);
    out.push(EVENT_MARKER);
    out.extend_from_slice(name.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload);
    out.push(b'\n');
    Ok(out)
}

/// Encode an event whose payload is JSON. Serialized JSON never contains a
/// raw newline and is valid UTF-8, so this cannot fail.
pub fn encode_json_event(name: &str, value: &serde_json::Value) -> Vec<u8> {
    let mut out = vec![EVENT_MARKER];
    out.extend_from_slice(name.as_bytes());
    out.push(b' ');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'\n');
    out
}

/// Escape input bytes so that any literal 0xFD survives decoding.
pub fn encode_literal(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == EVENT_MARKER {
            out.push(b'\n');
        }
    }
    out
}

// ── Outbound control sequences ──────────────────────────────────────

pub fn push_urgent(out: &mut Vec<u8>, seq: &[u8]) {
    out.reserve(seq.len() + 3);
    out.push(URGENT_START);
    out.push(URGENT_OOB);
    out.extend_from_slice(seq);
    out.push(URGENT_END);
}

pub fn urgent_wrap(seq: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(seq.len() + 3);
    push_urgent(&mut out, seq);
    out
}

/// Link-state notices, sent as `ESC[99;<code>u`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Ended = 99,
    Disconnected = 98,
    TimedOut = 97,
    Reconnected = 96,
    Reconnecting = 95,
}

pub fn link_status(status: LinkStatus) -> String {
    format!("\x1b[99;{}u", status as u8)
}

pub const REQUEST_CONTENTS: &str = "\x1b[81u";
pub const REPLAY_START: &str = "\x1b[97u";
pub const REPLAY_END: &str = "\x1b[98u";

pub fn replay_sync(count: WrapCount) -> String {
    format!("\x1b[96;{}u", count)
}

pub fn window_identity(name_unique: u8, session: u32, pane: u32, connection: u32) -> String {
    format!("\x1b[91;{};{};{};{}u", name_unique, session, pane + 1, connection)
}

pub fn osc(code: u32, text: &str) -> String {
    format!("\x1b]{};{}\x07", code, text)
}

pub fn upload_settings(json: &str) -> String {
    osc(89, json)
}

pub fn request_settings(json: &str) -> String {
    osc(88, json)
}

pub fn child_pid(pid: i32) -> String {
    osc(31, &pid.to_string())
}

pub fn session_name(name: &str) -> String {
    osc(30, name)
}

pub fn stored_snapshot(count: WrapCount, blob: &str) -> String {
    format!("\x1b]103;{},{}\x07", count, blob)
}

pub fn detach_save(code: u8) -> String {
    format!("\x1b[82;{}u", code)
}

pub fn pending_request(json: &str) -> String {
    osc(97, json)
}

pub fn size_echo(rows: u16, cols: u16) -> String {
    format!("\x1b[8;{};{};8t", rows, cols)
}
