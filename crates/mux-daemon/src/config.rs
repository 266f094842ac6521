//! Daemon configuration: filesystem layout plus a JSON settings object that
//! is looked up by dotted key.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde_json::{Map, Value};

use crate::cmdsock::StdioMode;
use crate::error::Result;
use crate::pty::PacketMode;

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REMOTE_INTERVAL: Duration = Duration::from_secs(10);

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings(Map<String, Value>);

impl Settings {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Settings(map),
            _ => Settings::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::from_value(serde_json::from_str(&text)?))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A flat `"a.b"` entry wins over a nested `{"a": {"b": ..}}` one.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.0.get(key) {
            return Some(v);
        }
        let mut parts = key.split('.');
        let mut cur = self.0.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" | "yes" | "on" => Some(true),
                "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Seconds, fractional allowed.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get_f64(key)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Copy with `overlay` entries taking precedence.
    pub fn layered(&self, overlay: &Map<String, Value>) -> Settings {
        let mut merged = self.0.clone();
        for (k, v) in overlay {
            merged.insert(k.clone(), v.clone());
        }
        Settings(merged)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// Keepalive and stall detection for tunneled links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTimings {
    /// How often the local side writes a keepalive into the tunnel.
    pub input_interval: Duration,
    pub output_interval: Duration,
    pub input_timeout: Duration,
    pub output_timeout: Option<Duration>,
}

impl RemoteTimings {
    pub fn from_settings(settings: &Settings) -> Self {
        let input_interval = settings
            .get_duration("remote-input-interval")
            .unwrap_or(DEFAULT_REMOTE_INTERVAL);
        Self {
            input_interval,
            output_interval: settings
                .get_duration("remote-output-interval")
                .unwrap_or(DEFAULT_REMOTE_INTERVAL),
            input_timeout: settings
                .get_duration("remote-input-timeout")
                .unwrap_or(input_interval * 2),
            output_timeout: settings.get_duration("remote-output-timeout"),
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub command_socket: PathBuf,
    pub display_socket: PathBuf,
    pub log_file: PathBuf,
    pub stdio: StdioMode,
    pub settings: Settings,
}

impl Config {
    pub fn new(data_dir: PathBuf, settings: Settings, stdio: StdioMode) -> Self {
        Self {
            command_socket: data_dir.join("command.sock"),
            display_socket: data_dir.join("display.sock"),
            log_file: data_dir.join("daemon.log"),
            data_dir,
            stdio,
            settings,
        }
    }

    pub fn resolve(
        data_dir: Option<PathBuf>,
        settings_path: Option<&Path>,
        stdio: Option<StdioMode>,
    ) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let settings = match settings_path {
            Some(p) => Settings::load(p)?,
            None => Settings::default(),
        };
        Ok(Self::new(data_dir, settings, stdio.unwrap_or_default()))
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.data_dir)?;
        Ok(())
    }

    pub fn close_signal(&self) -> Signal {
        self.settings
            .get_str("close-signal")
            .and_then(|s| {
                let name = if s.starts_with("SIG") { s.to_string() } else { format!("SIG{s}") };
                Signal::from_str(&name).ok()
            })
            .unwrap_or(Signal::SIGHUP)
    }

    pub fn close_timeout(&self) -> Duration {
        self.settings
            .get_duration("close-timeout")
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT)
    }

    pub fn packet_mode(&self) -> PacketMode {
        PacketMode::from_setting(self.settings.get_str("tty-packet-mode"))
    }

    pub fn remote_timings(&self) -> RemoteTimings {
        RemoteTimings::from_settings(&self.settings)
    }

    pub fn default_shell(&self) -> Vec<String> {
        if let Some(cmd) = self.settings.get_str("shell.default") {
            let words: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if !words.is_empty() {
                return words;
            }
        }
        vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())]
    }

    pub fn ssh_command(&self) -> String {
        self.settings.get_str("command.ssh").unwrap_or("ssh").to_string()
    }

    pub fn remote_command(&self) -> String {
        self.settings
            .get_str("command.remote")
            .unwrap_or("relay-mux")
            .to_string()
    }
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    PathBuf::from(home).join(".relay-mux")
}
