//! Commands a client invocation can run against the daemon.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::unix::OwnedReadHalf;
use tracing::{debug, info, warn};

use crate::cmdsock::{CommandReply, CommandRequest};
use crate::config::Settings;
use crate::connection::{Connection, PendingRequest};
use crate::counter::WrapCount;
use crate::daemon::DaemonState;
use crate::error::{MuxError, Result};
use crate::fdio::FdStream;
use crate::launcher;
use crate::proxy::TunnelRelay;
use crate::pty::{self, CommandLine};
use crate::session::ContentsRequest;

// ── Request options ─────────────────────────────────────────────────

/// Where a new window for a session should appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DisplayChoice {
    /// Print a viewer URL on the client's stdout.
    #[default]
    PrintUrl,
    /// Run a shell command with the URL substituted for `%U`.
    Command(String),
    /// No window: the session runs detached.
    Detached,
    /// The client's stdio is itself the viewer link (far end of a tunnel).
    BrowserPipe,
}

impl DisplayChoice {
    fn parse(value: &str) -> Self {
        match value {
            "print-url" | "" => DisplayChoice::PrintUrl,
            "detached" => DisplayChoice::Detached,
            "browser-pipe" => DisplayChoice::BrowserPipe,
            template => DisplayChoice::Command(template.to_string()),
        }
    }
}

/// Per-request view of the settings plus the client's environment.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub cwd: PathBuf,
    pub env: Vec<String>,
    /// Daemon settings with the request's options layered on top.
    pub settings: Settings,
    /// Options the client passed, forwarded to its windows.
    pub request_settings: Map<String, Value>,
    pub display: DisplayChoice,
}

impl RequestOptions {
    pub fn from_settings(settings: Settings) -> Self {
        let display = settings
            .get_str("display.command")
            .map(DisplayChoice::parse)
            .unwrap_or_default();
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| "/".into()),
            env: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
            settings,
            request_settings: Map::new(),
            display,
        }
    }

    pub fn from_request(request: &CommandRequest, base: &Settings) -> Self {
        let mut extra = request.options.clone().unwrap_or_default();
        let display = extra.remove("display");
        let settings = base.layered(&extra);
        let display = match display.as_ref().and_then(Value::as_str) {
            Some(d) => DisplayChoice::parse(d),
            None => settings
                .get_str("display.command")
                .map(DisplayChoice::parse)
                .unwrap_or_default(),
        };
        Self {
            cwd: request.cwd.clone().into(),
            env: request.env.clone(),
            settings,
            request_settings: extra,
            display,
        }
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find_map(|kv| kv.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
    }

    /// Take leading `--detached`, `--print-url`, `--browser-pipe` and
    /// `--display=CMD` flags off `args`.
    pub fn take_display_flags(&mut self, args: &mut Vec<String>) {
        while let Some(first) = args.first() {
            let choice = match first.as_str() {
                "--detached" | "-d" => DisplayChoice::Detached,
                "--print-url" => DisplayChoice::PrintUrl,
                "--browser-pipe" => DisplayChoice::BrowserPipe,
                other => match other.strip_prefix("--display=") {
                    Some(cmd) => DisplayChoice::parse(cmd),
                    None => break,
                },
            };
            self.display = choice;
            args.remove(0);
        }
    }
}

// ── Client plumbing ─────────────────────────────────────────────────

/// Where a client's stdin arrives: a passed descriptor or the socket.
pub enum ClientInput {
    Fd(FdStream),
    Socket(OwnedReadHalf),
}

impl AsyncRead for ClientInput {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientInput::Fd(f) => Pin::new(f).poll_read(cx, buf),
            ClientInput::Socket(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

/// A decoded request with the means to answer it.
pub struct CommandContext {
    pub request: CommandRequest,
    pub reply: CommandReply,
    pub options: Arc<RequestOptions>,
    /// Client stdin plus bytes read past the request, for commands that
    /// turn the client into a relay.
    pub input: Option<(ClientInput, Vec<u8>)>,
}

impl CommandContext {
    pub fn new(request: CommandRequest, reply: CommandReply, input: Option<(ClientInput, Vec<u8>)>) -> Self {
        Self { request, reply, options: Arc::default(), input }
    }
}

pub enum Outcome {
    Done(u8),
    /// The reply is finished later, by a window or a session.
    Waiting,
}

type Action = fn(&mut DaemonState, &mut CommandContext, &[String]) -> Result<Outcome>;

const COMMANDS: &[(&str, Action)] = &[
    ("new", new),
    ("attach", attach),
    ("reattach", reattach),
    ("list", list),
    ("status", status),
    ("capture", capture),
    ("await", await_window),
    ("browse", browse),
    ("kill-server", kill_server),
];

pub fn lookup(verb: &str) -> Option<Action> {
    COMMANDS.iter().find(|(name, _)| *name == verb).map(|(_, a)| *a)
}

pub fn is_command(verb: &str) -> bool {
    lookup(verb).is_some()
}

// ── Dispatch ────────────────────────────────────────────────────────

impl DaemonState {
    pub fn run_command(&mut self, mut ctx: CommandContext) {
        let mut options = RequestOptions::from_request(&ctx.request, &self.config.settings);
        let mut argv = ctx.request.argv.clone();
        options.take_display_flags(&mut argv);
        ctx.options = Arc::new(options);
        let reply = ctx.reply.clone();

        let result = self.dispatch_command(&mut ctx, &argv);
        match result {
            Ok(Outcome::Done(code)) => reply.finish(code),
            Ok(Outcome::Waiting) => {}
            Err(e) => {
                debug!(argv = ?argv, error = %e, "command failed");
                reply.err(format!("relay-mux: {e}\n"));
                reply.finish(1);
            }
        }
    }

    fn dispatch_command(&mut self, ctx: &mut CommandContext, argv: &[String]) -> Result<Outcome> {
        let Some(verb) = argv.first() else {
            return new(self, ctx, &[]);
        };
        let mut rest = argv[1..].to_vec();
        if let Some(action) = lookup(verb) {
            if verb != "reattach" {
                Arc::make_mut(&mut ctx.options).take_display_flags(&mut rest);
            }
            return action(self, ctx, &rest);
        }
        if verb.contains('@') {
            return self.remote(ctx, verb, rest);
        }
        let runnable = verb.contains('/') || pty::resolve_program(verb, ctx.options.env_var("PATH")).is_some();
        if runnable {
            return new(self, ctx, argv);
        }
        Err(MuxError::UnknownCommand(verb.clone()))
    }

    fn remote(&mut self, ctx: &mut CommandContext, host: &str, args: Vec<String>) -> Result<Outcome> {
        let relay = TunnelRelay::Client { reply: ctx.reply.clone(), input: ctx.input.take() };
        self.open_tunnel(host, args, ctx.options.clone(), relay)?;
        Ok(Outcome::Waiting)
    }

    /// Show session `sid` the way the request asked for.
    pub fn display(&mut self, ctx: &mut CommandContext, sid: u32) -> Result<Outcome> {
        match ctx.options.display.clone() {
            DisplayChoice::Detached => {
                if let Some(s) = self.sessions.get_mut(sid) {
                    s.detach_count += 1;
                }
                self.start_session(sid)?;
                info!(session = sid, "started detached");
                Ok(Outcome::Done(0))
            }
            DisplayChoice::BrowserPipe => {
                let input = ctx.input.take();
                self.display_pipe_session(sid, ctx.options.clone(), ctx.reply.clone(), input, None);
                Ok(Outcome::Waiting)
            }
            DisplayChoice::PrintUrl | DisplayChoice::Command(_) => {
                self.launch_window(ctx.options.clone(), &ctx.reply, sid, |_| {})?;
                Ok(Outcome::Done(0))
            }
        }
    }

    /// Create a window connection for `sid`, waiting for its viewer, and
    /// hand its URL to the launcher.
    pub fn launch_window(
        &mut self,
        options: Arc<RequestOptions>,
        reply: &CommandReply,
        sid: u32,
        configure: impl FnOnce(&mut Connection),
    ) -> Result<u32> {
        let launcher = launcher::for_choice(&options.display);
        let window = self.create_connection(options, None);
        let url = launcher::viewer_url(&self.config.display_socket, sid, window);
        if let Some(c) = self.connections.get_mut(window) {
            c.url = Some(url.clone());
            configure(c);
        }
        self.link(window, sid);
        if let Err(e) = launcher.launch(&url, reply) {
            self.destroy_connection(window);
            return Err(e);
        }
        Ok(window)
    }

    fn pending_request(&mut self, window: u32, reply: &CommandReply, request: Value, close_response: Option<String>) {
        let Some(c) = self.connections.get_mut(window) else {
            return;
        };
        let reply = reply.clone();
        c.pending.enter_with(None, |_| false, move |id| {
            let mut request = request;
            request["id"] = json!(id);
            PendingRequest { id, reply, unsent: Some(request.to_string()), close_response }
        });
        self.mark_dirty(window);
    }
}

// ── Commands ────────────────────────────────────────────────────────

fn new(state: &mut DaemonState, ctx: &mut CommandContext, args: &[String]) -> Result<Outcome> {
    let words = if args.is_empty() {
        state.config.default_shell()
    } else {
        args.to_vec()
    };
    let command = CommandLine {
        program: words[0].clone(),
        args: words[1..].to_vec(),
        cwd: ctx.options.cwd.clone(),
        env: ctx.options.env.clone(),
    };
    let sid = state.create_session(command, None, true);
    state.display(ctx, sid)
}

fn attach(state: &mut DaemonState, ctx: &mut CommandContext, args: &[String]) -> Result<Outcome> {
    let spec = args.first().map(String::as_str).unwrap_or("");
    let sid = state
        .find_session(spec)
        .ok_or_else(|| MuxError::NoSuchSession(spec.to_string()))?;
    if let Some(s) = state.sessions.get_mut(sid) {
        let no_history = s.history.as_ref().map(|h| h.is_empty()).unwrap_or(true);
        if no_history && !s.connections.is_empty() && s.requesting_contents == ContentsRequest::Idle {
            s.requesting_contents = ContentsRequest::Wanted;
        }
    }
    state.mark_session_dirty(sid);
    state.display(ctx, sid)
}

/// `reattach SESSION,COUNT`: resume a tunnel from the far side.
fn reattach(state: &mut DaemonState, ctx: &mut CommandContext, args: &[String]) -> Result<Outcome> {
    let arg = args.iter().find(|a| !a.starts_with("--")).map(String::as_str).unwrap_or("");
    let bad = || MuxError::protocol(format!("reattach expects SESSION,COUNT, got {arg:?}"));
    let (session, count) = arg.split_once(',').ok_or_else(bad)?;
    let sid: u32 = session.parse().map_err(|_| bad())?;
    let count = WrapCount::parse(count).ok_or_else(bad)?;
    if !state.sessions.valid(sid) {
        return Err(MuxError::NoSuchSession(session.to_string()));
    }
    if ctx.options.display != DisplayChoice::BrowserPipe {
        return Err(MuxError::protocol("reattach is only valid with --browser-pipe"));
    }
    let input = ctx.input.take();
    state.display_pipe_session(sid, ctx.options.clone(), ctx.reply.clone(), input, Some(count));
    Ok(Outcome::Waiting)
}

fn list(state: &mut DaemonState, ctx: &mut CommandContext, _args: &[String]) -> Result<Outcome> {
    ctx.reply.out(list_text(state));
    Ok(Outcome::Done(0))
}

pub fn list_text(state: &DaemonState) -> String {
    if state.sessions.is_empty() {
        return "(no sessions)\n".to_string();
    }
    let mut out = String::new();
    for s in state.sessions.iter() {
        out.push_str(&format!("pid: {}, session#: {}", s.pid_raw(), s.id));
        if let Some(name) = &s.name {
            out.push_str(&format!(", name: {name}"));
        }
        out.push_str(&format!(", #windows: {}\n", s.connections.len()));
    }
    out
}

fn status(state: &mut DaemonState, ctx: &mut CommandContext, _args: &[String]) -> Result<Outcome> {
    let mut out = format!(
        "daemon pid: {}, data dir: {}\n",
        std::process::id(),
        state.config.data_dir.display()
    );
    for s in state.sessions.iter() {
        out.push_str(&format!(
            "session#: {}, pid: {}, state: {:?}, output: {}, command: {}",
            s.id,
            s.pid_raw(),
            s.state,
            s.output_count,
            s.command.display()
        ));
        if let Some(t) = &s.transport {
            out.push_str(&format!(", host: {}", t.host));
        }
        if s.paused {
            out.push_str(", paused");
        }
        if s.detach_count > 0 {
            out.push_str(&format!(", detached: {}", s.detach_count));
        }
        out.push('\n');
        for &cid in &s.connections {
            if let Some(c) = state.connections.get(cid) {
                out.push_str(&format!("  {}\n", window_line(c)));
            }
        }
    }
    for c in state.connections.iter().filter(|c| c.session.is_none()) {
        out.push_str(&format!("{} (no session)\n", window_line(c)));
    }
    ctx.reply.out(out);
    Ok(Outcome::Done(0))
}

fn window_line(c: &Connection) -> String {
    let mut line = format!("window#: {}, unconfirmed: {}", c.id, c.unconfirmed());
    if c.primary {
        line.push_str(", primary");
    }
    if c.is_dormant() {
        line.push_str(", dormant");
    }
    if c.proxy != crate::proxy::ProxyMode::None {
        line.push_str(&format!(", proxy: {:?}", c.proxy));
    }
    if let Some(mw) = c.main_window {
        line.push_str(&format!(", main window: {mw}"));
    }
    line
}

fn target_window(state: &DaemonState, args: &[String]) -> Result<u32> {
    let spec = args.first().map(String::as_str).unwrap_or(".");
    state
        .find_window(spec)
        .ok_or_else(|| MuxError::protocol(format!("no such window: {spec}")))
}

/// `capture [WINDOW]`: print the window's contents as its viewer reports them.
fn capture(state: &mut DaemonState, ctx: &mut CommandContext, args: &[String]) -> Result<Outcome> {
    let window = target_window(state, args)?;
    state.pending_request(window, &ctx.reply, json!({"cmd": "capture"}), None);
    Ok(Outcome::Waiting)
}

/// `await WINDOW [PATTERN]`: wait until the window shows PATTERN, or closes.
fn await_window(state: &mut DaemonState, ctx: &mut CommandContext, args: &[String]) -> Result<Outcome> {
    let window = target_window(state, args)?;
    let mut request = json!({"cmd": "await"});
    if let Some(pattern) = args.get(1) {
        request["match"] = json!(pattern);
    }
    state.pending_request(window, &ctx.reply, request, Some("closed\n".to_string()));
    Ok(Outcome::Waiting)
}

fn browse(_state: &mut DaemonState, ctx: &mut CommandContext, args: &[String]) -> Result<Outcome> {
    let url = args
        .first()
        .ok_or_else(|| MuxError::protocol("browse needs a URL"))?;
    launcher::for_choice(&ctx.options.display).launch(url, &ctx.reply)?;
    Ok(Outcome::Done(0))
}

fn kill_server(state: &mut DaemonState, _ctx: &mut CommandContext, _args: &[String]) -> Result<Outcome> {
    warn!("kill-server requested");
    state.shutdown();
    Ok(Outcome::Done(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdsock::ReplyMsg;
    use crate::testing::*;

    fn request(argv: &[&str], options: Value) -> CommandRequest {
        CommandRequest {
            cwd: "/tmp".into(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec!["PATH=/usr/bin:/bin".into()],
            options: options.as_object().cloned(),
        }
    }

    fn run(t: &mut TestDaemon, argv: &[&str], options: Value) -> Vec<ReplyMsg> {
        let (reply, mut replies) = test_reply();
        t.state.run_command(CommandContext::new(request(argv, options), reply, None));
        replies.drain()
    }

    fn stdout(msgs: &[ReplyMsg]) -> String {
        msgs.iter()
            .filter_map(|m| match m {
                ReplyMsg::Out(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect()
    }

    // ── Option parsing tests ────────────────────────────────────────

    #[test]
    fn display_from_options_and_settings() {
        let base = Settings::from_value(json!({"display.command": "firefox %U"}));
        let r = request(&["new"], json!({}));
        assert_eq!(
            RequestOptions::from_request(&r, &base).display,
            DisplayChoice::Command("firefox %U".into())
        );
        let r = request(&["new"], json!({"display": "detached", "geometry": "80x24"}));
        let opts = RequestOptions::from_request(&r, &base);
        assert_eq!(opts.display, DisplayChoice::Detached);
        assert!(opts.request_settings.contains_key("geometry"));
        assert!(!opts.request_settings.contains_key("display"));
    }

    #[test]
    fn leading_flags_are_taken() {
        let mut opts = RequestOptions::default();
        let mut args: Vec<String> = ["--browser-pipe", "bash", "--detached"].map(String::from).to_vec();
        opts.take_display_flags(&mut args);
        assert_eq!(opts.display, DisplayChoice::BrowserPipe);
        assert_eq!(args, vec!["bash", "--detached"]);
    }

    // ── Command tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn list_with_no_sessions() {
        let mut t = TestDaemon::new();
        let msgs = run(&mut t, &["list"], json!({}));
        assert_eq!(stdout(&msgs), "(no sessions)\n");
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(0)));
    }

    #[tokio::test]
    async fn new_prints_a_viewer_url_and_waits_to_spawn() {
        let mut t = TestDaemon::new();
        let msgs = run(&mut t, &["new", "/bin/cat"], json!({}));
        let url = stdout(&msgs);
        assert!(url.starts_with("relay-mux+unix://"), "{url}");
        assert!(url.contains("#session-number=1;window=2"), "{url}");
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(0)));
        let s = t.state.sessions.get(1).unwrap();
        assert_eq!(s.state, crate::session::SessionState::Starting);
        assert_eq!(s.connections, vec![2]);
        assert!(t.state.connections.get(2).unwrap().is_dormant());

        let listing = stdout(&run(&mut t, &["list"], json!({})));
        assert_eq!(listing, "pid: 0, session#: 1, #windows: 1\n");
    }

    #[tokio::test]
    async fn program_path_implies_new() {
        let mut t = TestDaemon::new();
        let msgs = run(&mut t, &["/bin/cat"], json!({}));
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(0)));
        assert_eq!(t.state.sessions.len(), 1);
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let mut t = TestDaemon::new();
        let msgs = run(&mut t, &["frobnicate-xyzzy"], json!({}));
        assert!(matches!(&msgs[0], ReplyMsg::Err(e) if String::from_utf8_lossy(e).contains("frobnicate-xyzzy")));
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(1)));
    }

    #[tokio::test]
    async fn attach_to_missing_session_fails() {
        let mut t = TestDaemon::new();
        let msgs = run(&mut t, &["attach", "7"], json!({}));
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(1)));
    }

    #[tokio::test]
    async fn attach_by_name_opens_another_window() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        t.state.sessions.get_mut(sid).unwrap().name = Some("logs".into());
        let (_v, _rx) = viewer(&mut t.state, sid);
        let msgs = run(&mut t, &["attach", "logs"], json!({}));
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(0)));
        assert_eq!(t.state.sessions.get(sid).unwrap().connections.len(), 2);
    }

    #[tokio::test]
    async fn reattach_requires_browser_pipe() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let arg = format!("{sid},0");
        let msgs = run(&mut t, &["reattach", &arg], json!({}));
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(1)));
    }

    #[tokio::test]
    async fn capture_waits_for_the_window() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let (cid, _rx) = viewer(&mut t.state, sid);
        let msgs = run(&mut t, &["capture", &cid.to_string()], json!({}));
        assert!(msgs.is_empty());
        let c = t.state.connections.get(cid).unwrap();
        assert_eq!(c.pending.len(), 1);
        assert!(t.state.dirty.contains(&cid));
    }

    #[tokio::test]
    async fn await_resolves_when_window_closes() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let (cid, _rx) = viewer(&mut t.state, sid);
        let (_other, _rx2) = viewer(&mut t.state, sid);
        let (reply, mut replies) = test_reply();
        t.state.run_command(CommandContext::new(
            request(&["await", &cid.to_string(), "done"], json!({})),
            reply,
            None,
        ));
        t.state.close_window(cid);
        assert_eq!(
            replies.drain(),
            vec![ReplyMsg::Out(b"closed\n".to_vec()), ReplyMsg::Exit(0)]
        );
    }

    #[tokio::test]
    async fn capture_fails_when_window_closes() {
        let mut t = TestDaemon::new();
        let (sid, _io) = running_session(&mut t.state);
        let (cid, _rx) = viewer(&mut t.state, sid);
        let (_other, _rx2) = viewer(&mut t.state, sid);
        let (reply, mut replies) = test_reply();
        t.state.run_command(CommandContext::new(request(&["capture", &cid.to_string()], json!({})), reply, None));
        t.state.close_window(cid);
        let msgs = replies.drain();
        assert!(matches!(&msgs[0], ReplyMsg::Err(e) if e.starts_with(b"Window")));
        assert_eq!(msgs.last(), Some(&ReplyMsg::Exit(1)));
    }
}
