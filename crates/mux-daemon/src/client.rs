//! The short-lived side of the command socket: send one request, copy the
//! reply to our stdio, exit with the daemon's status.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::cmdsock::{self, ClientOutput, CommandRequest, StdioMode};
use crate::config::Config;
use crate::error::{MuxError, Result};

const STARTUP_WAIT: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(50);

/// Commands that have nothing to do when no daemon is running.
const NEEDS_NO_DAEMON: &[&str] = &["list", "status", "kill-server"];

pub struct Invocation {
    pub argv: Vec<String>,
    pub options: Option<Map<String, Value>>,
    /// Settings file handed to a daemon we start ourselves.
    pub settings_path: Option<PathBuf>,
}

impl Invocation {
    pub fn request(&self) -> Result<CommandRequest> {
        let cwd = std::env::current_dir()?;
        Ok(CommandRequest {
            cwd: cwd.to_string_lossy().into_owned(),
            argv: self.argv.clone(),
            env: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
            options: self.options.clone(),
        })
    }
}

/// Options a `--browser-pipe` invocation sends along.
pub fn browser_pipe_options() -> Map<String, Value> {
    let mut options = Map::new();
    options.insert("display".into(), Value::String("browser-pipe".into()));
    options
}

/// Run one client invocation and return its exit status.
pub async fn run(config: &Config, invocation: Invocation) -> Result<u8> {
    let request = invocation.request()?;
    let stream = match UnixStream::connect(&config.command_socket).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "no daemon answering");
            let verb = invocation.argv.first().map(String::as_str).unwrap_or("");
            if NEEDS_NO_DAEMON.contains(&verb) {
                if verb != "kill-server" {
                    println!("(no sessions)");
                }
                return Ok(0);
            }
            start_daemon(config, invocation.settings_path.as_deref())?;
            connect_retrying(&config.command_socket).await?
        }
    };
    match config.stdio {
        StdioMode::FdPassing => run_fd_passing(stream, &request).await,
        StdioMode::Multiplexed => run_multiplexed(stream, &request, tokio::io::stdin()).await,
    }
}

/// Start `relay-mux --server` detached from our terminal.
fn start_daemon(config: &Config, settings: Option<&Path>) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("--server").arg("--data-dir").arg(&config.data_dir);
    if let Some(path) = settings {
        cmd.arg("--settings").arg(path);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    let child = cmd.spawn().map_err(|source| MuxError::Spawn {
        command: exe.display().to_string(),
        source,
    })?;
    info!(pid = child.id(), "started daemon");
    Ok(())
}

async fn connect_retrying(path: &Path) -> Result<UnixStream> {
    let deadline = Instant::now() + STARTUP_WAIT;
    loop {
        match UnixStream::connect(path).await {
            Ok(s) => return Ok(s),
            Err(e) if Instant::now() >= deadline => return Err(e.into()),
            Err(_) => tokio::time::sleep(STARTUP_POLL).await,
        }
    }
}

/// Pass our stdin/stdout/stderr with the first bytes of the request; only
/// the exit status comes back on the socket.
async fn run_fd_passing(mut stream: UnixStream, request: &CommandRequest) -> Result<u8> {
    let bytes = request.encode()?;
    let fds = [
        std::io::stdin().as_raw_fd(),
        std::io::stdout().as_raw_fd(),
        std::io::stderr().as_raw_fd(),
    ];
    let sent = loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || cmdsock::send_with_fds(stream.as_raw_fd(), &bytes, &fds)) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    };
    stream.write_all(&bytes[sent..]).await?;

    let mut transport = StdioMode::FdPassing.transport();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    let mut out = Vec::new();
    transport.decode_reply(&reply, &mut out);
    match out.last() {
        Some(ClientOutput::Exit(code)) => Ok(*code),
        _ => {
            warn!("daemon closed the connection without a status");
            Ok(1)
        }
    }
}

/// Everything travels on the socket: our stdin after the request, the
/// daemon's stdout/stderr/status interleaved on the way back.
async fn run_multiplexed<I>(stream: UnixStream, request: &CommandRequest, mut stdin: I) -> Result<u8>
where
    I: AsyncRead + Unpin + Send + 'static,
{
    let (mut read, mut write) = stream.into_split();
    write.write_all(&request.encode()?).await?;

    let input = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut stdin, &mut write).await {
            debug!(error = %e, "stdin forwarding stopped");
        }
        let _ = write.shutdown().await;
    });

    let mut transport = StdioMode::Multiplexed.transport();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut buf = vec![0u8; 64 * 1024];
    let mut out = Vec::new();
    let status = 'read: loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            warn!("daemon closed the connection without a status");
            break 'read 1;
        }
        out.clear();
        transport.decode_reply(&buf[..n], &mut out);
        for item in out.drain(..) {
            match item {
                ClientOutput::Stdout(b) => {
                    stdout.write_all(&b).await?;
                    stdout.flush().await?;
                }
                ClientOutput::Stderr(b) => {
                    stderr.write_all(&b).await?;
                    stderr.flush().await?;
                }
                ClientOutput::Exit(code) => break 'read code,
            }
        }
    };
    input.abort();
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_cwd_and_env() {
        let inv = Invocation {
            argv: vec!["list".into()],
            options: Some(browser_pipe_options()),
            settings_path: None,
        };
        let req = inv.request().unwrap();
        assert_eq!(req.argv, vec!["list"]);
        assert!(!req.cwd.is_empty());
        assert!(req.env.iter().all(|kv| kv.contains('=')));
        assert_eq!(req.options.unwrap()["display"], "browser-pipe");
    }

    #[tokio::test]
    async fn kill_server_without_daemon_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), Default::default(), StdioMode::Multiplexed);
        let inv = Invocation { argv: vec!["kill-server".into()], options: None, settings_path: None };
        assert_eq!(run(&config, inv).await.unwrap(), 0);
        assert!(!config.command_socket.exists());
    }

    #[tokio::test]
    async fn multiplexed_reply_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let incoming = cmdsock::read_request(&stream).await.unwrap();
            assert_eq!(incoming.request.argv, vec!["status"]);
            let mut stream = stream;
            stream.write_all(b"\x02ok\n\x01\x03").await.unwrap();
        });
        let stream = UnixStream::connect(&path).await.unwrap();
        let request = CommandRequest { cwd: "/".into(), argv: vec!["status".into()], ..Default::default() };
        assert_eq!(run_multiplexed(stream, &request, tokio::io::empty()).await.unwrap(), 3);
        server.await.unwrap();
    }
}
