//! Pseudo-terminal plumbing: spawning children, packet-mode framing, termios
//! queries and the async read/write loops over the master side.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::Signal;
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};
use nix::unistd::{fork, ForkResult, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::error::{MuxError, Result};
use crate::event::WinSize;

/// Leading byte of a packet-mode read carrying ordinary data.
pub const TIOCPKT_DATA: u8 = 0;
/// Set in the leading byte when the slave's termios changed.
pub const TIOCPKT_IOCTL: u8 = 0x40;

pub const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacketMode {
    #[default]
    Off,
    Packet,
    Extproc,
}

impl PacketMode {
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("yes") | Some("true") => PacketMode::Packet,
            Some("extproc") => PacketMode::Extproc,
            _ => PacketMode::Off,
        }
    }

    fn header_len(self) -> usize {
        match self {
            PacketMode::Off => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// `KEY=VALUE` entries, passed to the child verbatim.
    pub env: Vec<String>,
}

impl CommandLine {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Replace or add `key=value`.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        match self
            .env
            .iter_mut()
            .find(|kv| kv.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(slot) => *slot = entry,
            None => self.env.push(entry),
        }
    }
}

// ── Spawning ────────────────────────────────────────────────────────

fn to_winsize(size: WinSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: size.pix_width,
        ws_ypixel: size.pix_height,
    }
}

/// Search `PATH` (from the child's environment, then ours) for `program`.
pub fn resolve_program(program: &str, path_var: Option<&str>) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return is_executable(&p).then_some(p);
    }
    let path = path_var
        .map(str::to_string)
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_else(|| "/usr/bin:/bin".to_string());
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| MuxError::protocol(format!("NUL byte in {s:?}")))
}

/// Start `cmd` on a fresh pty pair and return the nonblocking master side.
pub fn spawn(cmd: &CommandLine, size: WinSize, mode: PacketMode) -> Result<(OwnedFd, Pid)> {
    let exe = resolve_program(&cmd.program, cmd.env_var("PATH")).ok_or_else(|| MuxError::Spawn {
        command: cmd.program.clone(),
        source: io::Error::new(io::ErrorKind::NotFound, "command not found"),
    })?;

    let OpenptyResult { master, slave } = openpty(Some(&to_winsize(size)), None)?;
    if mode != PacketMode::Off {
        let on: libc::c_int = 1;
        // SAFETY: TIOCPKT takes a pointer to an int flag.
        if unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCPKT as _, &on) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if mode == PacketMode::Extproc {
            let mut tio = termios::tcgetattr(&slave)?;
            tio.local_flags.insert(LocalFlags::EXTPROC);
            termios::tcsetattr(&slave, SetArg::TCSANOW, &tio)?;
        }
    }

    // Everything the child needs is allocated before fork.
    let c_exe = cstring(&exe.to_string_lossy())?;
    let c_argv: Vec<CString> = std::iter::once(cstring(&cmd.program)?)
        .chain(cmd.args.iter().map(|a| cstring(a)).collect::<Result<Vec<_>>>()?)
        .collect();
    let c_env: Vec<CString> = cmd.env.iter().map(|e| cstring(e)).collect::<Result<_>>()?;
    let c_cwd = cstring(&cmd.cwd.to_string_lossy())?;
    let argv_ptrs: Vec<*const libc::c_char> = c_argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let env_ptrs: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let exec_failed = b"relay-mux: exec failed\n";

    // SAFETY: the child only makes async-signal-safe calls before execve.
    match unsafe { fork() }? {
        ForkResult::Child => unsafe {
            let slave_fd = slave.as_raw_fd();
            libc::setsid();
            libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            libc::close(master.as_raw_fd());
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            libc::chdir(c_cwd.as_ptr());
            libc::execve(c_exe.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
            libc::write(2, exec_failed.as_ptr() as *const libc::c_void, exec_failed.len());
            libc::_exit(127);
        },
        ForkResult::Parent { child } => {
            drop(slave);
            set_nonblocking(master.as_raw_fd())?;
            Ok((master, child))
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

pub fn resize(fd: BorrowedFd<'_>, size: WinSize) {
    let ws = to_winsize(size);
    // SAFETY: TIOCSWINSZ reads a winsize struct.
    unsafe {
        libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &ws);
    }
}

// ── Packet mode ─────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum PtyRead {
    Data(Vec<u8>),
    /// termios of the slave changed (packet mode only).
    ModeChanged,
    /// Flow-control notification with no payload.
    Control(u8),
    Eof,
}

pub fn decode_read(buf: &[u8], mode: PacketMode) -> PtyRead {
    if mode == PacketMode::Off {
        return PtyRead::Data(buf.to_vec());
    }
    match buf {
        [] => PtyRead::Control(0),
        [TIOCPKT_DATA, rest @ ..] => PtyRead::Data(rest.to_vec()),
        [flags] if flags & TIOCPKT_IOCTL != 0 => PtyRead::ModeChanged,
        [flags, ..] => PtyRead::Control(*flags),
    }
}

// ── termios helpers ─────────────────────────────────────────────────

/// `ESC]71;...BEL` describing line discipline state, for a viewer doing
/// its own line editing.
pub fn mode_report(fd: BorrowedFd<'_>, mode: PacketMode) -> Option<String> {
    let tio = termios::tcgetattr(fd).ok()?;
    let lf = tio.local_flags;
    let cc = |i: SpecialCharacterIndices| tio.control_chars[i as usize];
    let mut out = String::from("\x1b]71; ");
    out.push_str(if lf.contains(LocalFlags::ICANON) { "icanon" } else { "-icanon" });
    out.push_str(if lf.contains(LocalFlags::ECHO) { " echo" } else { " -echo" });
    if mode == PacketMode::Extproc {
        out.push_str(" extproc");
    }
    out.push_str(&format!(
        " intr={} eof={} susp={} quit={} lflag:{:x}\x07",
        cc(SpecialCharacterIndices::VINTR),
        cc(SpecialCharacterIndices::VEOF),
        cc(SpecialCharacterIndices::VSUSP),
        cc(SpecialCharacterIndices::VQUIT),
        lf.bits()
    ));
    Some(out)
}

/// With EXTPROC and ISIG set the viewer edits lines itself, so a single
/// interrupt character must be turned into a signal here.
pub fn key_signal(fd: BorrowedFd<'_>, key: &[u8]) -> Option<Signal> {
    let [ch] = key else {
        return None;
    };
    let tio = termios::tcgetattr(fd).ok()?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if !tio.local_flags.contains(LocalFlags::EXTPROC) {
        return None;
    }
    if !tio.local_flags.contains(LocalFlags::ISIG) {
        return None;
    }
    let cc = |i: SpecialCharacterIndices| tio.control_chars[i as usize];
    if *ch == cc(SpecialCharacterIndices::VINTR) {
        Some(Signal::SIGINT)
    } else if *ch == cc(SpecialCharacterIndices::VSUSP) {
        Some(Signal::SIGTSTP)
    } else if *ch == cc(SpecialCharacterIndices::VQUIT) {
        Some(Signal::SIGQUIT)
    } else {
        None
    }
}

pub fn is_interrupt(fd: BorrowedFd<'_>, key: &[u8]) -> bool {
    let Ok(tio) = termios::tcgetattr(fd) else {
        return false;
    };
    let cc = |i: SpecialCharacterIndices| tio.control_chars[i as usize];
    matches!(key, [ch] if *ch == cc(SpecialCharacterIndices::VINTR) || *ch == cc(SpecialCharacterIndices::VQUIT))
}

/// Deliver `sig` to the foreground process group of the pty.
pub fn signal_foreground(fd: BorrowedFd<'_>, sig: Signal) -> Result<()> {
    let pgrp = nix::unistd::tcgetpgrp(fd)?;
    nix::sys::signal::killpg(pgrp, sig)?;
    Ok(())
}

/// Turn off line editing and echo, used once a tunnel carries raw
/// viewer traffic.
pub fn set_raw(fd: BorrowedFd<'_>) -> Result<()> {
    let mut tio = termios::tcgetattr(fd)?;
    termios::cfmakeraw(&mut tio);
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)?;
    Ok(())
}

/// Read and discard whatever output is queued on the master.
pub fn drain_pending(fd: BorrowedFd<'_>) -> usize {
    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD writes an int.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::FIONREAD as _, &mut pending) } < 0 {
        return 0;
    }
    let mut buf = [0u8; 4096];
    let mut drained = 0usize;
    while drained < pending as usize {
        let want = buf.len().min(pending as usize - drained);
        // SAFETY: reading into a stack buffer of at least `want` bytes.
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, want) };
        if n <= 0 {
            break;
        }
        drained += n as usize;
    }
    drained
}

// ── Async loops ─────────────────────────────────────────────────────

/// Master side shared by the reader and writer tasks.
pub type Master = Arc<AsyncFd<OwnedFd>>;

pub fn register(master: OwnedFd) -> io::Result<Master> {
    Ok(Arc::new(AsyncFd::new(master)?))
}

/// Read once per grant, never more than the granted byte budget.
///
/// Without an outstanding grant nothing is read, so the child blocks once
/// the kernel pty buffer fills.
pub async fn read_loop(
    master: Master,
    mode: PacketMode,
    mut grants: mpsc::UnboundedReceiver<usize>,
    mut deliver: impl FnMut(PtyRead) -> bool,
) {
    let mut buf = vec![0u8; READ_CHUNK + 1];
    'grants: while let Some(budget) = grants.recv().await {
        let want = budget.clamp(1, READ_CHUNK) + mode.header_len();
        loop {
            let mut guard = match master.readable().await {
                Ok(g) => g,
                Err(_) => break 'grants,
            };
            let result = guard.try_io(|inner| {
                // SAFETY: reading into our own buffer of at least `want` bytes.
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        want,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(0)) => break 'grants,
                Ok(Ok(n)) => {
                    if !deliver(decode_read(&buf[..n], mode)) {
                        return;
                    }
                    continue 'grants;
                }
                // EIO once the child side is gone.
                Ok(Err(_)) => break 'grants,
                Err(_would_block) => continue,
            }
        }
    }
    deliver(PtyRead::Eof);
}

pub async fn write_loop(master: Master, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        let mut written = 0;
        while written < data.len() {
            let mut guard = match master.writable().await {
                Ok(g) => g,
                Err(_) => return,
            };
            let rest = &data[written..];
            match guard.try_io(|inner| {
                // SAFETY: writing from a live slice.
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        rest.as_ptr() as *const libc::c_void,
                        rest.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "pty write failed");
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    }
}

pub fn borrow(master: &Master) -> BorrowedFd<'_> {
    master.get_ref().as_fd()
}
