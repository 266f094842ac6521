//! Opening a viewer window for a URL.

use std::path::Path;
use std::process::Stdio;

use tracing::info;

use crate::cmdsock::CommandReply;
use crate::commands::DisplayChoice;
use crate::error::{MuxError, Result};

pub trait Launcher {
    fn launch(&self, url: &str, reply: &CommandReply) -> Result<()>;
}

/// Where a viewer finds window `window` of session `session`.
pub fn viewer_url(display_socket: &Path, session: u32, window: u32) -> String {
    format!(
        "relay-mux+unix://{}#session-number={};window={}",
        display_socket.display(),
        session,
        window
    )
}

pub fn for_choice(choice: &DisplayChoice) -> Box<dyn Launcher> {
    match choice {
        DisplayChoice::Command(template) => Box::new(ShellLauncher { template: template.clone() }),
        DisplayChoice::PrintUrl | DisplayChoice::Detached | DisplayChoice::BrowserPipe => Box::new(PrintUrl),
    }
}

pub struct PrintUrl;

impl Launcher for PrintUrl {
    fn launch(&self, url: &str, reply: &CommandReply) -> Result<()> {
        reply.out(format!("{url}\n"));
        Ok(())
    }
}

/// Runs `sh -c TEMPLATE` with `%U` replaced by the quoted URL, or the URL
/// appended when the template has no `%U`.
pub struct ShellLauncher {
    pub template: String,
}

impl ShellLauncher {
    pub fn command_line(&self, url: &str) -> String {
        let quoted = shell_quote(url);
        if self.template.contains("%U") {
            self.template.replace("%U", &quoted)
        } else {
            format!("{} {}", self.template, quoted)
        }
    }
}

impl Launcher for ShellLauncher {
    fn launch(&self, url: &str, _reply: &CommandReply) -> Result<()> {
        let line = self.command_line(url);
        info!(command = %line, "launching viewer");
        tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| MuxError::Spawn { command: line, source })?;
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
