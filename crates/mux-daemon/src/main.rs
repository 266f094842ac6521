//! relay-mux: run as the session daemon (`--server`) or hand a command to
//! the running daemon, starting one if needed.
//!
//! Usage: relay-mux [options] [command [args...]]

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use relay_mux::client::{self, Invocation};
use relay_mux::cmdsock::StdioMode;
use relay_mux::{daemon, Config};

#[derive(Parser, Debug)]
#[command(name = "relay-mux", version, about = "Terminal sessions that outlive their windows")]
struct Cli {
    /// Run the daemon instead of sending a command.
    #[arg(long)]
    server: bool,
    /// With --server: log to stderr instead of daemon.log.
    #[arg(long)]
    foreground: bool,
    #[arg(long, env = "RELAY_MUX_DIR")]
    data_dir: Option<PathBuf>,
    /// JSON settings file.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long, value_enum)]
    stdio: Option<StdioMode>,
    /// Serve the command's window over this process's stdio.
    #[arg(long)]
    browser_pipe: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Command and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

enum LogTarget {
    Stderr,
    File(PathBuf),
}

fn init_logging(default_level: &str, verbose: u8, target: LogTarget) {
    let level = match verbose {
        0 => default_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogTarget::File(path) => match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).try_init(),
            Err(err) => {
                eprintln!("relay-mux: cannot open log file {}: {err}", path.display());
                builder.with_writer(std::io::stderr).try_init()
            }
        },
    };
    if let Err(err) = result {
        eprintln!("relay-mux: logging setup failed: {err}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::resolve(cli.data_dir.clone(), cli.settings.as_deref(), cli.stdio) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("relay-mux: {err}");
            process::exit(1);
        }
    };

    if cli.server {
        let target = if cli.foreground {
            LogTarget::Stderr
        } else {
            if let Err(err) = config.ensure_data_dir() {
                eprintln!("relay-mux: {err}");
                process::exit(1);
            }
            LogTarget::File(config.log_file.clone())
        };
        init_logging("info", cli.verbose, target);
        // Sessions outlive the terminal that started us.
        unsafe {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
        }
        if let Err(err) = daemon::serve(config).await {
            error!(error = %err, "daemon failed");
            eprintln!("relay-mux: {err}");
            process::exit(1);
        }
        return;
    }

    init_logging("warn", cli.verbose, LogTarget::Stderr);
    let invocation = Invocation {
        argv: cli.command,
        options: cli.browser_pipe.then(client::browser_pipe_options),
        settings_path: cli.settings,
    };
    // Exit directly: a stdin reader may still be blocked.
    match client::run(&config, invocation).await {
        Ok(code) => process::exit(code as i32),
        Err(err) => {
            eprintln!("relay-mux: {err}");
            process::exit(1);
        }
    }
}
